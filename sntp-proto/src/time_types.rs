use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Ticks are the fractional unit of the target time resolution: 100ns.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Unix uses an epoch located at 1/1/1970-00:00h (UTC) and NTP uses 1/1/1900-00:00h.
/// This leads to an offset equivalent to 70 years in seconds
/// there are 17 leap years between the two dates so the offset is
const EPOCH_OFFSET: u64 = (70 * 365 + 17) * 86400;

/// The 136-year window an NTP timestamp is reckoned in. Era A runs from 1900
/// and covers timestamps whose seconds field has its top bit set (1968-2036);
/// era B starts where the seconds field wraps.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NtpEra {
    EraA,
    EraB,
}

impl NtpEra {
    /// The absolute time the seconds field of this era counts from.
    pub fn epoch(self) -> SystemTime {
        match self {
            NtpEra::EraA => UNIX_EPOCH - Duration::from_secs(EPOCH_OFFSET),
            NtpEra::EraB => UNIX_EPOCH + Duration::from_secs((1u64 << 32) - EPOCH_OFFSET),
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Default)]
pub struct NtpTimestamp {
    timestamp: u64,
}

impl NtpTimestamp {
    pub const fn from_bits(bits: [u8; 8]) -> NtpTimestamp {
        NtpTimestamp {
            timestamp: u64::from_be_bytes(bits),
        }
    }

    pub const fn to_bits(self) -> [u8; 8] {
        self.timestamp.to_be_bytes()
    }

    /// The whole-seconds field, era-relative, interpreted as unsigned.
    pub const fn seconds(self) -> u32 {
        (self.timestamp >> 32) as u32
    }

    /// The sub-second field, in units of 1/2^32 seconds.
    pub const fn fraction(self) -> u32 {
        self.timestamp as u32
    }

    pub const fn era(self) -> NtpEra {
        // bit 0 of the wire form selects the era
        if self.seconds() >= (1 << 31) {
            NtpEra::EraA
        } else {
            NtpEra::EraB
        }
    }

    /// Builds a timestamp from a tick count relative to the era epoch. The
    /// count must be non-negative and within the 136-year era range; the era
    /// itself is implied by the magnitude of the resulting seconds field.
    pub fn from_ticks(ticks: i64) -> NtpTimestamp {
        let seconds = ticks / TICKS_PER_SECOND;
        let remainder = ticks % TICKS_PER_SECOND;

        // NTP uses 1/2^32 sec as its unit of fractional time,
        // ticks are 1/10^7 sec
        let fraction = ((remainder as u64) << 32) / TICKS_PER_SECOND as u64;

        NtpTimestamp {
            timestamp: ((seconds as u64) << 32) | fraction,
        }
    }

    /// The era-relative tick count. Truncates the fraction to whole ticks;
    /// ticks are the smallest distinguishable unit, so being off by up to one
    /// tick is fine.
    pub fn to_ticks(self) -> i64 {
        let seconds_ticks = self.seconds() as i64 * TICKS_PER_SECOND;
        let fraction_ticks = (self.fraction() as i64 * TICKS_PER_SECOND) >> 32;
        seconds_ticks + fraction_ticks
    }

    pub fn from_system_time(time: SystemTime) -> Self {
        let dur = time.duration_since(UNIX_EPOCH).unwrap();
        let secs = dur.as_secs() + EPOCH_OFFSET;
        let nanos = dur.subsec_nanos();

        Self::from_seconds_nanos_since_ntp_epoch(secs, nanos)
    }

    pub fn from_seconds_nanos_since_ntp_epoch(seconds: u64, nanos: u32) -> Self {
        // NTP uses 1/2^32 sec as its unit of fractional time.
        // our time is in nanoseconds, so 1/1e9 seconds
        let fraction = ((nanos as u64) << 32) / 1_000_000_000;

        // seconds past the era boundary shift out of the top bits,
        // which is exactly the wrap that puts them in era B
        let timestamp = (seconds << 32) + fraction;
        NtpTimestamp::from_bits(timestamp.to_be_bytes())
    }

    pub fn to_system_time(self) -> SystemTime {
        let nanos = (self.fraction() as u64 * 1_000_000_000) >> 32;
        self.era().epoch() + Duration::from_secs(self.seconds() as u64) + Duration::from_nanos(nanos)
    }

    #[cfg(test)]
    pub(crate) const fn from_fixed_int(timestamp: u64) -> NtpTimestamp {
        NtpTimestamp { timestamp }
    }
}

impl Add<NtpDuration> for NtpTimestamp {
    type Output = NtpTimestamp;

    fn add(self, rhs: NtpDuration) -> Self::Output {
        NtpTimestamp::from_ticks(self.to_ticks() + rhs.ticks)
    }
}

impl AddAssign<NtpDuration> for NtpTimestamp {
    fn add_assign(&mut self, rhs: NtpDuration) {
        *self = *self + rhs;
    }
}

impl Sub for NtpTimestamp {
    type Output = NtpDuration;

    // Differences assume both timestamps belong to the same era; that holds
    // for the four timestamps of one exchange unless client and server
    // disagree by more than 68 years.
    fn sub(self, rhs: Self) -> Self::Output {
        NtpDuration {
            ticks: self.to_ticks() - rhs.to_ticks(),
        }
    }
}

impl Sub<NtpDuration> for NtpTimestamp {
    type Output = NtpTimestamp;

    fn sub(self, rhs: NtpDuration) -> Self::Output {
        NtpTimestamp::from_ticks(self.to_ticks() - rhs.ticks)
    }
}

impl SubAssign<NtpDuration> for NtpTimestamp {
    fn sub_assign(&mut self, rhs: NtpDuration) {
        *self = *self - rhs;
    }
}

/// A signed span of time, denominated in ticks.
#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Default)]
pub struct NtpDuration {
    ticks: i64,
}

impl NtpDuration {
    pub const ZERO: NtpDuration = NtpDuration { ticks: 0 };

    pub const fn from_ticks(ticks: i64) -> NtpDuration {
        NtpDuration { ticks }
    }

    pub const fn as_ticks(self) -> i64 {
        self.ticks
    }

    pub fn from_system_duration(duration: Duration) -> NtpDuration {
        NtpDuration {
            ticks: (duration.as_nanos() / 100) as i64,
        }
    }

    pub fn as_seconds(self) -> f64 {
        self.ticks as f64 / TICKS_PER_SECOND as f64
    }

    pub const fn abs(self) -> NtpDuration {
        NtpDuration {
            ticks: self.ticks.abs(),
        }
    }
}

impl Add for NtpDuration {
    type Output = NtpDuration;

    fn add(self, rhs: Self) -> Self::Output {
        // Saturation ensures addition of two big durations never
        // unintentionally cancels through overflow.
        NtpDuration {
            ticks: self.ticks.saturating_add(rhs.ticks),
        }
    }
}

impl AddAssign for NtpDuration {
    fn add_assign(&mut self, rhs: Self) {
        self.ticks = self.ticks.saturating_add(rhs.ticks);
    }
}

impl Sub for NtpDuration {
    type Output = NtpDuration;

    fn sub(self, rhs: Self) -> Self::Output {
        NtpDuration {
            ticks: self.ticks.saturating_sub(rhs.ticks),
        }
    }
}

impl SubAssign for NtpDuration {
    fn sub_assign(&mut self, rhs: Self) {
        self.ticks = self.ticks.saturating_sub(rhs.ticks);
    }
}

/// Maximum message interval, stored as a log2 exponent of seconds.
///
/// Raw values are kept as-is in the packet; the seconds view clamps the
/// exponent to the significant range of RFC 4330, 4 (16s) through 17
/// (131072s, about 36h).
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct PollInterval(u8);

impl PollInterval {
    pub const MIN: PollInterval = PollInterval(4);
    pub const MAX: PollInterval = PollInterval(17);

    pub const fn from_log(log: u8) -> PollInterval {
        PollInterval(log)
    }

    pub const fn as_log(self) -> u8 {
        self.0
    }

    pub fn as_seconds(self) -> u32 {
        1 << self.0.clamp(Self::MIN.0, Self::MAX.0)
    }

    pub fn from_seconds(seconds: u32) -> PollInterval {
        let log = 31 - seconds.max(1).leading_zeros();
        PollInterval((log as u8).clamp(Self::MIN.0, Self::MAX.0))
    }
}

/// Clock precision, stored as a signed log2 exponent of seconds. Values
/// range from -6 for mains-frequency clocks to -20 for microsecond clocks.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Precision(i8);

impl Precision {
    pub const fn from_log(log: i8) -> Precision {
        Precision(log)
    }

    pub const fn as_log(self) -> i8 {
        self.0
    }

    pub fn as_seconds(self) -> f64 {
        2f64.powi(self.0 as i32)
    }

    pub fn from_seconds(seconds: f64) -> Precision {
        Precision(seconds.log2() as i8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_sub() {
        let a = NtpTimestamp::from_fixed_int(5 << 32);
        let b = NtpTimestamp::from_fixed_int(3 << 32);
        assert_eq!(a - b, NtpDuration::from_ticks(2 * TICKS_PER_SECOND));
        assert_eq!(b - a, NtpDuration::from_ticks(-2 * TICKS_PER_SECOND));
    }

    #[test]
    fn test_timestamp_duration_math() {
        let mut a = NtpTimestamp::from_ticks(5 * TICKS_PER_SECOND);
        let b = NtpDuration::from_ticks(2 * TICKS_PER_SECOND);
        assert_eq!(a + b, NtpTimestamp::from_ticks(7 * TICKS_PER_SECOND));
        assert_eq!(a - b, NtpTimestamp::from_ticks(3 * TICKS_PER_SECOND));
        a += b;
        assert_eq!(a, NtpTimestamp::from_ticks(7 * TICKS_PER_SECOND));
        a -= b;
        assert_eq!(a, NtpTimestamp::from_ticks(5 * TICKS_PER_SECOND));
    }

    #[test]
    fn test_duration_math() {
        let mut a = NtpDuration::from_ticks(5);
        let b = NtpDuration::from_ticks(2);
        assert_eq!(a + b, NtpDuration::from_ticks(7));
        assert_eq!(a - b, NtpDuration::from_ticks(3));
        a += b;
        assert_eq!(a, NtpDuration::from_ticks(7));
        a -= b;
        assert_eq!(a, NtpDuration::from_ticks(5));
        assert_eq!(NtpDuration::from_ticks(-3).abs(), NtpDuration::from_ticks(3));
    }

    #[test]
    fn test_duration_saturation() {
        let big = NtpDuration::from_ticks(i64::MAX - 1);
        assert_eq!(big + big, NtpDuration::from_ticks(i64::MAX));
        let small = NtpDuration::from_ticks(i64::MIN + 1);
        assert_eq!(small - big, NtpDuration::from_ticks(i64::MIN));
    }

    #[test]
    fn test_ticks_roundtrip() {
        for ticks in [
            0,
            1,
            9_999_999,
            TICKS_PER_SECOND,
            TICKS_PER_SECOND + 1,
            1_234_567_890_123,
            37_868_256_000_000_000, // 2020-01-01, relative to 1900
        ] {
            let roundtripped = NtpTimestamp::from_ticks(ticks).to_ticks();
            assert!(
                (roundtripped - ticks).abs() <= 1,
                "{ticks} round-tripped to {roundtripped}"
            );
        }
    }

    #[test]
    fn test_bits_roundtrip() {
        let bits = [0xE3, 0x93, 0x3B, 0x80, 0x80, 0x00, 0x00, 0x00];
        let timestamp = NtpTimestamp::from_bits(bits);
        assert_eq!(timestamp.to_bits(), bits);
        assert_eq!(timestamp.seconds(), 0xE393_3B80);
        assert_eq!(timestamp.fraction(), 0x8000_0000);
        // half a second of fraction is five million ticks
        assert_eq!(timestamp.to_ticks() % TICKS_PER_SECOND, 5_000_000);
    }

    #[test]
    fn test_era_selection() {
        // 2020-01-01T00:00:00Z, ticks relative to the 1900 epoch
        let unix_2020 = 1_577_836_800i64;
        let t = NtpTimestamp::from_ticks((unix_2020 + EPOCH_OFFSET as i64) * TICKS_PER_SECOND);
        assert_eq!(t.era(), NtpEra::EraA);
        assert_eq!(
            t.to_system_time(),
            UNIX_EPOCH + Duration::from_secs(unix_2020 as u64)
        );

        // 2037-01-01T00:00:00Z, ticks relative to the 2036 era boundary
        let unix_2037 = 2_114_380_800i64;
        let era_b_start = (1i64 << 32) - EPOCH_OFFSET as i64;
        let t = NtpTimestamp::from_ticks((unix_2037 - era_b_start) * TICKS_PER_SECOND);
        assert_eq!(t.era(), NtpEra::EraB);
        assert_eq!(
            t.to_system_time(),
            UNIX_EPOCH + Duration::from_secs(unix_2037 as u64)
        );
    }

    #[test]
    fn test_from_system_time_wraps_into_era_b() {
        let unix_2037 = 2_114_380_800u64;
        let t = NtpTimestamp::from_system_time(UNIX_EPOCH + Duration::from_secs(unix_2037));
        assert_eq!(t.era(), NtpEra::EraB);
        // consistent with the tick-count construction
        let era_b_start = (1u64 << 32) - EPOCH_OFFSET;
        assert_eq!(t.seconds() as u64, unix_2037 - era_b_start);
    }

    #[test]
    fn test_from_system_time_matches_ticks() {
        let unix = 1_700_000_000u64;
        let nanos = 123_456_700u32;
        let t = NtpTimestamp::from_system_time(
            UNIX_EPOCH + Duration::new(unix, nanos),
        );
        let expected = (unix as i64 + EPOCH_OFFSET as i64) * TICKS_PER_SECOND
            + nanos as i64 / 100;
        assert!((t.to_ticks() - expected).abs() <= 1);
    }

    #[test]
    fn test_poll_interval_clamping() {
        assert_eq!(PollInterval::from_seconds(1).as_log(), 4);
        assert_eq!(PollInterval::from_seconds(1).as_seconds(), 16);
        assert_eq!(PollInterval::from_seconds(200_000).as_log(), 17);
        assert_eq!(PollInterval::from_seconds(200_000).as_seconds(), 131_072);
        assert_eq!(PollInterval::from_seconds(64).as_log(), 6);
        assert_eq!(PollInterval::from_seconds(0).as_log(), 4);

        // raw values outside the significant range read as the bounds
        assert_eq!(PollInterval::from_log(0).as_seconds(), 16);
        assert_eq!(PollInterval::from_log(200).as_seconds(), 131_072);
        assert_eq!(PollInterval::from_log(10).as_seconds(), 1024);
    }

    #[test]
    fn test_precision() {
        assert_eq!(Precision::from_seconds(0.01).as_log(), -6);
        assert_eq!(Precision::from_log(-6).as_seconds(), 0.015625);
        assert_eq!(Precision::from_log(0).as_seconds(), 1.0);
    }

    #[test]
    fn test_era_epochs() {
        assert_eq!(
            NtpEra::EraA.epoch(),
            UNIX_EPOCH - Duration::from_secs(2_208_988_800),
        );
        // 2036-02-07T06:28:16Z
        assert_eq!(
            NtpEra::EraB.epoch(),
            UNIX_EPOCH + Duration::from_secs(2_085_978_496),
        );
    }
}
