use std::fmt::Display;

use crate::{NtpDuration, NtpTimestamp, PollInterval, Precision, ReferenceId};

#[derive(Debug)]
pub enum PacketParsingError {
    IncorrectLength,
}

impl Display for PacketParsingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IncorrectLength => f.write_str("Incorrect packet length"),
        }
    }
}

impl std::error::Error for PacketParsingError {}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NtpLeapIndicator {
    NoWarning,
    Leap61,
    Leap59,
    Unknown,
}

impl NtpLeapIndicator {
    // This function should only ever be called with 2 bit values
    // (in the least significant position)
    fn from_bits(bits: u8) -> NtpLeapIndicator {
        match bits {
            0 => NtpLeapIndicator::NoWarning,
            1 => NtpLeapIndicator::Leap61,
            2 => NtpLeapIndicator::Leap59,
            3 => NtpLeapIndicator::Unknown,
            // This function should only ever be called from the packet parser
            // with just two bits, so this really should be unreachable
            _ => unreachable!(),
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            NtpLeapIndicator::NoWarning => 0,
            NtpLeapIndicator::Leap61 => 1,
            NtpLeapIndicator::Leap59 => 2,
            NtpLeapIndicator::Unknown => 3,
        }
    }

    pub fn is_synchronized(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NtpAssociationMode {
    Reserved,
    SymmetricActive,
    SymmetricPassive,
    Client,
    Server,
    Broadcast,
    Control,
    Private,
}

impl NtpAssociationMode {
    // This function should only ever be called with 3 bit values
    // (in the least significant position)
    fn from_bits(bits: u8) -> NtpAssociationMode {
        match bits {
            0 => NtpAssociationMode::Reserved,
            1 => NtpAssociationMode::SymmetricActive,
            2 => NtpAssociationMode::SymmetricPassive,
            3 => NtpAssociationMode::Client,
            4 => NtpAssociationMode::Server,
            5 => NtpAssociationMode::Broadcast,
            6 => NtpAssociationMode::Control,
            7 => NtpAssociationMode::Private,
            // This function should only ever be called from the packet parser
            // with just three bits, so this really should be unreachable
            _ => unreachable!(),
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            NtpAssociationMode::Reserved => 0,
            NtpAssociationMode::SymmetricActive => 1,
            NtpAssociationMode::SymmetricPassive => 2,
            NtpAssociationMode::Client => 3,
            NtpAssociationMode::Server => 4,
            NtpAssociationMode::Broadcast => 5,
            NtpAssociationMode::Control => 6,
            NtpAssociationMode::Private => 7,
        }
    }
}

/// Total round-trip delay to the primary reference source, a signed 16.16
/// fixed-point number of seconds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct RootDelay(i32);

impl RootDelay {
    pub const fn from_raw(raw: i32) -> RootDelay {
        RootDelay(raw)
    }

    pub const fn as_raw(self) -> i32 {
        self.0
    }

    pub const fn from_bits(bits: [u8; 4]) -> RootDelay {
        RootDelay(i32::from_be_bytes(bits))
    }

    pub const fn to_bits(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / (1 << 16) as f64
    }

    pub fn from_seconds(seconds: f64) -> RootDelay {
        RootDelay((seconds * (1 << 16) as f64) as i32)
    }
}

/// Maximum error due to clock frequency tolerance, an unsigned 16.16
/// fixed-point number of seconds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct RootDispersion(u32);

impl RootDispersion {
    pub const fn from_raw(raw: u32) -> RootDispersion {
        RootDispersion(raw)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: [u8; 4]) -> RootDispersion {
        RootDispersion(u32::from_be_bytes(bits))
    }

    pub const fn to_bits(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / (1 << 16) as f64
    }

    pub fn from_seconds(seconds: f64) -> RootDispersion {
        RootDispersion((seconds * (1 << 16) as f64) as u32)
    }
}

/// One full protocol message.
///
/// The destination timestamp records local arrival time of a reply. It is
/// never part of the 48-byte wire encoding and only exists to derive the
/// round-trip delay and clock offset; it survives copies of the packet but
/// not a trip over the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NtpPacket {
    leap: NtpLeapIndicator,
    version: u8,
    mode: NtpAssociationMode,
    stratum: u8,
    poll: PollInterval,
    precision: Precision,
    root_delay: RootDelay,
    root_dispersion: RootDispersion,
    reference_id: ReferenceId,
    reference_timestamp: NtpTimestamp,
    /// Time at the client when the request departed for the server
    origin_timestamp: NtpTimestamp,
    /// Time at the server when the request arrived from the client
    receive_timestamp: NtpTimestamp,
    /// Time at the server when the response left for the client
    transmit_timestamp: NtpTimestamp,
    /// Time at the client when the response arrived, in-memory only
    destination_timestamp: NtpTimestamp,
}

impl NtpPacket {
    pub const LENGTH: usize = 48;

    /// A new, empty packet
    pub fn new() -> Self {
        Self {
            leap: NtpLeapIndicator::NoWarning,
            version: 3,
            mode: NtpAssociationMode::Client,
            stratum: 0,
            poll: PollInterval::default(),
            precision: Precision::default(),
            root_delay: RootDelay::default(),
            root_dispersion: RootDispersion::default(),
            reference_id: ReferenceId::NONE,
            reference_timestamp: NtpTimestamp::default(),
            origin_timestamp: NtpTimestamp::default(),
            receive_timestamp: NtpTimestamp::default(),
            transmit_timestamp: NtpTimestamp::default(),
            destination_timestamp: NtpTimestamp::default(),
        }
    }

    /// A client request. Everything except the version, the mode and the
    /// transmit timestamp is zero in a unicast request.
    pub fn poll_message(transmit_timestamp: NtpTimestamp) -> Self {
        Self {
            transmit_timestamp,
            ..Self::new()
        }
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketParsingError> {
        if data.len() != Self::LENGTH {
            return Err(PacketParsingError::IncorrectLength);
        }

        Ok(Self {
            leap: NtpLeapIndicator::from_bits((data[0] & 0xC0) >> 6),
            version: (data[0] & 0x38) >> 3,
            mode: NtpAssociationMode::from_bits(data[0] & 0x07),
            stratum: data[1],
            poll: PollInterval::from_log(data[2]),
            precision: Precision::from_log(data[3] as i8),
            root_delay: RootDelay::from_bits(data[4..8].try_into().unwrap()),
            root_dispersion: RootDispersion::from_bits(data[8..12].try_into().unwrap()),
            reference_id: ReferenceId::from_bytes(data[12..16].try_into().unwrap()),
            reference_timestamp: NtpTimestamp::from_bits(data[16..24].try_into().unwrap()),
            origin_timestamp: NtpTimestamp::from_bits(data[24..32].try_into().unwrap()),
            receive_timestamp: NtpTimestamp::from_bits(data[32..40].try_into().unwrap()),
            transmit_timestamp: NtpTimestamp::from_bits(data[40..48].try_into().unwrap()),
            destination_timestamp: NtpTimestamp::default(),
        })
    }

    pub fn serialize(&self) -> [u8; Self::LENGTH] {
        let mut buf = [0u8; Self::LENGTH];
        buf[0] = (self.leap.to_bits() << 6) | ((self.version & 0x07) << 3) | self.mode.to_bits();
        buf[1] = self.stratum;
        buf[2] = self.poll.as_log();
        buf[3] = self.precision.as_log() as u8;
        buf[4..8].copy_from_slice(&self.root_delay.to_bits());
        buf[8..12].copy_from_slice(&self.root_dispersion.to_bits());
        buf[12..16].copy_from_slice(&self.reference_id.to_bytes());
        buf[16..24].copy_from_slice(&self.reference_timestamp.to_bits());
        buf[24..32].copy_from_slice(&self.origin_timestamp.to_bits());
        buf[32..40].copy_from_slice(&self.receive_timestamp.to_bits());
        buf[40..48].copy_from_slice(&self.transmit_timestamp.to_bits());
        buf
    }

    /// Round-trip delay d = (T4 - T1) - (T3 - T2), in ticks.
    pub fn roundtrip_delay(&self) -> NtpDuration {
        let t1 = self.origin_timestamp.to_ticks();
        let t2 = self.receive_timestamp.to_ticks();
        let t3 = self.transmit_timestamp.to_ticks();
        let t4 = self.destination_timestamp.to_ticks();

        NtpDuration::from_ticks((t4 - t1) - (t3 - t2))
    }

    /// Clock offset t = ((T2 - T1) + (T3 - T4)) / 2, in ticks. The division
    /// truncates toward zero, matching deployed servers.
    pub fn clock_offset(&self) -> NtpDuration {
        let t1 = self.origin_timestamp.to_ticks();
        let t2 = self.receive_timestamp.to_ticks();
        let t3 = self.transmit_timestamp.to_ticks();
        let t4 = self.destination_timestamp.to_ticks();

        NtpDuration::from_ticks(((t2 - t1) + (t3 - t4)) / 2)
    }

    /// The sanity checks rfc4330 suggests for a unicast reply: the mode must
    /// be a server reply, stratum and transmit timestamp must be nonzero, and
    /// the origin timestamp must echo the transmit timestamp of the request.
    ///
    /// `deserialize` deliberately does not apply these; a caller that wants
    /// them has to opt in.
    pub fn is_plausible_response(&self, request: &NtpPacket) -> bool {
        self.mode == NtpAssociationMode::Server
            && self.stratum != 0
            && self.transmit_timestamp != NtpTimestamp::default()
            && self.origin_timestamp == request.transmit_timestamp
    }

    pub fn leap(&self) -> NtpLeapIndicator {
        self.leap
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn mode(&self) -> NtpAssociationMode {
        self.mode
    }

    pub fn stratum(&self) -> u8 {
        self.stratum
    }

    pub fn poll(&self) -> PollInterval {
        self.poll
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn root_delay(&self) -> RootDelay {
        self.root_delay
    }

    pub fn root_dispersion(&self) -> RootDispersion {
        self.root_dispersion
    }

    pub fn reference_id(&self) -> ReferenceId {
        self.reference_id
    }

    pub fn reference_timestamp(&self) -> NtpTimestamp {
        self.reference_timestamp
    }

    pub fn origin_timestamp(&self) -> NtpTimestamp {
        self.origin_timestamp
    }

    pub fn receive_timestamp(&self) -> NtpTimestamp {
        self.receive_timestamp
    }

    pub fn transmit_timestamp(&self) -> NtpTimestamp {
        self.transmit_timestamp
    }

    pub fn destination_timestamp(&self) -> NtpTimestamp {
        self.destination_timestamp
    }

    pub fn set_leap(&mut self, leap: NtpLeapIndicator) {
        self.leap = leap;
    }

    pub fn set_version(&mut self, version: u8) {
        self.version = version;
    }

    pub fn set_mode(&mut self, mode: NtpAssociationMode) {
        self.mode = mode;
    }

    pub fn set_stratum(&mut self, stratum: u8) {
        self.stratum = stratum;
    }

    pub fn set_poll(&mut self, poll: PollInterval) {
        self.poll = poll;
    }

    pub fn set_precision(&mut self, precision: Precision) {
        self.precision = precision;
    }

    pub fn set_root_delay(&mut self, root_delay: RootDelay) {
        self.root_delay = root_delay;
    }

    pub fn set_root_dispersion(&mut self, root_dispersion: RootDispersion) {
        self.root_dispersion = root_dispersion;
    }

    pub fn set_reference_id(&mut self, reference_id: ReferenceId) {
        self.reference_id = reference_id;
    }

    pub fn set_reference_timestamp(&mut self, timestamp: NtpTimestamp) {
        self.reference_timestamp = timestamp;
    }

    pub fn set_origin_timestamp(&mut self, timestamp: NtpTimestamp) {
        self.origin_timestamp = timestamp;
    }

    pub fn set_receive_timestamp(&mut self, timestamp: NtpTimestamp) {
        self.receive_timestamp = timestamp;
    }

    pub fn set_transmit_timestamp(&mut self, timestamp: NtpTimestamp) {
        self.transmit_timestamp = timestamp;
    }

    pub fn set_destination_timestamp(&mut self, timestamp: NtpTimestamp) {
        self.destination_timestamp = timestamp;
    }
}

impl Default for NtpPacket {
    fn default() -> Self {
        Self::new()
    }
}
