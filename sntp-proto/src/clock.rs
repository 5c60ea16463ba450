use crate::{NtpDuration, NtpTimestamp};

/// Interface for the local clock. This needs to be a trait as a single
/// system can have multiple clocks which need different implementations
/// for reading and steering.
pub trait NtpClock: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + 'static;

    /// The current time of this clock.
    fn now(&self) -> Result<NtpTimestamp, Self::Error>;

    /// Step the clock by the given offset. Adding the offset to the current
    /// clock reading yields the estimated true time.
    fn step_clock(&self, offset: NtpDuration) -> Result<(), Self::Error>;
}
