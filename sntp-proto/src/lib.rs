//! Wire-level types for the SNTP (RFC 4330) unicast protocol: the 64-bit
//! fixed-point timestamp, the 48-byte packet codec, and the derived
//! round-trip delay and clock offset quantities.

#![forbid(unsafe_code)]

mod clock;
mod identifiers;
mod packet;
mod time_types;

pub use clock::NtpClock;
pub use identifiers::ReferenceId;
pub use packet::{
    NtpAssociationMode, NtpLeapIndicator, NtpPacket, PacketParsingError, RootDelay, RootDispersion,
};
pub use time_types::{NtpDuration, NtpEra, NtpTimestamp, PollInterval, Precision, TICKS_PER_SECOND};
