use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// The 32-bit reference identifier of a packet. For stratum-1 servers this is
/// a four-character ASCII source code, left justified and zero padded; for
/// IPv4 secondary servers it is the address of the synchronization source.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceId(u32);

impl ReferenceId {
    // Note: names chosen to match the identifiers given in rfc4330
    pub const NONE: ReferenceId = ReferenceId(0);
    pub const LOCL: ReferenceId = ReferenceId(u32::from_be_bytes(*b"LOCL"));
    pub const PPS: ReferenceId = ReferenceId(u32::from_be_bytes(*b"PPS\0"));
    pub const DCF: ReferenceId = ReferenceId(u32::from_be_bytes(*b"DCF\0"));
    pub const GPS: ReferenceId = ReferenceId(u32::from_be_bytes(*b"GPS\0"));

    pub fn from_ip(addr: Ipv4Addr) -> ReferenceId {
        ReferenceId(u32::from_be_bytes(addr.octets()))
    }

    pub const fn from_int(value: u32) -> ReferenceId {
        ReferenceId(value)
    }

    /// Builds an identifier from an ASCII source code of at most four
    /// characters, zero padded on the right.
    pub fn from_code(code: &str) -> Option<ReferenceId> {
        if code.len() > 4 || !code.is_ascii() {
            return None;
        }

        let mut bytes = [0u8; 4];
        bytes[..code.len()].copy_from_slice(code.as_bytes());
        Some(ReferenceId(u32::from_be_bytes(bytes)))
    }

    pub const fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub const fn from_bytes(bits: [u8; 4]) -> ReferenceId {
        ReferenceId(u32::from_be_bytes(bits))
    }
}

impl Default for ReferenceId {
    fn default() -> Self {
        Self::NONE
    }
}
