use bitfield::bitfield;

pub mod errors;
pub mod messages;

/// Protocol version 1.0
pub const PROTOCOL_1_0: Protocol = Protocol(0x0100);
/// Highest protocol supported by this crate (1.0)
pub const SUPPORTED_PROTOCOL: Protocol = PROTOCOL_1_0;

bitfield! {
    #[derive(Ord, PartialOrd, Eq, PartialEq, Copy, Clone)]
    pub struct Protocol(u16);
    impl Debug;
    // The fields default to u16
    pub u8, major, set_major : 15, 8;
    pub u8, minor, set_minor : 7, 0;
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display as `major.minor`
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

impl From<u16> for Protocol {
    fn from(x: u16) -> Self {
        Protocol(x)
    }
}

impl From<Protocol> for u16 {
    fn from(p: Protocol) -> Self {
        p.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_ordering() {
        // Negotiation takes the lowest of client and server version
        let client = Protocol(0x0001);
        assert_eq!(std::cmp::min(PROTOCOL_1_0, client), client);
        assert_eq!(format!("{}", PROTOCOL_1_0), "1.0");
    }
}
