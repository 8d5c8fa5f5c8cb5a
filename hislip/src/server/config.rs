use crate::common::{Protocol, SUPPORTED_PROTOCOL};

#[derive(Clone)]
pub struct ServerConfig {
    /// Vendor ID reported in AsyncInitializeResponse, two ASCII characters
    pub vendor_id: u16,
    /// Maximum server message size
    pub max_message_size: u64,
    /// Prefer overlapped command execution
    pub prefer_overlap: bool,
    /// Maximum allowed number of sessions
    pub max_num_sessions: usize,
    /// Advertised protocol version, negotiated down to the client's if lower
    pub protocol: Protocol,
}

impl ServerConfig {
    pub fn vendor_id(mut self, vendor_id: u16) -> Self {
        self.vendor_id = vendor_id;
        self
    }

    pub fn max_message_size(mut self, max_message_size: u64) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn max_num_sessions(mut self, max_num_sessions: usize) -> Self {
        self.max_num_sessions = max_num_sessions;
        self
    }

    pub fn prefer_overlap(mut self) -> Self {
        self.prefer_overlap = true;
        self
    }

    pub fn prefer_synchronized(mut self) -> Self {
        self.prefer_overlap = false;
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0xBEEF,
            max_message_size: 500_000_000,
            prefer_overlap: false,
            max_num_sessions: 64,
            protocol: SUPPORTED_PROTOCOL,
        }
    }
}
