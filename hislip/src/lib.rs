pub mod common;
pub mod server;

/// Standard HiSLIP port number
pub const STANDARD_PORT: u16 = 4880;

/// Default device sub-address.
/// Used if no other sub-address was specified.
pub const DEFAULT_DEVICE_SUBADDRESS: &str = "hislip0";
