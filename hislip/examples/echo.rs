use async_std::io;
use hislip_device::{lock::SharedLock, util::EchoDevice};
use hislip_server::server::{ServerBuilder, ServerConfig};
pub use hislip_server::{DEFAULT_DEVICE_SUBADDRESS, STANDARD_PORT};

use clap::Parser;

/// Serve a device which echoes every message unit back
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(default_value = "127.0.0.1")]
    ip: String,

    /// Port to listen on
    #[clap(short, long, default_value_t = STANDARD_PORT)]
    port: u16,

    /// Vendor id, two ASCII characters
    #[clap(short, long, default_value = "RS")]
    vendor: String,
}

#[async_std::main]
async fn main() -> Result<(), io::Error> {
    femme::with_level(log::LevelFilter::Debug);
    let args = Args::parse();

    let vendor = args.vendor.as_bytes();
    let vendor_id = u16::from_be_bytes([vendor[0], vendor[1]]);

    let device = EchoDevice::new_arc();
    let shared_lock = SharedLock::new();

    let config = ServerConfig::default().vendor_id(vendor_id);
    let server = ServerBuilder::new(config)
        .device(DEFAULT_DEVICE_SUBADDRESS.to_string(), device, shared_lock)
        .build();

    println!("Running echo server on {}:{}...", args.ip, args.port);
    server.accept((&args.ip[..], args.port)).await
}
