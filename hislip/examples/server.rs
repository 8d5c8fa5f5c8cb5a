use async_std::io;
use hislip_device::{lock::SharedLock, util::SimpleDevice};
use hislip_server::server::ServerBuilder;
pub use hislip_server::{DEFAULT_DEVICE_SUBADDRESS, STANDARD_PORT};

use clap::Parser;

/// Serve a simulated instrument over HiSLIP
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(default_value = "127.0.0.1")]
    ip: String,

    /// Port to listen on
    #[clap(short, long, default_value_t = STANDARD_PORT)]
    port: u16,
}

#[async_std::main]
async fn main() -> Result<(), io::Error> {
    femme::with_level(log::LevelFilter::Debug);
    let args = Args::parse();

    let device = SimpleDevice::new_arc();
    let shared_lock = SharedLock::new();

    let server = ServerBuilder::default()
        .device(DEFAULT_DEVICE_SUBADDRESS.to_string(), device, shared_lock)
        .build();

    println!("Running server on {}:{}...", args.ip, args.port);
    server.accept((&args.ip[..], args.port)).await
}
