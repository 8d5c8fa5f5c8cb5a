use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_std::future::timeout;
use async_std::net::{TcpListener, TcpStream};
use async_std::task;
use futures::lock::Mutex;
use futures::{AsyncReadExt, AsyncWriteExt};

use hislip_device::lock::SharedLock;
use hislip_device::util::{EchoDevice, SimpleDevice};
use hislip_device::Device;
use hislip_server::server::{ServerBuilder, ServerConfig};

const INITIALIZE: u8 = 0;
const INITIALIZE_RESPONSE: u8 = 1;
const FATAL_ERROR: u8 = 2;
const ASYNC_LOCK: u8 = 4;
const ASYNC_LOCK_RESPONSE: u8 = 5;
const DATA: u8 = 6;
const DATA_END: u8 = 7;
const DEVICE_CLEAR_COMPLETE: u8 = 8;
const DEVICE_CLEAR_ACKNOWLEDGE: u8 = 9;
const TRIGGER: u8 = 12;
const ASYNC_INTERRUPTED: u8 = 14;
const ASYNC_MAXIMUM_MESSAGE_SIZE: u8 = 15;
const ASYNC_MAXIMUM_MESSAGE_SIZE_RESPONSE: u8 = 16;
const ASYNC_INITIALIZE: u8 = 17;
const ASYNC_INITIALIZE_RESPONSE: u8 = 18;
const ASYNC_DEVICE_CLEAR: u8 = 19;
const ASYNC_STATUS_QUERY: u8 = 21;
const ASYNC_STATUS_RESPONSE: u8 = 22;
const ASYNC_DEVICE_CLEAR_ACKNOWLEDGE: u8 = 23;
const ASYNC_LOCK_INFO: u8 = 24;
const ASYNC_LOCK_INFO_RESPONSE: u8 = 25;

type DynDevice = Box<dyn Device + Send>;

/// Start a server with a SimpleDevice at "hislip0" and an EchoDevice at
/// "hislip1" on an ephemeral port.
async fn start_server(config: ServerConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let device: Arc<Mutex<DynDevice>> = Arc::new(Mutex::new(Box::new(SimpleDevice)));
    let echo: Arc<Mutex<DynDevice>> = Arc::new(Mutex::new(Box::new(EchoDevice)));

    let server = ServerBuilder::new(config)
        .device("hislip0".to_string(), device, SharedLock::new())
        .device("hislip1".to_string(), echo, SharedLock::new())
        .build();

    task::spawn(server.serve(listener));
    addr
}

async fn write_frame(stream: &mut TcpStream, typ: u8, ctrl: u8, param: u32, payload: &[u8]) {
    let mut buf = Vec::with_capacity(16 + payload.len());
    buf.extend_from_slice(b"HS");
    buf.push(typ);
    buf.push(ctrl);
    buf.extend_from_slice(&param.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    buf.extend_from_slice(payload);
    stream.write_all(&buf).await.unwrap();
}

async fn read_frame(stream: &mut TcpStream) -> (u8, u8, u32, Vec<u8>) {
    let mut header = [0u8; 16];
    stream.read_exact(&mut header).await.unwrap();
    assert_eq!(&header[0..2], b"HS");
    let typ = header[2];
    let ctrl = header[3];
    let param = u32::from_be_bytes(header[4..8].try_into().unwrap());
    let len = u64::from_be_bytes(header[8..16].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    (typ, ctrl, param, payload)
}

async fn read_eof(stream: &mut TcpStream) {
    let mut buf = [0u8; 16];
    match stream.read(&mut buf).await {
        Ok(n) => assert_eq!(n, 0, "expected connection to be closed"),
        // A reset is also an acceptable way to observe teardown
        Err(_) => {}
    }
}

/// Full initialization handshake: sync Initialize + async AsyncInitialize.
async fn connect_session(addr: SocketAddr, sub_address: &str) -> (TcpStream, TcpStream, u16) {
    let mut sync = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut sync, INITIALIZE, 0, 0x0001_0000, sub_address.as_bytes()).await;
    let (typ, _ctrl, param, _) = read_frame(&mut sync).await;
    assert_eq!(typ, INITIALIZE_RESPONSE);
    let session_id = (param & 0xFFFF) as u16;
    assert_ne!(session_id, 0);

    let mut async_channel = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut async_channel, ASYNC_INITIALIZE, 0, session_id as u32, &[]).await;
    let (typ, _, _, _) = read_frame(&mut async_channel).await;
    assert_eq!(typ, ASYNC_INITIALIZE_RESPONSE);

    (sync, async_channel, session_id)
}

fn run<F>(fut: F)
where
    F: std::future::Future<Output = ()>,
{
    task::block_on(async {
        timeout(Duration::from_secs(10), fut).await.unwrap();
    })
}

/// Give the server a moment to finish bookkeeping that happens after its
/// response bytes already reached us (e.g. setting MAV post-write).
async fn settle() {
    task::sleep(Duration::from_millis(100)).await;
}

#[test]
fn test_handshake() {
    run(async {
        let addr = start_server(ServerConfig::default().vendor_id(0x5253)).await;

        // Initialize, protocol 0.1, vendor 0, sub-address "hislip0"
        let mut sync = TcpStream::connect(addr).await.unwrap();
        sync.write_all(&[
            0x48, 0x53, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x07, b'h', b'i', b's', b'l', b'i', b'p', b'0',
        ])
        .await
        .unwrap();

        // InitializeResponse: negotiated protocol 0.1, session id 1, no overlap
        let mut response = [0u8; 16];
        sync.read_exact(&mut response).await.unwrap();
        assert_eq!(
            response,
            [
                0x48, 0x53, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x00, 0x00
            ]
        );

        // AsyncInitialize for session 1
        let mut async_channel = TcpStream::connect(addr).await.unwrap();
        async_channel
            .write_all(&[
                0x48, 0x53, 0x11, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x00, 0x00,
            ])
            .await
            .unwrap();

        // AsyncInitializeResponse: vendor id "RS"
        let mut response = [0u8; 16];
        async_channel.read_exact(&mut response).await.unwrap();
        assert_eq!(
            response,
            [
                0x48, 0x53, 0x12, 0x00, 0x00, 0x00, 0x52, 0x53, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x00, 0x00
            ]
        );
    });
}

#[test]
fn test_query_roundtrip() {
    run(async {
        let addr = start_server(ServerConfig::default()).await;
        let (mut sync, mut async_channel, _id) = connect_session(addr, "hislip0").await;

        // Query is answered with the same message id
        write_frame(&mut sync, DATA_END, 0, 0x1000, b"*IDN?\n").await;
        let (typ, _ctrl, param, payload) = read_frame(&mut sync).await;
        assert_eq!(typ, DATA_END);
        assert_eq!(param, 0x1000);
        assert_eq!(
            payload,
            b"Cyberdyne systems,T800 Model 101,A9012.C,V2.4".to_vec()
        );
        settle().await;

        // MAV is set until the status query delivers an RMT
        write_frame(&mut async_channel, ASYNC_STATUS_QUERY, 1, 0x1002, &[]).await;
        let (typ, stb, _, _) = read_frame(&mut async_channel).await;
        assert_eq!(typ, ASYNC_STATUS_RESPONSE);
        assert_eq!(stb & 0x10, 0x10);

        write_frame(&mut async_channel, ASYNC_STATUS_QUERY, 1, 0x1004, &[]).await;
        let (typ, stb, _, _) = read_frame(&mut async_channel).await;
        assert_eq!(typ, ASYNC_STATUS_RESPONSE);
        assert_eq!(stb & 0x10, 0x00);
    });
}

#[test]
fn test_data_assembly() {
    run(async {
        let addr = start_server(ServerConfig::default()).await;
        let (mut sync, _async_channel, _id) = connect_session(addr, "hislip1").await;

        // A message unit split over Data frames is delivered as one unit
        write_frame(&mut sync, DATA, 0, 0x10, b"ab").await;
        write_frame(&mut sync, DATA, 0, 0x12, b"cd").await;
        write_frame(&mut sync, DATA_END, 0, 0x14, b"ef").await;

        let (typ, _ctrl, param, payload) = read_frame(&mut sync).await;
        assert_eq!(typ, DATA_END);
        assert_eq!(param, 0x14);
        assert_eq!(payload, b"abcdef".to_vec());
    });
}

#[test]
fn test_bad_prologue() {
    run(async {
        let addr = start_server(ServerConfig::default()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut frame = [0u8; 16];
        frame[0] = b'X';
        frame[1] = b'x';
        stream.write_all(&frame).await.unwrap();

        let (typ, code, _, _) = read_frame(&mut stream).await;
        assert_eq!(typ, FATAL_ERROR);
        // Poorly formatted message header
        assert_eq!(code, 1);
        read_eof(&mut stream).await;
    });
}

#[test]
fn test_unknown_sub_address() {
    run(async {
        let addr = start_server(ServerConfig::default()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut stream, INITIALIZE, 0, 0x0001_0000, b"hislip9").await;

        let (typ, code, _, _) = read_frame(&mut stream).await;
        assert_eq!(typ, FATAL_ERROR);
        // Invalid initialization
        assert_eq!(code, 3);
        read_eof(&mut stream).await;
    });
}

#[test]
fn test_use_without_both_channels() {
    run(async {
        let addr = start_server(ServerConfig::default()).await;

        // Synchronous channel only, no AsyncInitialize
        let mut sync = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut sync, INITIALIZE, 0, 0x0001_0000, b"hislip0").await;
        let (typ, _, _, _) = read_frame(&mut sync).await;
        assert_eq!(typ, INITIALIZE_RESPONSE);

        write_frame(&mut sync, DATA_END, 0, 0x1000, b"*IDN?\n").await;
        let (typ, code, _, _) = read_frame(&mut sync).await;
        assert_eq!(typ, FATAL_ERROR);
        // Attempt use without both channels
        assert_eq!(code, 2);
        read_eof(&mut sync).await;
    });
}

#[test]
fn test_oversized_message() {
    run(async {
        let addr = start_server(ServerConfig::default()).await;
        let (mut sync, mut async_channel, id) = connect_session(addr, "hislip0").await;

        // Announce a payload twice the session maximum, without sending it
        let mut frame = Vec::new();
        frame.extend_from_slice(b"HS");
        frame.push(DATA);
        frame.push(0);
        frame.extend_from_slice(&0x2000u32.to_be_bytes());
        frame.extend_from_slice(&(2 * 1024 * 1024u64).to_be_bytes());
        sync.write_all(&frame).await.unwrap();

        let (typ, code, _, _) = read_frame(&mut sync).await;
        assert_eq!(typ, FATAL_ERROR);
        // Message too large
        assert_eq!(code, 128);

        // Both channels of the session are torn down
        read_eof(&mut sync).await;
        read_eof(&mut async_channel).await;

        // And the session id is gone from the registry
        let mut retry = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut retry, ASYNC_INITIALIZE, 0, id as u32, &[]).await;
        let (typ, code, _, _) = read_frame(&mut retry).await;
        assert_eq!(typ, FATAL_ERROR);
        assert_eq!(code, 3);
    });
}

#[test]
fn test_dual_async_attach() {
    run(async {
        let addr = start_server(ServerConfig::default()).await;
        let (_sync, mut async_channel, id) = connect_session(addr, "hislip0").await;

        // A second async channel for the same session is refused
        let mut second = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut second, ASYNC_INITIALIZE, 0, id as u32, &[]).await;
        let (typ, code, _, _) = read_frame(&mut second).await;
        assert_eq!(typ, FATAL_ERROR);
        assert_eq!(code, 3);
        read_eof(&mut second).await;

        // The original session is unaffected
        write_frame(&mut async_channel, ASYNC_STATUS_QUERY, 0, 0, &[]).await;
        let (typ, _, _, _) = read_frame(&mut async_channel).await;
        assert_eq!(typ, ASYNC_STATUS_RESPONSE);
    });
}

#[test]
fn test_session_cap() {
    run(async {
        let addr = start_server(ServerConfig::default().max_num_sessions(1)).await;
        let (_sync, _async_channel, _id) = connect_session(addr, "hislip0").await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut second, INITIALIZE, 0, 0x0001_0000, b"hislip0").await;
        let (typ, code, _, _) = read_frame(&mut second).await;
        assert_eq!(typ, FATAL_ERROR);
        // Maximum clients exceeded
        assert_eq!(code, 4);
    });
}

#[test]
fn test_lock_request_release() {
    run(async {
        let addr = start_server(ServerConfig::default()).await;
        let (_sync, mut async_channel, _id) = connect_session(addr, "hislip0").await;

        // Exclusive lock, no timeout
        write_frame(&mut async_channel, ASYNC_LOCK, 1, 0, &[]).await;
        let (typ, code, _, _) = read_frame(&mut async_channel).await;
        assert_eq!(typ, ASYNC_LOCK_RESPONSE);
        // Success
        assert_eq!(code, 1);

        write_frame(&mut async_channel, ASYNC_LOCK_INFO, 0, 0, &[]).await;
        let (typ, exclusive, num_shared, _) = read_frame(&mut async_channel).await;
        assert_eq!(typ, ASYNC_LOCK_INFO_RESPONSE);
        assert_eq!(exclusive, 1);
        assert_eq!(num_shared, 0);

        // Release
        write_frame(&mut async_channel, ASYNC_LOCK, 0, 0, &[]).await;
        let (typ, code, _, _) = read_frame(&mut async_channel).await;
        assert_eq!(typ, ASYNC_LOCK_RESPONSE);
        // Success, exclusive lock released
        assert_eq!(code, 1);

        // Releasing again is an error
        write_frame(&mut async_channel, ASYNC_LOCK, 0, 0, &[]).await;
        let (typ, code, _, _) = read_frame(&mut async_channel).await;
        assert_eq!(typ, ASYNC_LOCK_RESPONSE);
        assert_eq!(code, 3);

        // Only bit 0 of the control code selects request/release, a release
        // with a reserved bit set still releases
        write_frame(&mut async_channel, ASYNC_LOCK, 1, 0, &[]).await;
        let (_, code, _, _) = read_frame(&mut async_channel).await;
        assert_eq!(code, 1);

        write_frame(&mut async_channel, ASYNC_LOCK, 2, 0, &[]).await;
        let (typ, code, _, _) = read_frame(&mut async_channel).await;
        assert_eq!(typ, ASYNC_LOCK_RESPONSE);
        assert_eq!(code, 1);
    });
}

#[test]
fn test_lock_contention() {
    run(async {
        let addr = start_server(ServerConfig::default()).await;
        let (_sync1, mut async1, _) = connect_session(addr, "hislip0").await;
        let (_sync2, mut async2, _) = connect_session(addr, "hislip0").await;

        // Session 1 takes the exclusive lock
        write_frame(&mut async1, ASYNC_LOCK, 1, 0, &[]).await;
        let (_, code, _, _) = read_frame(&mut async1).await;
        assert_eq!(code, 1);

        // Session 2 cannot, with or without timeout
        write_frame(&mut async2, ASYNC_LOCK, 1, 0, &[]).await;
        let (_, code, _, _) = read_frame(&mut async2).await;
        // Failure
        assert_eq!(code, 0);

        write_frame(&mut async2, ASYNC_LOCK, 1, 50, &[]).await;
        let (_, code, _, _) = read_frame(&mut async2).await;
        assert_eq!(code, 0);

        // Until session 1 releases it
        write_frame(&mut async1, ASYNC_LOCK, 0, 0, &[]).await;
        let (_, code, _, _) = read_frame(&mut async1).await;
        assert_eq!(code, 1);

        write_frame(&mut async2, ASYNC_LOCK, 1, 0, &[]).await;
        let (_, code, _, _) = read_frame(&mut async2).await;
        assert_eq!(code, 1);
    });
}

#[test]
fn test_max_message_size_negotiation() {
    run(async {
        let addr = start_server(ServerConfig::default()).await;
        let (mut sync, mut async_channel, _id) = connect_session(addr, "hislip0").await;

        // Negotiate a tiny maximum message size
        write_frame(
            &mut async_channel,
            ASYNC_MAXIMUM_MESSAGE_SIZE,
            0,
            0,
            &6u64.to_be_bytes(),
        )
        .await;
        let (typ, _, _, payload) = read_frame(&mut async_channel).await;
        assert_eq!(typ, ASYNC_MAXIMUM_MESSAGE_SIZE_RESPONSE);
        assert_eq!(payload, 6u64.to_be_bytes().to_vec());

        // An 8 byte response is now delivered in two chunks
        write_frame(&mut sync, DATA_END, 0, 0x2000, b"QUERY?").await;

        let (typ, _, param, payload) = read_frame(&mut sync).await;
        assert_eq!(typ, DATA);
        assert_eq!(param, 0x2000);
        assert_eq!(payload, b"RESPON".to_vec());

        let (typ, _, param, payload) = read_frame(&mut sync).await;
        assert_eq!(typ, DATA_END);
        assert_eq!(param, 0x2000);
        assert_eq!(payload, b"SE".to_vec());
    });
}

#[test]
fn test_device_clear() {
    run(async {
        let addr = start_server(ServerConfig::default()).await;
        let (mut sync, mut async_channel, _id) = connect_session(addr, "hislip0").await;

        // Leave a response pending so the clear has something to discard
        write_frame(&mut sync, DATA_END, 0, 0x100, b"*IDN?\n").await;
        let (typ, _, _, _) = read_frame(&mut sync).await;
        assert_eq!(typ, DATA_END);
        settle().await;

        write_frame(&mut async_channel, ASYNC_DEVICE_CLEAR, 0, 0, &[]).await;
        let (typ, _, _, _) = read_frame(&mut async_channel).await;
        assert_eq!(typ, ASYNC_DEVICE_CLEAR_ACKNOWLEDGE);

        // The pending response is discarded
        let (typ, _, _, _) = read_frame(&mut async_channel).await;
        assert_eq!(typ, ASYNC_INTERRUPTED);

        // Complete the clear on the synchronous channel
        write_frame(&mut sync, DEVICE_CLEAR_COMPLETE, 0, 0, &[]).await;
        let (typ, _, _, _) = read_frame(&mut sync).await;
        assert_eq!(typ, DEVICE_CLEAR_ACKNOWLEDGE);

        // MAV was cleared by the device clear
        write_frame(&mut async_channel, ASYNC_STATUS_QUERY, 0, 0, &[]).await;
        let (typ, stb, _, _) = read_frame(&mut async_channel).await;
        assert_eq!(typ, ASYNC_STATUS_RESPONSE);
        assert_eq!(stb & 0x10, 0x00);

        // The session keeps working afterwards
        write_frame(&mut sync, DATA_END, 0, 0x102, b"QUERY?").await;
        let (typ, _, _, payload) = read_frame(&mut sync).await;
        assert_eq!(typ, DATA_END);
        assert_eq!(payload, b"RESPONSE".to_vec());
    });
}

#[test]
fn test_trigger_clears_mav_with_rmt() {
    run(async {
        let addr = start_server(ServerConfig::default()).await;
        let (mut sync, mut async_channel, _id) = connect_session(addr, "hislip0").await;

        write_frame(&mut sync, DATA_END, 0, 0x100, b"*IDN?\n").await;
        let (typ, _, _, _) = read_frame(&mut sync).await;
        assert_eq!(typ, DATA_END);

        settle().await;

        // Trigger with RMT acknowledges the response
        write_frame(&mut sync, TRIGGER, 1, 0x102, &[]).await;
        settle().await;

        write_frame(&mut async_channel, ASYNC_STATUS_QUERY, 0, 0, &[]).await;
        let (typ, stb, _, _) = read_frame(&mut async_channel).await;
        assert_eq!(typ, ASYNC_STATUS_RESPONSE);
        assert_eq!(stb & 0x10, 0x00);
    });
}
