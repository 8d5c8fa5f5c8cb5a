use core::option::Option;
use core::result::Result;
use std::{fmt::Display, io};

use bitfield::bitfield;

use byteorder::{BigEndian, ByteOrder, NetworkEndian};
use hislip_device::lock::SharedLockError;

use crate::common::errors::{Error, FatalErrorCode, NonFatalErrorCode};
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Protocol;

pub(crate) mod prelude {
    pub(crate) use super::{
        AsyncInitializeResponseParameter, AsyncLockControl, FeatureBitmap, InitializeParameter,
        InitializeResponseControl, InitializeResponseParameter, Message, MessageType,
        ReleaseLockControl, RequestLockControl, RmtDeliveredControl,
    };
}

/// One complete HiSLIP frame: the decoded fixed header plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Message {
    pub(crate) message_type: MessageType,
    pub(crate) control_code: u8,
    pub(crate) message_parameter: u32,
    pub(crate) payload: Vec<u8>,
}

impl Message {
    pub const MESSAGE_HEADER_SIZE: usize = 16;

    pub(crate) fn with_payload(self, payload: Vec<u8>) -> Self {
        Self { payload, ..self }
    }

    pub(crate) fn no_payload(self) -> Message {
        Self {
            payload: Vec::new(),
            ..self
        }
    }

    /// Read one complete message from `reader`.
    ///
    /// The outer error is a transport failure (short read, reset) which tears the
    /// connection down silently. The inner error is a protocol violation which is
    /// reported to the peer as a FatalError/Error message.
    ///
    /// A payload length larger than `maxlen` is fatal, the payload is left unread
    /// and the connection cannot be resynchronized.
    pub(crate) async fn read_from<RD>(
        reader: &mut RD,
        maxlen: u64,
    ) -> Result<Result<Message, Error>, io::Error>
    where
        RD: AsyncRead + Unpin,
    {
        let mut buf = [0u8; Message::MESSAGE_HEADER_SIZE];
        reader.read_exact(&mut buf).await?;
        let prologue = &buf[0..2];
        if prologue != b"HS" {
            return Ok(Err(Error::Fatal(
                FatalErrorCode::PoorlyFormattedMessageHeader,
                "Invalid prologue".to_string(),
            )));
        }

        let control_code = buf[3];
        let message_parameter = BigEndian::read_u32(&buf[4..8]);
        let len = BigEndian::read_u64(&buf[8..16]);

        let message_type = match MessageType::from_message_type(buf[2]) {
            Some(typ) => typ,
            None => {
                // Reserved type, the remaining payload bytes cannot be trusted
                return Ok(Err(Error::Fatal(
                    FatalErrorCode::PoorlyFormattedMessageHeader,
                    format!("Unrecognized message type ({})", buf[2]),
                )));
            }
        };

        if len > maxlen {
            Ok(Err(Error::Fatal(
                FatalErrorCode::MessageTooLarge,
                "Message payload too large".to_string(),
            )))
        } else {
            let mut payload = vec![0u8; len as usize];
            reader.read_exact(&mut payload).await?;
            Ok(Ok(Message {
                message_type,
                control_code,
                message_parameter,
                payload,
            }))
        }
    }

    pub(crate) async fn write_to<WR>(&self, writer: &mut WR) -> Result<(), io::Error>
    where
        WR: AsyncWrite + Unpin,
    {
        let mut buf = [0u8; Message::MESSAGE_HEADER_SIZE];
        buf[0] = b'H';
        buf[1] = b'S';
        buf[2] = self.message_type.get_message_type();
        buf[3] = self.control_code;
        NetworkEndian::write_u32(&mut buf[4..8], self.message_parameter);
        NetworkEndian::write_u64(&mut buf[8..16], self.payload.len() as u64);
        let mut to_send = buf.to_vec();
        to_send.extend_from_slice(&self.payload);
        writer.write_all(&to_send).await?;
        Ok(())
    }
}

impl From<Error> for Message {
    fn from(err: Error) -> Self {
        match err {
            Error::Fatal(code, msg) => MessageType::FatalError
                .message_params(code.error_code(), 0)
                .with_payload(msg.into_bytes()),
            Error::NonFatal(code, msg) => MessageType::Error
                .message_params(code.error_code(), 0)
                .with_payload(msg.into_bytes()),
        }
    }
}

macro_rules! send_fatal {
    ($stream:expr, $err:expr, $($arg:tt)*) => {{
        log::error!($($arg)*);
        Message::from(Error::Fatal($err, format!($($arg)*)))
            .write_to($stream)
            .await?;
        $stream.flush().await?;
        return Err(io::ErrorKind::Other.into());
    }};
    ($($key:ident=$value:expr),*; $stream:expr, $err:expr, $($arg:tt)*) => {{
        log::error!($($key=$value),*; $($arg)*);
        Message::from(Error::Fatal($err, format!($($arg)*)))
            .write_to($stream)
            .await?;
        $stream.flush().await?;
        return Err(io::ErrorKind::Other.into());
    }};
}
pub(crate) use send_fatal;

macro_rules! send_nonfatal {
    ($stream:expr, $err:expr, $($arg:tt)*) => {{
        log::warn!($($arg)*);
        Message::from(Error::NonFatal($err, format!($($arg)*)))
            .write_to($stream)
            .await?;
        $stream.flush().await?;
    }};
    ($($key:ident=$value:expr),*; $stream:expr, $err:expr, $($arg:tt)*) => {{
        log::warn!($($key=$value),*; $($arg)*);
        Message::from(Error::NonFatal($err, format!($($arg)*)))
            .write_to($stream)
            .await?;
        $stream.flush().await?;
    }};
}
pub(crate) use send_nonfatal;

/// Message Type Value Definitions
///
/// See Table 4 in HiSLIP specification
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MessageType {
    Initialize,
    InitializeResponse,
    FatalError,
    Error,
    AsyncLock,
    AsyncLockResponse,
    Data,
    DataEnd,
    DeviceClearComplete,
    DeviceClearAcknowledge,
    AsyncRemoteLocalControl,
    AsyncRemoteLocalResponse,
    Trigger,
    Interrupted,
    AsyncInterrupted,
    AsyncMaximumMessageSize,
    AsyncMaximumMessageSizeResponse,
    AsyncInitialize,
    AsyncInitializeResponse,
    AsyncDeviceClear,
    AsyncServiceRequest,
    AsyncStatusQuery,
    AsyncStatusResponse,
    AsyncDeviceClearAcknowledge,
    AsyncLockInfo,
    AsyncLockInfoResponse,
    /// Vendor-specific, only codes 128-255 are allowed
    VendorSpecific(u8),
}

impl MessageType {
    pub fn get_message_type(&self) -> u8 {
        match self {
            MessageType::Initialize => 0,
            MessageType::InitializeResponse => 1,
            MessageType::FatalError => 2,
            MessageType::Error => 3,
            MessageType::AsyncLock => 4,
            MessageType::AsyncLockResponse => 5,
            MessageType::Data => 6,
            MessageType::DataEnd => 7,
            MessageType::DeviceClearComplete => 8,
            MessageType::DeviceClearAcknowledge => 9,
            MessageType::AsyncRemoteLocalControl => 10,
            MessageType::AsyncRemoteLocalResponse => 11,
            MessageType::Trigger => 12,
            MessageType::Interrupted => 13,
            MessageType::AsyncInterrupted => 14,
            MessageType::AsyncMaximumMessageSize => 15,
            MessageType::AsyncMaximumMessageSizeResponse => 16,
            MessageType::AsyncInitialize => 17,
            MessageType::AsyncInitializeResponse => 18,
            MessageType::AsyncDeviceClear => 19,
            MessageType::AsyncServiceRequest => 20,
            MessageType::AsyncStatusQuery => 21,
            MessageType::AsyncStatusResponse => 22,
            MessageType::AsyncDeviceClearAcknowledge => 23,
            MessageType::AsyncLockInfo => 24,
            MessageType::AsyncLockInfoResponse => 25,
            MessageType::VendorSpecific(x) => *x,
        }
    }

    /// Map a wire type code to a message type.
    /// Codes 26-127 are reserved for future standard revisions and map to `None`.
    pub fn from_message_type(typ: u8) -> Option<MessageType> {
        match typ {
            0 => Some(MessageType::Initialize),
            1 => Some(MessageType::InitializeResponse),
            2 => Some(MessageType::FatalError),
            3 => Some(MessageType::Error),
            4 => Some(MessageType::AsyncLock),
            5 => Some(MessageType::AsyncLockResponse),
            6 => Some(MessageType::Data),
            7 => Some(MessageType::DataEnd),
            8 => Some(MessageType::DeviceClearComplete),
            9 => Some(MessageType::DeviceClearAcknowledge),
            10 => Some(MessageType::AsyncRemoteLocalControl),
            11 => Some(MessageType::AsyncRemoteLocalResponse),
            12 => Some(MessageType::Trigger),
            13 => Some(MessageType::Interrupted),
            14 => Some(MessageType::AsyncInterrupted),
            15 => Some(MessageType::AsyncMaximumMessageSize),
            16 => Some(MessageType::AsyncMaximumMessageSizeResponse),
            17 => Some(MessageType::AsyncInitialize),
            18 => Some(MessageType::AsyncInitializeResponse),
            19 => Some(MessageType::AsyncDeviceClear),
            20 => Some(MessageType::AsyncServiceRequest),
            21 => Some(MessageType::AsyncStatusQuery),
            22 => Some(MessageType::AsyncStatusResponse),
            23 => Some(MessageType::AsyncDeviceClearAcknowledge),
            24 => Some(MessageType::AsyncLockInfo),
            25 => Some(MessageType::AsyncLockInfoResponse),
            128..=255 => Some(MessageType::VendorSpecific(typ)),
            _ => None,
        }
    }

    pub(crate) fn message_params(self, control_code: u8, message_parameter: u32) -> Message {
        Message {
            message_type: self,
            control_code,
            message_parameter,
            payload: Vec::new(),
        }
    }
}

bitfield! {
    pub struct InitializeParameter(u32);
    impl Debug;
    // The fields default to u16
    pub u16, into Protocol, client_protocol, _ : 31, 16;
    pub u16, client_vendorid, _ : 15, 0;
}

bitfield! {
    pub struct InitializeResponseParameter(u32);
    impl Debug;
    // The fields default to u16
    pub u16, from into Protocol, negotiated_protocol, set_negotiated_protocol : 31, 16;
    pub u16, session_id, set_session_id : 15, 0;
}

impl InitializeResponseParameter {
    pub(crate) fn new(negotiated_protocol: Protocol, session_id: u16) -> Self {
        let mut x = InitializeResponseParameter(0);
        x.set_negotiated_protocol(negotiated_protocol);
        x.set_session_id(session_id);
        x
    }
}

bitfield! {
    pub struct InitializeResponseControl(u8);
    impl Debug;
    pub prefer_overlap, set_prefer_overlap : 0;
    pub u8, ivi_reserved, set_ivi_reserved : 5, 1;
    pub u8, vendor_specific, set_vendor_specific : 7, 6;
}

impl InitializeResponseControl {
    pub(crate) fn new(prefer_overlap: bool) -> Self {
        let mut x = InitializeResponseControl(0);
        x.set_prefer_overlap(prefer_overlap);
        x
    }
}

bitfield! {
    pub struct AsyncInitializeResponseParameter(u32);
    impl Debug;
    // The fields default to u16
    pub u16, server_vendor_id, set_server_vendor_id : 15, 0;
}

impl AsyncInitializeResponseParameter {
    pub(crate) fn new(server_vendor_id: u16) -> Self {
        let mut x = AsyncInitializeResponseParameter(0);
        x.set_server_vendor_id(server_vendor_id);
        x
    }
}

bitfield! {
    pub struct AsyncLockControl(u8);
    impl Debug;
    pub request, set_request : 0;
}

bitfield! {
    pub struct RmtDeliveredControl(u8);
    impl Debug;
    pub rmt_delivered, set_rmt_delivered : 0;
}

impl Display for RmtDeliveredControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rmt: {}", self.rmt_delivered())
    }
}

bitfield! {
    pub struct FeatureBitmap(u8);
    impl Debug;
    pub overlapped, set_overlapped : 0;
}

impl FeatureBitmap {
    pub(crate) fn new(overlapped: bool) -> Self {
        let mut s = FeatureBitmap(0);
        s.set_overlapped(overlapped);
        s
    }
}

impl Display for FeatureBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "overlapped: {}", self.overlapped())
    }
}

/// AsyncLockResponse control codes for a lock request
#[derive(Debug, Clone, Copy)]
pub(crate) enum RequestLockControl {
    Failure = 0,
    Success = 1,
    Error = 3,
}

impl From<SharedLockError> for RequestLockControl {
    fn from(err: SharedLockError) -> Self {
        match err {
            SharedLockError::Timeout
            | SharedLockError::LockedByShared
            | SharedLockError::LockedByExclusive => RequestLockControl::Failure,
            _ => RequestLockControl::Error,
        }
    }
}

/// AsyncLockResponse control codes for a lock release
#[derive(Debug, Clone, Copy)]
pub(crate) enum ReleaseLockControl {
    SuccessExclusive = 1,
    SuccessShared = 2,
    Error = 3,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::io::Cursor;

    async fn decode(bytes: &[u8], maxlen: u64) -> Result<Result<Message, Error>, io::Error> {
        let mut reader = Cursor::new(bytes.to_vec());
        Message::read_from(&mut reader, maxlen).await
    }

    #[test]
    fn test_roundtrip() {
        let msg = MessageType::DataEnd
            .message_params(1, 0x1000)
            .with_payload(b"*IDN?\n".to_vec());

        let mut buf = Cursor::new(Vec::new());
        block_on(msg.write_to(&mut buf)).unwrap();

        let decoded = block_on(decode(buf.get_ref(), 1024)).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_initialize() {
        // Initialize for sub-address "hislip0", protocol 0.1, vendor id 0
        let bytes = [
            0x48, 0x53, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x07, b'h', b'i', b's', b'l', b'i', b'p', b'0',
        ];
        let msg = block_on(decode(&bytes, 1024)).unwrap().unwrap();
        assert_eq!(msg.message_type, MessageType::Initialize);
        assert_eq!(msg.payload, b"hislip0");

        let parameter = InitializeParameter(msg.message_parameter);
        assert_eq!(parameter.client_protocol(), Protocol(0x0001));
        assert_eq!(parameter.client_vendorid(), 0);
    }

    #[test]
    fn test_encode_initialize_response() {
        let parameter = InitializeResponseParameter::new(Protocol(0x0001), 1);
        assert_eq!(parameter.0, 0x0001_0001);

        let control = InitializeResponseControl::new(false);
        let msg = MessageType::InitializeResponse
            .message_params(control.0, parameter.0)
            .no_payload();

        let mut buf = Cursor::new(Vec::new());
        block_on(msg.write_to(&mut buf)).unwrap();
        assert_eq!(
            buf.get_ref().as_slice(),
            &[
                0x48, 0x53, 0x01, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x00, 0x00
            ]
        );
    }

    #[test]
    fn test_decode_bad_prologue() {
        let bytes = [
            b'X', b'x', 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00,
        ];
        let err = block_on(decode(&bytes, 1024)).unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Fatal(FatalErrorCode::PoorlyFormattedMessageHeader, _)
        ));
    }

    #[test]
    fn test_decode_reserved_type() {
        // Types 26-127 are reserved and must be rejected
        for typ in [26u8, 64, 127] {
            let bytes = [
                0x48, 0x53, typ, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x00,
            ];
            let err = block_on(decode(&bytes, 1024)).unwrap().unwrap_err();
            assert!(err.is_fatal());
        }
    }

    #[test]
    fn test_decode_vendor_specific() {
        let bytes = [
            0x48, 0x53, 0x90, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x02, 0xAA, 0xBB,
        ];
        let msg = block_on(decode(&bytes, 1024)).unwrap().unwrap();
        assert_eq!(msg.message_type, MessageType::VendorSpecific(0x90));
        assert_eq!(msg.payload, vec![0xAA, 0xBB]);
    }

    #[test]
    fn test_decode_oversized() {
        let bytes = [
            0x48, 0x53, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x04, 0x00,
        ];
        let err = block_on(decode(&bytes, 256)).unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Fatal(FatalErrorCode::MessageTooLarge, _)
        ));
    }

    #[test]
    fn test_decode_truncated_payload() {
        // Header promises 8 bytes of payload, stream ends after 3
        let bytes = [
            0x48, 0x53, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x08, 0x01, 0x02, 0x03,
        ];
        let err = block_on(decode(&bytes, 1024)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_decode_arbitrary_headers() {
        // Decoding never panics, it either yields a message or a typed error
        let mut x: u32 = 0x12345678;
        for _ in 0..256 {
            let mut bytes = [0u8; 24];
            for b in bytes.iter_mut() {
                // xorshift
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                *b = x as u8;
            }
            // Keep the promised payload within the buffer to avoid short reads
            bytes[8..16].copy_from_slice(&[0, 0, 0, 0, 0, 0, 0, 8]);
            let _ = block_on(decode(&bytes, 1024)).unwrap();
        }
    }

    #[test]
    fn test_async_lock_control() {
        // Only bit 0 selects between request and release
        assert!(AsyncLockControl(1).request());
        assert!(AsyncLockControl(3).request());
        assert!(!AsyncLockControl(0).request());
        assert!(!AsyncLockControl(2).request());
    }

    #[test]
    fn test_error_conversion() {
        let msg = Message::from(Error::Fatal(
            FatalErrorCode::AttemptUseWithoutBothChannels,
            "both channels required".to_string(),
        ));
        assert_eq!(msg.message_type, MessageType::FatalError);
        assert_eq!(msg.control_code, 2);
        assert_eq!(msg.payload, b"both channels required");

        let msg = Message::from(Error::NonFatal(
            NonFatalErrorCode::UnrecognizedControlCode,
            "bad control".to_string(),
        ));
        assert_eq!(msg.message_type, MessageType::Error);
        assert_eq!(msg.control_code, 2);
    }
}
