use std::io;
use std::net::SocketAddr;
use std::str::from_utf8;

use async_std::channel::Receiver;
use async_std::sync::Arc;
use futures::lock::Mutex;
use futures::{select, AsyncRead, AsyncWrite, AsyncWriteExt, FutureExt};
use hislip_device::lock::LockHandle;
use hislip_device::trigger::Source;
use hislip_device::Device;

use crate::common::errors::{Error, FatalErrorCode, NonFatalErrorCode};
use crate::common::messages::{prelude::*, send_fatal, send_nonfatal};

use super::{SessionMode, SessionState, SharedSession};
use crate::server::ServerConfig;

/// Synchronous channel handler of one session.
///
/// Assembles Data/DataEnd runs into complete message units, delivers them to
/// the device and writes the response back, chunked to the negotiated maximum
/// message size.
pub(crate) struct SyncSession<DEV>
where
    DEV: Device,
{
    /// Session ID
    id: u16,

    // Config
    config: ServerConfig,

    /// Shared session state
    shared: Arc<Mutex<SharedSession>>,

    /// Device
    handle: LockHandle<DEV>,

    /// Device clear events from the asynchronous channel
    event: Receiver<()>,
}

impl<DEV> SyncSession<DEV>
where
    DEV: Device,
{
    pub(crate) fn new(
        id: u16,
        config: ServerConfig,
        shared: Arc<Mutex<SharedSession>>,
        handle: LockHandle<DEV>,
        event: Receiver<()>,
    ) -> Self {
        Self {
            id,
            config,
            shared,
            handle,
            event,
        }
    }

    /// A device clear preempted an in-progress message sequence.
    /// Tell the client to discard everything buffered so far.
    async fn interrupt<S>(&self, stream: &mut S, buffer: &mut Vec<u8>) -> Result<(), io::Error>
    where
        S: AsyncWrite + Unpin,
    {
        if !buffer.is_empty() {
            buffer.clear();
            let message_id = self.shared.lock().await.read_message_id;
            MessageType::Interrupted
                .message_params(0, message_id)
                .no_payload()
                .write_to(stream)
                .await?;
        }
        Ok(())
    }

    async fn acknowledge_device_clear<S>(
        &self,
        stream: &mut S,
        peer: SocketAddr,
        control_code: u8,
    ) -> Result<(), io::Error>
    where
        S: AsyncWrite + Unpin,
    {
        let mut shared = self.shared.lock().await;
        let feature_request = FeatureBitmap(control_code);
        log::debug!(peer=peer.to_string(), session_id = self.id; "Device clear complete, {}", feature_request);

        shared.set_state(SessionState::Normal);
        shared.clear_pending_output();

        // Client may request overlapped mode, granted if the server allows it
        shared.mode = if feature_request.overlapped() && self.config.prefer_overlap {
            SessionMode::Overlapped
        } else {
            SessionMode::Synchronized
        };

        let feature_setting = FeatureBitmap::new(shared.mode == SessionMode::Overlapped);
        let sent_message_id = shared.sent_message_id;
        drop(shared);

        MessageType::DeviceClearAcknowledge
            .message_params(feature_setting.0, sent_message_id)
            .no_payload()
            .write_to(stream)
            .await
    }

    /// Swallow messages until the client completes the device clear, then
    /// clear the device and acknowledge.
    async fn clear_buffer<S>(
        &self,
        stream: &mut S,
        peer: SocketAddr,
        mut msg: Result<Message, Error>,
    ) -> Result<(), io::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            match msg {
                Ok(Message {
                    message_type: MessageType::DeviceClearComplete,
                    control_code,
                    ..
                }) => {
                    if self.handle.can_lock().is_ok() {
                        let mut dev = self.handle.inner_lock().await;
                        let _res = dev.clear();
                    }

                    break self
                        .acknowledge_device_clear(stream, peer, control_code)
                        .await;
                }
                // Ignore other messages
                Ok(_) => {}
                // Invalid message
                Err(err) => {
                    if err.is_fatal() {
                        Message::from(err).write_to(stream).await?;
                        return Err(io::ErrorKind::Other.into());
                    } else {
                        Message::from(err).write_to(stream).await?;
                    }
                }
            }
            let maxlen = self.shared.lock().await.max_message_size;
            msg = Message::read_from(stream, maxlen).await?;
        }
    }

    pub(crate) async fn handle_session<S>(
        self,
        mut stream: S,
        peer: SocketAddr,
    ) -> Result<(), io::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Data buffer
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let maxlen = self.shared.lock().await.max_message_size;
            let msg = Message::read_from(&mut stream, maxlen).await?;

            // Check if a device clear is in progress before waiting for a lock
            if self.event.try_recv().is_ok() {
                self.interrupt(&mut stream, &mut buffer).await?;
                self.clear_buffer(&mut stream, peer, msg).await?;
                continue;
            }

            // Wait for the device becoming available or a lock being acquired.
            // Abort the attempt if a device clear is started.
            let mut dev = select! {
                guard = self.handle.async_lock().fuse() => guard,
                _abort = self.event.recv().fuse() => {
                    self.interrupt(&mut stream, &mut buffer).await?;
                    self.clear_buffer(&mut stream, peer, msg).await?;
                    continue;
                }
            };

            match msg {
                // Valid message
                Ok(msg) => {
                    match msg {
                        Message {
                            message_type: MessageType::VendorSpecific(code),
                            ..
                        } => {
                            send_nonfatal!(peer=peer.to_string(), session_id=self.id;
                                &mut stream, NonFatalErrorCode::UnrecognizedVendorDefinedMessage,
                                "Unrecognized Vendor Defined Message ({})", code
                            );
                        }
                        Message {
                            message_type: MessageType::FatalError,
                            control_code,
                            payload,
                            ..
                        } => {
                            log::error!(peer=peer.to_string(), session_id=self.id;
                                "Client fatal error {:?}: {}", FatalErrorCode::from_error_code(control_code),
                                from_utf8(&payload).unwrap_or("<invalid utf8>")
                            );
                        }
                        Message {
                            message_type: MessageType::Error,
                            control_code,
                            payload,
                            ..
                        } => {
                            log::warn!(peer=peer.to_string(), session_id=self.id;
                                "Client error {:?}: {}", NonFatalErrorCode::from_error_code(control_code),
                                from_utf8(&payload).unwrap_or("<invalid utf8>")
                            );
                        }
                        Message {
                            message_type: typ @ MessageType::Data | typ @ MessageType::DataEnd,
                            message_parameter: message_id,
                            control_code,
                            payload: data,
                        } => {
                            let is_end = matches!(typ, MessageType::DataEnd);
                            let control = RmtDeliveredControl(control_code);

                            let mut shared = self.shared.lock().await;

                            match shared.state() {
                                // Normal state
                                SessionState::Normal => {
                                    if control.rmt_delivered() {
                                        shared.rmt_delivered();
                                    } else if shared.rmt_expected {
                                        log::trace!(session_id=self.id, message_id=message_id; "Expected RMT was not delivered");
                                    }
                                    shared.read_message_id = message_id;

                                    if (buffer.len() + data.len()) as u64 > shared.max_message_size
                                    {
                                        drop(shared);
                                        send_fatal!(peer=peer.to_string(), session_id=self.id;
                                            &mut stream,
                                            FatalErrorCode::MessageTooLarge,
                                            "Message exceeds maximum message size"
                                        );
                                    }
                                    buffer.extend_from_slice(&data);

                                    if !is_end {
                                        log::debug!(peer=peer.to_string(), session_id=self.id, message_id=message_id; "Data");
                                    } else {
                                        log::debug!(peer=peer.to_string(), session_id=self.id, message_id=message_id; "Data END");
                                        let response = dev.execute(&buffer);
                                        buffer.clear();

                                        match response {
                                            Some(data) if !data.is_empty() => {
                                                let chunksize = shared.max_message_size as usize;
                                                drop(shared);

                                                // Stop sending if a device clear arrives mid-response
                                                let mut interrupted = false;
                                                let mut chunks = data.chunks(chunksize).peekable();
                                                while let Some(chunk) = chunks.next() {
                                                    if self.event.try_recv().is_ok() {
                                                        interrupted = true;
                                                        break;
                                                    }

                                                    // Peek if the next chunk exists, if not, this is the end
                                                    let msg = if chunks.peek().is_none() {
                                                        MessageType::DataEnd
                                                    } else {
                                                        MessageType::Data
                                                    };

                                                    // Responses echo the message id of the query
                                                    msg.message_params(0, message_id)
                                                        .with_payload(chunk.to_vec())
                                                        .write_to(&mut stream)
                                                        .await?;
                                                }

                                                if interrupted {
                                                    MessageType::Interrupted
                                                        .message_params(0, message_id)
                                                        .no_payload()
                                                        .write_to(&mut stream)
                                                        .await?;
                                                    drop(dev);
                                                    let maxlen = self
                                                        .shared
                                                        .lock()
                                                        .await
                                                        .max_message_size;
                                                    let msg = Message::read_from(
                                                        &mut stream,
                                                        maxlen,
                                                    )
                                                    .await?;
                                                    self.clear_buffer(&mut stream, peer, msg)
                                                        .await?;
                                                    continue;
                                                }

                                                let mut shared = self.shared.lock().await;
                                                shared.mav = true;
                                                shared.rmt_expected = true;
                                                shared.sent_message_id =
                                                    shared.sent_message_id.wrapping_add(2);
                                            }
                                            _ => {
                                                // No response for this message unit
                                            }
                                        }
                                    }
                                }
                                // Initial handshake
                                SessionState::Handshake => {
                                    drop(shared);
                                    send_fatal!(peer=peer.to_string(), session_id=self.id;
                                        &mut stream,
                                        FatalErrorCode::AttemptUseWithoutBothChannels,
                                        "Attempted use without both channels"
                                    );
                                }
                            }
                        }
                        Message {
                            message_type: MessageType::Trigger,
                            message_parameter: message_id,
                            control_code,
                            ..
                        } => {
                            let mut shared = self.shared.lock().await;
                            shared.read_message_id = message_id;
                            let control = RmtDeliveredControl(control_code);
                            if control.rmt_delivered() {
                                shared.rmt_delivered();
                            }
                            let state = shared.state();
                            drop(shared);

                            match state {
                                SessionState::Normal => {
                                    log::debug!(peer=peer.to_string(), session_id=self.id, message_id=message_id; "Trigger, {}", control);

                                    let _res = dev.trigger(Source::Bus);
                                }
                                // Initial handshake
                                SessionState::Handshake => {
                                    send_fatal!(peer=peer.to_string(), session_id=self.id;
                                        &mut stream,
                                        FatalErrorCode::AttemptUseWithoutBothChannels,
                                        "Attempted use without both channels"
                                    );
                                }
                            }
                        }
                        Message {
                            message_type: MessageType::DeviceClearComplete,
                            ..
                        } => {
                            // Should've been preceded by an AsyncDeviceClear
                            send_nonfatal!(peer=peer.to_string(), session_id=self.id;
                                &mut stream,
                                NonFatalErrorCode::UnidentifiedError,
                                "Unexpected device clear complete in synchronous channel"
                            );
                        }
                        msg => {
                            send_nonfatal!(peer=peer.to_string(), session_id=self.id;
                                &mut stream,
                                NonFatalErrorCode::UnidentifiedError,
                                "Unexpected message type in synchronous channel: {:?}", msg.message_type
                            );
                        }
                    }
                }
                // Invalid message
                Err(err) => {
                    if err.is_fatal() {
                        Message::from(err).write_to(&mut stream).await?;
                        return Err(io::ErrorKind::Other.into());
                    } else {
                        Message::from(err).write_to(&mut stream).await?;
                    }
                }
            }
        }
    }
}
