use std::cmp::min;
use std::io;
use std::net::SocketAddr;
use std::str::from_utf8;
use std::time::Duration;

use async_std::channel::Sender;
use async_std::future;
use async_std::sync::Arc;
use byteorder::{ByteOrder, NetworkEndian};
use futures::future::Either;
use futures::lock::Mutex;
use futures::{pin_mut, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, FutureExt, StreamExt};
use hislip_device::lock::{LockHandle, SharedLockError, SharedLockMode};
use hislip_device::status;
use hislip_device::{Device, DeviceError};

use crate::common::errors::{Error, FatalErrorCode, NonFatalErrorCode};
use crate::common::messages::{prelude::*, send_fatal, send_nonfatal};

use super::SharedSession;
use crate::server::ServerConfig;

/// Asynchronous channel handler of one session.
///
/// Handles out-of-band control: locking, status queries, size negotiation,
/// remote/local and device clear. Also pushes service requests when the
/// embedding application signals a status change.
pub(crate) struct AsyncSession<DEV>
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

    /// Device clear fence towards the synchronous channel
    clear: Sender<()>,
}

impl<DEV> AsyncSession<DEV>
where
    DEV: Device,
{
    pub(crate) fn new(
        id: u16,
        config: ServerConfig,
        shared: Arc<Mutex<SharedSession>>,
        handle: LockHandle<DEV>,
        clear: Sender<()>,
    ) -> Self {
        Self {
            id,
            config,
            shared,
            handle,
            clear,
        }
    }

    pub(crate) async fn handle_session<S>(
        self,
        stream: S,
        peer: SocketAddr,
        mut srq: status::Receiver,
    ) -> Result<(), io::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut rd, mut wr) = stream.split();

        loop {
            let maxlen = self.shared.lock().await.max_message_size;
            let read_msg = Message::read_from(&mut rd, maxlen).fuse();
            pin_mut!(read_msg);

            let t = match futures::future::select(read_msg, srq.next()).await {
                // Message was received
                Either::Left((msg, _)) => msg,
                // Status changed, the receiver latches until the next
                // status query
                Either::Right((stb, read_msg)) => {
                    match stb {
                        Some(val) => {
                            log::debug!(peer=peer.to_string(), session_id=self.id; "Service request, stb={}", val);
                            MessageType::AsyncServiceRequest
                                .message_params(val, 0)
                                .write_to(&mut wr)
                                .await?;
                        }
                        None => {
                            send_fatal!(peer=peer.to_string(), session_id=self.id;
                                &mut wr, FatalErrorCode::UnidentifiedError,
                                "Server shutdown",
                            );
                        }
                    }
                    // Finish receiving the in-flight message
                    read_msg.await
                }
            }?;

            match t {
                Ok(msg) => {
                    match msg {
                        Message {
                            message_type: MessageType::VendorSpecific(code),
                            ..
                        } => {
                            send_nonfatal!(peer=peer.to_string(), session_id=self.id;
                                &mut wr, NonFatalErrorCode::UnrecognizedVendorDefinedMessage,
                                "Unrecognized Vendor Defined Message ({})", code
                            );
                        }
                        Message {
                            message_type: typ @ MessageType::Error | typ @ MessageType::FatalError,
                            control_code,
                            payload,
                            ..
                        } => {
                            if typ == MessageType::FatalError {
                                log::error!(peer=peer.to_string(), session_id=self.id;
                                    "Client fatal error {:?}: {}", FatalErrorCode::from_error_code(control_code),
                                    from_utf8(&payload).unwrap_or("<invalid utf8>")
                                );
                            } else {
                                log::warn!(peer=peer.to_string(), session_id=self.id;
                                    "Client error {:?}: {}", NonFatalErrorCode::from_error_code(control_code),
                                    from_utf8(&payload).unwrap_or("<invalid utf8>")
                                );
                            }
                        }
                        Message {
                            message_type: MessageType::AsyncLock,
                            message_parameter,
                            control_code,
                            payload: lockstr,
                        } => {
                            // Bit 0 selects request/release, other bits are reserved
                            if !AsyncLockControl(control_code).request() {
                                // Release
                                let message_id = message_parameter;
                                log::debug!(peer=peer.to_string(), session_id=self.id, message_id=message_id; "Release async lock");
                                let control = match self.handle.try_release() {
                                    Ok(SharedLockMode::Exclusive) => {
                                        ReleaseLockControl::SuccessExclusive
                                    }
                                    Ok(SharedLockMode::Shared) => ReleaseLockControl::SuccessShared,
                                    Err(_) => ReleaseLockControl::Error,
                                };
                                MessageType::AsyncLockResponse
                                    .message_params(control as u8, 0)
                                    .no_payload()
                                    .write_to(&mut wr)
                                    .await?;
                            } else {
                                // Lock
                                let timeout = message_parameter;

                                let control = match from_utf8(&lockstr) {
                                    Ok(mut lockstr) => {
                                        // Remove null termination (looking at you NI!)
                                        if lockstr.ends_with('\0') {
                                            log::warn!(peer=peer.to_string(), session_id=self.id; "Ignoring null-termination on lockstr");
                                            lockstr = lockstr.trim_end_matches('\0');
                                        }

                                        log::debug!(peer=peer.to_string(), session_id=self.id, timeout=timeout; "Async lock: {:?}", lockstr);
                                        // Try to acquire the lock
                                        let res = if timeout == 0 {
                                            // Try to lock immediately
                                            self.handle.try_acquire(lockstr)
                                        } else {
                                            // Try to acquire the lock before the timeout
                                            future::timeout(
                                                Duration::from_millis(timeout as u64),
                                                self.handle.async_acquire(lockstr),
                                            )
                                            .await
                                            .map_err(|_| SharedLockError::Timeout)
                                            .and_then(|res| res)
                                        };

                                        res.map_or_else(
                                            |err| err.into(),
                                            |_| RequestLockControl::Success,
                                        )
                                    }
                                    Err(_s) => {
                                        log::error!(peer=peer.to_string(), session_id=self.id; "Async lock string is not valid");
                                        RequestLockControl::Error
                                    }
                                };

                                MessageType::AsyncLockResponse
                                    .message_params(control as u8, 0)
                                    .no_payload()
                                    .write_to(&mut wr)
                                    .await?;
                            }
                        }
                        Message {
                            message_type: MessageType::AsyncRemoteLocalControl,
                            control_code: request,
                            message_parameter: message_id,
                            ..
                        } => {
                            log::debug!(peer=peer.to_string(), session_id=self.id, message_id=message_id; "Remote/local request = {}", request);
                            // Device before session state, same order as the sync channel
                            let mut dev = self.handle.inner_lock().await;
                            let mut shared = self.shared.lock().await;
                            let res = match request {
                                0 => {
                                    // Disable remote
                                    shared.enable_remote = false;
                                    dev.set_local_lockout(false);
                                    dev.set_remote(false)
                                }
                                1 => {
                                    // Enable remote
                                    shared.enable_remote = true;
                                    Ok(())
                                }
                                2 => {
                                    // Disable remote and go to local
                                    shared.enable_remote = false;
                                    dev.set_local_lockout(false);
                                    dev.set_remote(false)
                                }
                                3 => {
                                    // Enable remote and go to remote
                                    shared.enable_remote = true;
                                    dev.set_remote(true)
                                }
                                4 => {
                                    // Enable remote and lock out local
                                    shared.enable_remote = true;
                                    dev.set_local_lockout(true);
                                    Ok(())
                                }
                                5 => {
                                    // Enable remote, go to remote, and set local lockout
                                    shared.enable_remote = true;
                                    dev.set_local_lockout(true);
                                    dev.set_remote(true)
                                }
                                6 => {
                                    // Go to local without changing state of remote enable
                                    dev.set_remote(false)
                                }
                                _ => Err(DeviceError::NotSupported),
                            };
                            drop(dev);
                            drop(shared);

                            match res {
                                Ok(_) => {
                                    MessageType::AsyncRemoteLocalResponse
                                        .message_params(0, 0)
                                        .no_payload()
                                        .write_to(&mut wr)
                                        .await?
                                }
                                Err(DeviceError::NotSupported) => {
                                    send_nonfatal!(peer=peer.to_string(), session_id=self.id; &mut wr,
                                        NonFatalErrorCode::UnrecognizedControlCode,
                                        "Unrecognized control code",
                                    );
                                }
                                Err(_) => {
                                    send_nonfatal!(peer=peer.to_string(), session_id=self.id; &mut wr,
                                        NonFatalErrorCode::UnidentifiedError,
                                        "Internal error",
                                    );
                                }
                            }
                        }
                        Message {
                            message_type: MessageType::AsyncMaximumMessageSize,
                            payload,
                            ..
                        } => {
                            if payload.len() != 8 {
                                send_fatal!(peer=peer.to_string(), session_id=self.id;
                                    &mut wr, FatalErrorCode::PoorlyFormattedMessageHeader,
                                    "Expected 8 bytes in AsyncMaximumMessageSize payload"
                                )
                            }

                            let size = NetworkEndian::read_u64(payload.as_slice());
                            if size == 0 {
                                send_fatal!(peer=peer.to_string(), session_id=self.id;
                                    &mut wr, FatalErrorCode::PoorlyFormattedMessageHeader,
                                    "Maximum message size must not be zero"
                                )
                            }

                            // The negotiated size is what both sides can accept
                            let accepted = min(size, self.config.max_message_size);
                            {
                                let mut shared = self.shared.lock().await;
                                shared.max_message_size = accepted;
                            }
                            log::debug!(peer=peer.to_string(), session_id=self.id; "Max message size = {}", accepted);

                            let mut buf = [0u8; 8];
                            NetworkEndian::write_u64(&mut buf, accepted);
                            MessageType::AsyncMaximumMessageSizeResponse
                                .message_params(0, 0)
                                .with_payload(buf.to_vec())
                                .write_to(&mut wr)
                                .await?;
                        }
                        Message {
                            message_type: MessageType::AsyncDeviceClear,
                            ..
                        } => {
                            let mut shared = self.shared.lock().await;
                            log::debug!(peer=peer.to_string(), session_id=self.id; "Device clear");

                            // Queued response data is discarded by the clear
                            let interrupted = shared.mav;
                            let message_id = shared.read_message_id;
                            shared.clear_pending_output();

                            // Send a clear event to the synchronous channel
                            let _ = self.clear.try_send(());

                            // Announce preferred features
                            let features = FeatureBitmap::new(self.config.prefer_overlap);
                            drop(shared);

                            MessageType::AsyncDeviceClearAcknowledge
                                .message_params(features.0, 0)
                                .no_payload()
                                .write_to(&mut wr)
                                .await?;

                            if interrupted {
                                MessageType::AsyncInterrupted
                                    .message_params(0, message_id)
                                    .no_payload()
                                    .write_to(&mut wr)
                                    .await?;
                            }
                        }
                        Message {
                            message_type: MessageType::AsyncStatusQuery,
                            control_code,
                            message_parameter: message_id,
                            ..
                        } => {
                            let control = RmtDeliveredControl(control_code);
                            log::debug!(peer=peer.to_string(), session_id=self.id, message_id=message_id; "Status query, {}", control);

                            let stb = {
                                // Device before session state, same order as the sync channel
                                let mut dev = self.handle.inner_lock().await;
                                let mut shared = self.shared.lock().await;

                                // Enable remote
                                if shared.enable_remote {
                                    let _res = dev.set_remote(true);
                                }

                                // Status is reported before the RMT clears MAV
                                let stb = shared.stb(dev.get_status());
                                if control.rmt_delivered() {
                                    shared.rmt_delivered();
                                }
                                stb
                            };

                            srq.rearm();

                            MessageType::AsyncStatusResponse
                                .message_params(stb, 0)
                                .no_payload()
                                .write_to(&mut wr)
                                .await?;
                        }
                        Message {
                            message_type: MessageType::AsyncLockInfo,
                            ..
                        } => {
                            let (exclusive, num_shared) = self.handle.lock_info();

                            log::debug!(peer=peer.to_string(), session_id=self.id; "Lock info, exclusive={}, shared={}", exclusive, num_shared);

                            MessageType::AsyncLockInfoResponse
                                .message_params(exclusive.into(), num_shared)
                                .no_payload()
                                .write_to(&mut wr)
                                .await?;
                        }
                        _ => {
                            send_nonfatal!(peer=peer.to_string(), session_id=self.id; &mut wr,
                                NonFatalErrorCode::UnrecognizedMessageType,
                                "Unexpected message type in asynchronous channel",
                            );
                        }
                    }
                }
                Err(err) => {
                    // Send error to client and close if fatal
                    if err.is_fatal() {
                        Message::from(err).write_to(&mut wr).await?;
                        break Err(io::ErrorKind::Other.into());
                    } else {
                        Message::from(err).write_to(&mut wr).await?;
                    }
                }
            }
        }
    }
}
