use std::cmp::min;
use std::collections::HashMap;
use std::io;
use std::net::Shutdown;
use std::str::from_utf8;

use async_std::channel::{Receiver, Sender};
use async_std::net::{TcpListener, TcpStream, ToSocketAddrs};
use async_std::sync::Arc;
use async_std::task;
use futures::lock::Mutex;
use futures::StreamExt;

use hislip_device::lock::{LockHandle, SharedLock, SpinMutex};
use hislip_device::status;
use hislip_device::Device;

use crate::common::errors::{Error, FatalErrorCode, NonFatalErrorCode};
use crate::common::messages::prelude::*;
use crate::common::Protocol;

mod config;
pub(crate) mod session;

pub use config::ServerConfig;
pub use session::SessionMode;

use session::asynchronous::AsyncSession;
use session::synchronous::SyncSession;
use session::{SessionState, SharedSession};

/// Ceiling for reads during the connection handshake, before any session
/// limit applies.
const HANDSHAKE_MAX_MESSAGE_SIZE: u64 = 256 * 1024;

/// Per-session maximum message size until AsyncMaximumMessageSize is negotiated.
const DEFAULT_SESSION_MESSAGE_SIZE: u64 = 1024 * 1024;

/// One registered instrument endpoint, addressed by its sub-address.
struct Endpoint<DEV> {
    device: Arc<Mutex<DEV>>,
    shared_lock: Arc<SpinMutex<SharedLock>>,
    srq: status::Sender,
}

pub struct ServerBuilder<DEV> {
    config: ServerConfig,
    devices: HashMap<String, Endpoint<DEV>>,
}

impl<DEV> Default for ServerBuilder<DEV>
where
    DEV: Device,
{
    fn default() -> Self {
        Self {
            config: ServerConfig::default(),
            devices: HashMap::new(),
        }
    }
}

impl<DEV> ServerBuilder<DEV>
where
    DEV: Device,
{
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            devices: HashMap::new(),
        }
    }

    /// Register a device endpoint, e.g. "hislip0".
    /// Clients selecting an unregistered sub-address are rejected.
    pub fn device(
        mut self,
        sub_address: String,
        device: Arc<Mutex<DEV>>,
        shared_lock: Arc<SpinMutex<SharedLock>>,
    ) -> Self {
        self.devices.insert(
            sub_address,
            Endpoint {
                device,
                shared_lock,
                srq: status::Sender::new(),
            },
        );
        self
    }

    pub fn build(self) -> Arc<Server<DEV>> {
        Arc::new(Server {
            config: self.config,
            devices: self.devices,
            inner: Arc::new(Mutex::new(InnerServer {
                last_session_id: 0,
                sessions: HashMap::new(),
            })),
        })
    }
}

pub struct Server<DEV> {
    config: ServerConfig,
    devices: HashMap<String, Endpoint<DEV>>,
    inner: Arc<Mutex<InnerServer<DEV>>>,
}

impl<DEV> Server<DEV>
where
    DEV: Device + Send + 'static,
{
    /// Service request handle for a registered endpoint. Pushing a status byte
    /// into it sends an AsyncServiceRequest to every connected session of the
    /// endpoint.
    pub fn status_sender(&self, sub_address: &str) -> Option<status::Sender> {
        self.devices.get(sub_address).map(|e| e.srq.clone())
    }

    /// Bind `addr` and start accepting connections from it.
    pub async fn accept(self: Arc<Self>, addr: impl ToSocketAddrs) -> Result<(), io::Error> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Start accepting connections from an already bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), io::Error> {
        let mut incoming = listener.incoming();
        while let Some(stream) = incoming.next().await {
            let stream = stream?;
            let peer = stream.peer_addr()?;
            log::info!("{} connected", peer);

            let s = self.clone();
            task::spawn(async move {
                let res = s.handle_connection(stream).await;
                if let Err(err) = res {
                    log::error!("{} disconnected: {}", peer, err)
                } else {
                    log::info!("{} disconnected", peer)
                }
            });
        }
        Ok(())
    }

    /// The connection handling function.
    ///
    /// Runs the handshake until the connection declares itself as the
    /// synchronous or asynchronous channel of a session, then hands over to
    /// the matching channel handler. Either channel failing tears down the
    /// whole session.
    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), io::Error> {
        let peer = stream.peer_addr()?;
        let mut s = &stream;

        loop {
            match Message::read_from(&mut s, HANDSHAKE_MAX_MESSAGE_SIZE).await? {
                Ok(msg) => {
                    match msg.message_type {
                        MessageType::VendorSpecific(code) => {
                            log::warn!(peer=peer.to_string();
                                "Unrecognized Vendor Defined Message ({}) during init", code
                            );
                            Message::from(Error::NonFatal(
                                NonFatalErrorCode::UnrecognizedVendorDefinedMessage,
                                "Unrecognized Vendor Defined Message".to_string(),
                            ))
                            .write_to(&mut s)
                            .await?;
                        }
                        MessageType::FatalError => {
                            log::error!(peer=peer.to_string();
                                "Client fatal error: {}",
                                from_utf8(&msg.payload).unwrap_or("<invalid utf8>")
                            );
                            // Let the client close the connection
                        }
                        MessageType::Error => {
                            log::warn!(peer=peer.to_string();
                                "Client error: {}",
                                from_utf8(&msg.payload).unwrap_or("<invalid utf8>")
                            );
                        }
                        MessageType::Initialize => {
                            let client_parameters = InitializeParameter(msg.message_parameter);

                            if !msg.payload.is_ascii() {
                                Message::from(Error::Fatal(
                                    FatalErrorCode::InvalidInitialization,
                                    "Invalid sub-address".to_string(),
                                ))
                                .write_to(&mut s)
                                .await?;
                                break;
                            }
                            let sub_address = match String::from_utf8(msg.payload) {
                                Ok(sub_address) => sub_address,
                                Err(_) => {
                                    Message::from(Error::Fatal(
                                        FatalErrorCode::InvalidInitialization,
                                        "Invalid sub-address".to_string(),
                                    ))
                                    .write_to(&mut s)
                                    .await?;
                                    break;
                                }
                            };
                            log::debug!(peer=peer.to_string();
                                "Sync initialize {:?}, version={}, vendor={:#06x}",
                                sub_address,
                                client_parameters.client_protocol(),
                                client_parameters.client_vendorid()
                            );

                            // The embedding registers the sub-addresses it accepts,
                            // anything else is rejected here
                            let endpoint = match self.devices.get(&sub_address) {
                                Some(endpoint) => endpoint,
                                None => {
                                    Message::from(Error::Fatal(
                                        FatalErrorCode::InvalidInitialization,
                                        format!("Unknown sub-address {:?}", sub_address),
                                    ))
                                    .write_to(&mut s)
                                    .await?;
                                    break;
                                }
                            };

                            let lowest_protocol =
                                min(self.config.protocol, client_parameters.client_protocol());

                            // Create and register a new session
                            let created = {
                                let mut guard = self.inner.lock().await;
                                guard.create_session(
                                    &self.config,
                                    endpoint,
                                    sub_address,
                                    lowest_protocol,
                                    stream.clone(),
                                )
                            };
                            let (session_id, shared, handle, clear) = match created {
                                Ok(x) => x,
                                Err(err) => {
                                    Message::from(err).write_to(&mut s).await?;
                                    break;
                                }
                            };
                            log::debug!(peer=peer.to_string(), session_id=session_id; "New session");

                            let response_parameter =
                                InitializeResponseParameter::new(lowest_protocol, session_id);
                            let control =
                                InitializeResponseControl::new(self.config.prefer_overlap);
                            MessageType::InitializeResponse
                                .message_params(control.0, response_parameter.0)
                                .no_payload()
                                .write_to(&mut s)
                                .await?;

                            // Connection is the synchronous channel of the session
                            let res = SyncSession::new(
                                session_id,
                                self.config.clone(),
                                shared,
                                handle,
                                clear,
                            )
                            .handle_session(&stream, peer)
                            .await;

                            self.disconnect(session_id).await;
                            return res;
                        }
                        MessageType::AsyncInitialize => {
                            // Connect to an existing session
                            let session_id = (msg.message_parameter & 0x0000FFFF) as u16;

                            let attached = {
                                let mut guard = self.inner.lock().await;
                                guard.attach_async(session_id, stream.clone())
                            };
                            let (shared, handle, clear, srq) = match attached {
                                Ok(x) => x,
                                Err(err) => {
                                    // The existing session is left untouched
                                    Message::from(err).write_to(&mut s).await?;
                                    break;
                                }
                            };
                            // Both channels are now established
                            {
                                let mut guard = shared.lock().await;
                                guard.set_state(SessionState::Normal);
                                log::debug!(peer=peer.to_string(), session_id=session_id;
                                    "Async initialize, protocol {}", guard.protocol);
                            }

                            let parameter =
                                AsyncInitializeResponseParameter::new(self.config.vendor_id);
                            MessageType::AsyncInitializeResponse
                                .message_params(0, parameter.0)
                                .no_payload()
                                .write_to(&mut s)
                                .await?;

                            // Connection is the asynchronous channel of the session
                            let res = AsyncSession::new(
                                session_id,
                                self.config.clone(),
                                shared,
                                handle,
                                clear,
                            )
                            .handle_session(&stream, peer, srq)
                            .await;

                            self.disconnect(session_id).await;
                            return res;
                        }
                        _ => {
                            log::error!(peer=peer.to_string(); "Unexpected message type during handshake");
                            Message::from(Error::Fatal(
                                FatalErrorCode::InvalidInitialization,
                                "Unexpected message during initialization".to_string(),
                            ))
                            .write_to(&mut s)
                            .await?;
                            break;
                        }
                    }
                }
                Err(err) => {
                    let fatal = err.is_fatal();
                    Message::from(err).write_to(&mut s).await?;
                    if fatal {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Remove a session from the registry and tear down both of its channels.
    /// Idempotent, both channel handlers call it on exit.
    async fn disconnect(&self, session_id: u16) {
        let record = { self.inner.lock().await.sessions.remove(&session_id) };
        if let Some(record) = record {
            let sub_address = record.shared.lock().await.sub_address.clone();

            // Release any lock the session might be holding
            record.handle.force_release();

            // A session is not viable with one channel
            let _ = record.sync_stream.shutdown(Shutdown::Both);
            if let Some(async_stream) = record.async_stream {
                let _ = async_stream.shutdown(Shutdown::Both);
            }
            log::info!(session_id=session_id, sub_address=sub_address; "Session closed");
        }
    }
}

/// A registered session and everything needed to tear it down.
struct SessionRecord<DEV> {
    shared: Arc<Mutex<SharedSession>>,
    handle: LockHandle<DEV>,
    clear_tx: Sender<()>,
    srq: status::Sender,
    sync_stream: TcpStream,
    async_stream: Option<TcpStream>,
}

struct InnerServer<DEV> {
    last_session_id: u16,
    sessions: HashMap<u16, SessionRecord<DEV>>,
}

impl<DEV> InnerServer<DEV>
where
    DEV: Device,
{
    /// Get the next available session id.
    /// Ids increase strictly, 0 is reserved as "no session" and ids of live
    /// sessions are never handed out again.
    fn new_session_id(&mut self) -> Result<u16, Error> {
        let origin = self.last_session_id;
        loop {
            self.last_session_id = self.last_session_id.wrapping_add(1);
            if self.last_session_id == origin {
                // Wrapped all the way around, no more ids...
                return Err(Error::Fatal(
                    FatalErrorCode::MaximumClientsExceeded,
                    "Out of session ids".to_string(),
                ));
            }
            if self.last_session_id != 0 && !self.sessions.contains_key(&self.last_session_id) {
                return Ok(self.last_session_id);
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn create_session(
        &mut self,
        config: &ServerConfig,
        endpoint: &Endpoint<DEV>,
        sub_address: String,
        protocol: Protocol,
        sync_stream: TcpStream,
    ) -> Result<(u16, Arc<Mutex<SharedSession>>, LockHandle<DEV>, Receiver<()>), Error> {
        if self.sessions.len() >= config.max_num_sessions {
            return Err(Error::Fatal(
                FatalErrorCode::MaximumClientsExceeded,
                "Maximum number of clients exceeded".to_string(),
            ));
        }
        let session_id = self.new_session_id()?;

        let mode = if config.prefer_overlap {
            SessionMode::Overlapped
        } else {
            SessionMode::Synchronized
        };
        let session = SharedSession::new(
            protocol,
            sub_address,
            mode,
            min(DEFAULT_SESSION_MESSAGE_SIZE, config.max_message_size),
        );
        let clear_rx = session.get_clear_receiver();
        let clear_tx = session.get_clear_sender();
        let shared = Arc::new(Mutex::new(session));

        let handle = LockHandle::new(endpoint.shared_lock.clone(), endpoint.device.clone());

        self.sessions.insert(
            session_id,
            SessionRecord {
                shared: shared.clone(),
                handle: handle.clone(),
                clear_tx,
                srq: endpoint.srq.clone(),
                sync_stream,
                async_stream: None,
            },
        );

        Ok((session_id, shared, handle, clear_rx))
    }

    #[allow(clippy::type_complexity)]
    fn attach_async(
        &mut self,
        session_id: u16,
        stream: TcpStream,
    ) -> Result<
        (
            Arc<Mutex<SharedSession>>,
            LockHandle<DEV>,
            Sender<()>,
            status::Receiver,
        ),
        Error,
    > {
        match self.sessions.get_mut(&session_id) {
            None => Err(Error::Fatal(
                FatalErrorCode::InvalidInitialization,
                "Invalid session id".to_string(),
            )),
            Some(record) if record.async_stream.is_some() => Err(Error::Fatal(
                FatalErrorCode::InvalidInitialization,
                "Asynchronous channel already established".to_string(),
            )),
            Some(record) => {
                record.async_stream = Some(stream);
                Ok((
                    record.shared.clone(),
                    record.handle.clone(),
                    record.clear_tx.clone(),
                    record.srq.subscribe(),
                ))
            }
        }
    }
}
