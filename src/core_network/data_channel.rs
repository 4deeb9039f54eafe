use crate::config::{Config, DEFAULT_DOWNLOAD_BUFFER_SIZE, DEFAULT_UPLOAD_BUFFER_SIZE};
use crate::core_log::log_socket_error;
use crate::core_network::pasv::{PassiveChannel, PortLease};
use crate::core_network::port::ActiveChannel;
use crate::core_network::{DataChannelError, DataTransport};
use crate::ipc::PortAllocator;
use crate::session::{ChannelInfo, DataMode, ModeKind, Session};
use chrono::Local;
use log::{debug, info, warn};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// Builds data channels in the mode recorded on a session.
#[derive(Clone)]
pub struct DataChannelManager {
    listen: IpAddr,
    allocator: Arc<dyn PortAllocator>,
    timeout: Option<Duration>,
    upload_buffer_size: usize,
    download_buffer_size: usize,
}

impl DataChannelManager {
    pub fn new(listen: IpAddr, allocator: Arc<dyn PortAllocator>) -> Self {
        Self {
            listen,
            allocator,
            timeout: None,
            upload_buffer_size: DEFAULT_UPLOAD_BUFFER_SIZE,
            download_buffer_size: DEFAULT_DOWNLOAD_BUFFER_SIZE,
        }
    }

    pub fn from_config(
        config: &Config,
        allocator: Arc<dyn PortAllocator>,
    ) -> Result<Self, DataChannelError> {
        let server = &config.server;
        let listen = server
            .listen_addr()
            .map_err(|_| DataChannelError::InvalidListenAddress(server.listen.clone()))?;

        let mut manager = Self::new(listen, allocator).with_buffer_sizes(
            server.upload_buffer_size(),
            server.download_buffer_size(),
        );
        manager.timeout = server.data_timeout();
        Ok(manager)
    }

    /// Bounds how long `establish` waits for the data connection.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_buffer_sizes(mut self, upload: usize, download: usize) -> Self {
        self.upload_buffer_size = upload;
        self.download_buffer_size = download;
        self
    }

    pub fn listen_addr(&self) -> IpAddr {
        self.listen
    }

    /// Allocates the listener (passive) or outbound socket (active) for the
    /// next transfer.
    ///
    /// `None` means nothing could be set up: PASV or PORT has not been
    /// negotiated yet, or the socket layer refused the resource.
    pub async fn create(&self, session: &mut Session) -> Option<DataChannel> {
        let mode = session.mode.clone();
        let endpoint = match &mode {
            DataMode::Passive(passive) => {
                if passive.port == 0 {
                    debug!("No passive port reserved, PASV not negotiated");
                    return None;
                }

                // From here on the lease owns the port, the session no longer does.
                let port = passive.port;
                let lease = PortLease::new(port, Arc::clone(&self.allocator));
                session.clear_passive_port(port);

                match PassiveChannel::bind(self.listen, lease).await {
                    Ok(channel) => Endpoint::Passive(channel),
                    Err(e) => {
                        // The lease went down with the failed bind.
                        log_socket_error(&e);
                        return None;
                    }
                }
            }
            DataMode::Active(active) => {
                let addr = match (active.client_ip, active.client_port) {
                    (Some(ip), port) if port != 0 => SocketAddr::new(ip, port),
                    _ => {
                        debug!("No active destination, PORT not negotiated");
                        return None;
                    }
                };

                // PORT is one-shot: the destination now lives in the channel.
                session.clear_active_mode();

                match ActiveChannel::open(addr) {
                    Ok(channel) => Endpoint::Active(channel),
                    Err(e) => {
                        log_socket_error(&e);
                        return None;
                    }
                }
            }
        };

        Some(DataChannel {
            endpoint,
            established: false,
            timeout: self.timeout,
            upload_buffer_size: self.upload_buffer_size,
            download_buffer_size: self.download_buffer_size,
        })
    }
}

enum Endpoint {
    Passive(PassiveChannel),
    Active(ActiveChannel),
}

/// The resource behind one transfer: a passive listener or an active socket.
///
/// `establish` yields the transport, `release` does the accounting and
/// teardown. The negotiated PASV port or PORT destination is taken off the
/// session by `create`, so dropping the channel leaves nothing stale behind:
/// the passive port is freed by the lease, exactly once.
pub struct DataChannel {
    endpoint: Endpoint,
    established: bool,
    timeout: Option<Duration>,
    upload_buffer_size: usize,
    download_buffer_size: usize,
}

impl DataChannel {
    pub fn kind(&self) -> ModeKind {
        match self.endpoint {
            Endpoint::Passive(_) => ModeKind::Passive,
            Endpoint::Active(_) => ModeKind::Active,
        }
    }

    /// Port the passive listener is bound to.
    pub fn local_port(&self) -> Option<u16> {
        match &self.endpoint {
            Endpoint::Passive(passive) => Some(passive.port()),
            Endpoint::Active(_) => None,
        }
    }

    /// Accepts (passive) or connects (active) the data connection and records
    /// it on the session.
    ///
    /// A failure ends the channel: the listener is closed or the PORT
    /// destination forgotten. The control connection is not affected.
    pub async fn establish(
        &mut self,
        session: &mut Session,
    ) -> Result<DataTransport, DataChannelError> {
        if self.established {
            return Err(DataChannelError::AlreadyEstablished);
        }

        let timeout = self.timeout;
        let result = match &mut self.endpoint {
            Endpoint::Passive(passive) => with_timeout(timeout, passive.accept(session)).await,
            Endpoint::Active(active) => with_timeout(timeout, active.connect()).await,
        };

        let (stream, peer) = match result {
            Ok(connection) => connection,
            Err(DataChannelError::Closed) => return Err(DataChannelError::Closed),
            Err(e) => {
                match &e {
                    DataChannelError::Accept(source)
                    | DataChannelError::Connect { source, .. } => {
                        log_socket_error(source);
                    }
                    other => warn!("Data channel for {} abandoned: {}", session.client_ip, other),
                }
                self.finish();
                return Err(e);
            }
        };

        self.established = true;
        session.data_channel = Some(ChannelInfo {
            kind: self.kind(),
            peer,
            opened_at: Local::now(),
        });
        info!("{} data connection established with {}", self.kind(), peer);

        Ok(self.transport(stream, peer))
    }

    /// Ends the transfer: counts the transport's bytes into the session,
    /// clears the live channel, closes the transport and the listener.
    /// Returns the bytes moved by this transfer.
    pub async fn release(mut self, session: &mut Session, mut transport: DataTransport) -> u64 {
        let bytes = transport.bytes_total();
        session.bytes_transferred += bytes;
        session.data_channel = None;

        transport.shutdown().await;
        drop(transport);
        self.finish();

        info!(
            "Data channel released, {} bytes transferred ({} total)",
            bytes, session.bytes_transferred
        );
        bytes
    }

    /// Abandons the channel without accounting.
    pub fn close(mut self, session: &mut Session) {
        if self.established {
            session.data_channel = None;
        }
        self.finish();
    }

    fn transport(&self, stream: TcpStream, peer: SocketAddr) -> DataTransport {
        DataTransport::new(
            stream,
            peer,
            self.upload_buffer_size,
            self.download_buffer_size,
        )
    }

    // Closure path, shared by every way a channel ends. The session fields
    // were already cleared by `create`.
    fn finish(&mut self) {
        match &mut self.endpoint {
            Endpoint::Passive(passive) => {
                if let Some(port) = passive.close() {
                    debug!("Passive listener on port {} closed", port);
                }
            }
            Endpoint::Active(active) => active.close(),
        }
    }
}

async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> Result<T, DataChannelError>
where
    F: Future<Output = Result<T, DataChannelError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| DataChannelError::Timeout(limit))?,
        None => fut.await,
    }
}
