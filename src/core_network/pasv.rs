use crate::core_network::DataChannelError;
use crate::ipc::PortAllocator;
use crate::session::Session;
use log::{debug, trace, warn};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// Ownership of a reserved passive port. The allocator hears about the port
/// exactly once, on `release` or on drop, whichever comes first.
pub(crate) struct PortLease {
    port: u16,
    allocator: Option<Arc<dyn PortAllocator>>,
}

impl PortLease {
    pub(crate) fn new(port: u16, allocator: Arc<dyn PortAllocator>) -> Self {
        Self {
            port,
            allocator: Some(allocator),
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Returns false if the port was already handed back.
    pub(crate) fn release(&mut self) -> bool {
        match self.allocator.take() {
            Some(allocator) => {
                debug!("Freeing passive port {}", self.port);
                allocator.free_passive_port(self.port);
                true
            }
            None => false,
        }
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Listener serving a single passive data connection.
pub struct PassiveChannel {
    listener: Option<TcpListener>,
    lease: PortLease,
}

impl PassiveChannel {
    /// Binds `(listen, lease.port())`. On failure the lease is dropped with the
    /// error, which frees the port.
    pub(crate) async fn bind(listen: IpAddr, lease: PortLease) -> io::Result<Self> {
        let listener = TcpListener::bind((listen, lease.port())).await?;
        debug!(
            "PASV listener set up on IP: {}, Port: {}",
            listen,
            lease.port()
        );
        Ok(Self {
            listener: Some(listener),
            lease,
        })
    }

    pub fn port(&self) -> u16 {
        self.lease.port()
    }

    /// Waits for the session's client to connect. Connections from any other
    /// address are dropped and the listener keeps waiting.
    pub(crate) async fn accept(
        &self,
        session: &Session,
    ) -> Result<(TcpStream, SocketAddr), DataChannelError> {
        let listener = self.listener.as_ref().ok_or(DataChannelError::Closed)?;

        loop {
            let (stream, peer) = listener.accept().await.map_err(DataChannelError::Accept)?;
            trace!("Inbound data connection from {} on port {}", peer, self.port());

            // PASV theft protection: the data connection must come from the
            // control connection's IP. A peer sharing that IP still gets through.
            if !same_origin(peer.ip(), session.client_ip) {
                warn!(
                    "Dropping data connection from {} on passive port {}, expected {}",
                    peer,
                    self.port(),
                    session.client_ip
                );
                drop(stream);
                continue;
            }

            debug!("Accepted data connection from: {}", peer);
            return Ok((stream, peer));
        }
    }

    /// Closes the listener. Returns the port if this call ended the lease.
    pub(crate) fn close(&mut self) -> Option<u16> {
        self.listener = None;
        self.lease.release().then(|| self.lease.port())
    }
}

pub(crate) fn same_origin(peer: IpAddr, client: IpAddr) -> bool {
    peer.to_canonical() == client.to_canonical()
}
