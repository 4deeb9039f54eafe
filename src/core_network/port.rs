use crate::core_network::DataChannelError;
use log::{debug, info};
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpSocket, TcpStream};

/// Outbound socket for an active mode (PORT) transfer.
pub struct ActiveChannel {
    socket: Option<TcpSocket>,
    addr: SocketAddr,
}

impl ActiveChannel {
    pub(crate) fn open(addr: SocketAddr) -> io::Result<Self> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        debug!("Active data socket allocated for {}", addr);
        Ok(Self {
            socket: Some(socket),
            addr,
        })
    }

    pub(crate) async fn connect(&mut self) -> Result<(TcpStream, SocketAddr), DataChannelError> {
        let socket = self.socket.take().ok_or(DataChannelError::Closed)?;
        let stream = socket
            .connect(self.addr)
            .await
            .map_err(|source| DataChannelError::Connect {
                addr: self.addr,
                source,
            })?;
        info!("Connection established with {}", self.addr);
        Ok((stream, self.addr))
    }

    pub(crate) fn close(&mut self) {
        self.socket = None;
    }
}
