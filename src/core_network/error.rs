use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataChannelError {
    /// Programming error in the caller, fatal to the request.
    #[error("Data transfer mode is neither passive nor active: {0:?}")]
    UnknownMode(String),

    #[error("Invalid data channel listen address: {0}")]
    InvalidListenAddress(String),

    #[error("Failed to accept data connection: {0}")]
    Accept(#[source] io::Error),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("No data connection within {0:?}")]
    Timeout(Duration),

    #[error("Data channel already carried its transfer")]
    AlreadyEstablished,

    #[error("Data channel is closed")]
    Closed,
}

impl DataChannelError {
    pub fn to_ftp_response(&self) -> String {
        match self {
            DataChannelError::Accept(_)
            | DataChannelError::Connect { .. }
            | DataChannelError::Timeout(_)
            | DataChannelError::Closed => "425 Can't open data connection.\r\n".to_string(),
            DataChannelError::UnknownMode(_) => {
                "504 Command not implemented for that parameter.\r\n".to_string()
            }
            _ => "451 Requested action aborted. Local error in processing.\r\n".to_string(),
        }
    }
}
