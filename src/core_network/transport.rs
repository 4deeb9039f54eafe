use crate::core_log::log_socket_error;
use log::debug;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// The data connection of one transfer, counting every byte it moves.
#[derive(Debug)]
pub struct DataTransport {
    stream: TcpStream,
    peer: SocketAddr,
    bytes_read: u64,
    bytes_written: u64,
    upload_buffer_size: usize,
    download_buffer_size: usize,
}

impl DataTransport {
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        upload_buffer_size: usize,
        download_buffer_size: usize,
    ) -> Self {
        Self {
            stream,
            peer,
            bytes_read: 0,
            bytes_written: 0,
            upload_buffer_size: upload_buffer_size.max(1),
            download_buffer_size: download_buffer_size.max(1),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_read + self.bytes_written
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf).await {
            Ok(n) => {
                self.bytes_read += n as u64;
                Ok(n)
            }
            Err(e) => {
                log_socket_error(&e);
                Err(e)
            }
        }
    }

    /// Writes the whole buffer. Bytes handed to the socket before a failure
    /// stay counted.
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < buf.len() {
            match self.stream.write(&buf[offset..]).await {
                Ok(0) => {
                    let e = io::Error::from(io::ErrorKind::WriteZero);
                    log_socket_error(&e);
                    return Err(e);
                }
                Ok(n) => {
                    offset += n;
                    self.bytes_written += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log_socket_error(&e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Streams `reader` to the client (RETR, LIST). Returns the bytes sent.
    pub async fn send_from<R>(&mut self, reader: &mut R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = vec![0; self.download_buffer_size];
        let mut sent = 0u64;
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            self.write_all(&buffer[..n]).await?;
            sent += n as u64;
        }
        self.flush().await?;
        Ok(sent)
    }

    /// Stores everything the client sends into `writer` (STOR). Returns the bytes received.
    pub async fn receive_into<W>(&mut self, writer: &mut W) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buffer = vec![0; self.upload_buffer_size];
        let mut received = 0u64;
        loop {
            let n = self.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buffer[..n]).await?;
            received += n as u64;
        }
        writer.flush().await?;
        Ok(received)
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().await.map_err(|e| {
            log_socket_error(&e);
            e
        })
    }

    /// Graceful close: flushes and sends FIN.
    pub(crate) async fn shutdown(&mut self) {
        match self.stream.shutdown().await {
            Ok(()) => debug!("Data connection to {} shut down", self.peer),
            // Already gone on the other side.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
            Err(e) => {
                log_socket_error(&e);
            }
        }
    }
}
