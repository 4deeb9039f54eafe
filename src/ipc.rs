use log::{debug, warn};
use rand::Rng;
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Receives passive port lifecycle notifications from the data channel.
pub trait PortAllocator: Send + Sync {
    fn free_passive_port(&self, port: u16);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcMessage {
    FreePassivePort { port: u16 },
}

impl IpcMessage {
    pub fn action(&self) -> &'static str {
        match self {
            IpcMessage::FreePassivePort { .. } => "free_passive_port",
        }
    }
}

/// Sender side of the link to the port supervisor.
#[derive(Debug, Clone)]
pub struct Ipc {
    sender: mpsc::UnboundedSender<IpcMessage>,
}

impl Ipc {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<IpcMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn send(&self, message: IpcMessage) {
        let action = message.action();
        if self.sender.send(message).is_err() {
            warn!("Port supervisor is gone, dropping {} message", action);
        }
    }
}

impl PortAllocator for Ipc {
    fn free_passive_port(&self, port: u16) {
        self.send(IpcMessage::FreePassivePort { port });
    }
}

/// Centrally coordinated pool of passive ports.
#[derive(Debug)]
pub struct PassivePortPool {
    range: RangeInclusive<u16>,
    in_use: Mutex<HashSet<u16>>,
}

impl PassivePortPool {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            range: min.max(1)..=max,
            in_use: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(config: &crate::config::ServerConfig) -> Self {
        Self::new(config.pasv_port_min, config.pasv_port_max)
    }

    /// Reserves a free port, scanning from a random offset so PASV ports are
    /// not handed out in a predictable order.
    pub fn reserve(&self) -> Option<u16> {
        let (min, max) = (*self.range.start(), *self.range.end());
        if min > max {
            return None;
        }

        let span = u32::from(max - min) + 1;
        let offset = rand::thread_rng().gen_range(0..span);
        let mut in_use = self.in_use.lock().unwrap_or_else(|e| e.into_inner());

        for step in 0..span {
            let port = min + ((offset + step) % span) as u16;
            if in_use.insert(port) {
                debug!("Reserved passive port {}", port);
                return Some(port);
            }
        }

        warn!("Passive port range {}-{} exhausted", min, max);
        None
    }

    /// Returns a port to the pool. False if it was not reserved.
    pub fn free(&self, port: u16) -> bool {
        self.in_use
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&port)
    }

    pub fn in_use(&self) -> usize {
        self.in_use.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl PortAllocator for PassivePortPool {
    fn free_passive_port(&self, port: u16) {
        if !self.free(port) {
            warn!("Passive port {} freed but was not reserved", port);
        }
    }
}

/// Drains port notifications into the pool until every `Ipc` sender is dropped.
pub async fn run_port_supervisor(
    pool: Arc<PassivePortPool>,
    mut receiver: mpsc::UnboundedReceiver<IpcMessage>,
) {
    while let Some(message) = receiver.recv().await {
        match message {
            IpcMessage::FreePassivePort { port } => {
                if pool.free(port) {
                    debug!("Passive port {} is free again", port);
                } else {
                    warn!("Passive port {} freed but was not reserved", port);
                }
            }
        }
    }
    debug!("Port supervisor stopped");
}
