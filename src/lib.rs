//! Session state and data channel core of rouilleftpd.
//!
//! A `Session` is created per control connection. Command handlers ask a
//! `DataChannelManager` for a `DataChannel` in the mode the session
//! negotiated, `establish` it to get the `DataTransport`, move the payload,
//! then `release` it so the byte counters and passive port are settled.

pub mod config;
pub mod core_log;
pub mod core_network;
pub mod ipc;
pub mod session;

pub use config::Config;
pub use core_network::{DataChannel, DataChannelError, DataChannelManager, DataTransport};
pub use ipc::{Ipc, IpcMessage, PassivePortPool, PortAllocator};
pub use session::{ActiveMode, ChannelInfo, DataMode, ModeKind, PassiveMode, Session};
