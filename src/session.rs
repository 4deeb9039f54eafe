use crate::core_network::DataChannelError;
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Which side opens the data connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModeKind {
    Active,
    Passive,
}

impl ModeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModeKind::Active => "active",
            ModeKind::Passive => "passive",
        }
    }
}

impl fmt::Display for ModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses the literal `"active"` / `"passive"` tokens.
///
/// `UnknownMode` means the caller stored a mode the server never offers.
/// That is a bug in the command layer, not a client error, and the request
/// must be aborted rather than answered with a best-effort channel.
impl FromStr for ModeKind {
    type Err = DataChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ModeKind::Active),
            "passive" => Ok(ModeKind::Passive),
            other => Err(DataChannelError::UnknownMode(other.to_string())),
        }
    }
}

/// Destination negotiated by PORT. Reset after each use.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveMode {
    pub client_ip: Option<IpAddr>,
    pub client_port: u16,
}

/// Port reserved by PASV, `0` when nothing is reserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassiveMode {
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataMode {
    Active(ActiveMode),
    Passive(PassiveMode),
}

impl Default for DataMode {
    fn default() -> Self {
        DataMode::Active(ActiveMode::default())
    }
}

impl DataMode {
    pub fn kind(&self) -> ModeKind {
        match self {
            DataMode::Active(_) => ModeKind::Active,
            DataMode::Passive(_) => ModeKind::Passive,
        }
    }

    pub fn active(&self) -> Option<&ActiveMode> {
        match self {
            DataMode::Active(active) => Some(active),
            DataMode::Passive(_) => None,
        }
    }

    pub fn passive(&self) -> Option<&PassiveMode> {
        match self {
            DataMode::Passive(passive) => Some(passive),
            DataMode::Active(_) => None,
        }
    }
}

/// What the session knows about the live data transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub kind: ModeKind,
    pub peer: SocketAddr,
    pub opened_at: DateTime<Local>,
}

/// Protocol and transfer state of one control connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub client_ip: IpAddr,
    pub authenticated: bool,
    pub user: String,
    pub cwd: String,
    pub chroot_home: String,
    pub rnfr: Option<String>, // Rename from (RNFR)
    pub type_: String,        // RFC 959 representation type
    pub binary: bool,
    pub transfer_type: String, // Human friendly label for type_
    pub mode: DataMode,
    pub rest_byte_count: u64,
    pub parameters: HashMap<String, String>,
    pub bytes_transferred: u64,
    pub data_channel: Option<ChannelInfo>,
    pub transfer_mode: String, // S => Stream, B => Block, C => Compressed
}

impl Session {
    pub fn new(client_ip: IpAddr) -> Self {
        let mut parameters = HashMap::new();
        parameters.insert("UTF8".to_string(), "on".to_string());

        Self {
            client_ip,
            authenticated: false,
            user: String::new(),
            cwd: String::from("/"),
            chroot_home: String::from("/"),
            rnfr: None,
            type_: "L8".to_string(),
            binary: false,
            transfer_type: "ASCII".to_string(),
            mode: DataMode::default(),
            rest_byte_count: 0,
            parameters,
            bytes_transferred: 0,
            data_channel: None,
            transfer_mode: "S".to_string(),
        }
    }

    /// REIN: resets the session to its defaults and hands back the previous state.
    ///
    /// The client address belongs to the control connection and survives. A live
    /// data channel must be closed by the caller beforehand.
    pub fn reinitialize(&mut self) -> Session {
        std::mem::replace(self, Session::new(self.client_ip))
    }

    pub fn is_transferring(&self) -> bool {
        self.data_channel.is_some()
    }

    pub fn enter_passive(&mut self, port: u16) {
        self.mode = DataMode::Passive(PassiveMode { port });
    }

    pub fn enter_active(&mut self, client_ip: IpAddr, client_port: u16) {
        self.mode = DataMode::Active(ActiveMode {
            client_ip: Some(client_ip),
            client_port,
        });
    }

    /// Forces a new PORT before the next active transfer.
    pub(crate) fn clear_active_mode(&mut self) {
        if let DataMode::Active(active) = &mut self.mode {
            *active = ActiveMode::default();
        }
    }

    /// Forgets the reserved passive port, unless a later PASV replaced it.
    pub(crate) fn clear_passive_port(&mut self, port: u16) {
        if let DataMode::Passive(passive) = &mut self.mode {
            if passive.port == port {
                passive.port = 0;
            }
        }
    }
}
