use env_logger::{Builder, Env};
use log::{debug, error, SetLoggerError};
use std::io::{self, ErrorKind, Write};

fn builder() -> Builder {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));
    builder.format(|buf, record| {
        let timestamp = buf.timestamp();
        writeln!(
            buf,
            "[{}] [{}] {}",
            timestamp,
            record.level(),
            record.args()
        )
    });
    builder
}

/// Initializes the global logger. Panics if a logger is already installed.
pub fn init_logger() {
    builder().init();
}

/// Same as `init_logger`, but reports an already installed logger instead of panicking.
pub fn try_init_logger() -> Result<(), SetLoggerError> {
    builder().try_init()
}

/// Reports a socket error seen on a data channel.
///
/// A peer reset only means the client dropped the data connection, so it is
/// kept out of the error log. Returns whether an error entry was written.
pub fn log_socket_error(err: &io::Error) -> bool {
    if err.kind() == ErrorKind::ConnectionReset {
        debug!("Data channel reset by peer: {}", err);
        return false;
    }

    error!("Socket error in the data channel, err: {}", err);
    true
}
