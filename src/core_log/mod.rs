pub mod logger;

pub use logger::{init_logger, log_socket_error, try_init_logger};
