pub mod data_channel;
pub mod error;
pub mod pasv;
pub mod port;
pub mod transport;

pub use data_channel::{DataChannel, DataChannelManager};
pub use error::DataChannelError;
pub use pasv::PassiveChannel;
pub use port::ActiveChannel;
pub use transport::DataTransport;
