pub mod error;
pub mod message;
pub mod channel;
pub mod connection;
pub mod memory;
pub mod tcp;
pub mod request_channel;
pub mod request_connection;

pub use channel::Channel;
pub use connection::{Connection, Connector, UpstreamChannel};
pub use error::NetError;
pub use memory::MemoryChannel;
pub use message::MessageHeader;
pub use request_channel::RequestChannel;
pub use request_connection::{Message, RequestConnection, RequestHandler};
pub use tcp::{TcpChannel, TcpConnector};
