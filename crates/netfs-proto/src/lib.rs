pub mod types;
pub mod requests;
pub mod datagram;

pub use datagram::{BroadcastMessage, BroadcastType};
pub use requests::*;
pub use types::*;

pub const DEFAULT_CONNECTION_PORT: u16 = 55555;
pub const DEFAULT_BROADCAST_PORT: u16 = 55556;
pub const DEFAULT_SERVER_INFO_PORT: u16 = 55557;
