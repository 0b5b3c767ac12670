pub mod config;
pub mod retry;
pub mod task;
pub mod auth;
pub mod vfs;

pub mod volume;
pub mod volume_manager;
pub mod query_manager;

pub mod virtual_volume;
pub mod root_volume;
pub mod server_volume;
pub mod share_volume;

pub mod server_connection;
pub mod server_manager;

#[cfg(test)]
pub(crate) mod test_support;

pub use auth::{CredentialPrompt, Credentials, StaticCredentials};
pub use config::ClientConfig;
pub use query_manager::{QueryIterator, QueryIteratorRef, QueryManager};
pub use root_volume::{RootVolume, ioctl};
pub use server_manager::{ServerManager, ServerManagerListener, ServerState};
pub use server_volume::ServerVolume;
pub use share_volume::ShareVolume;
pub use task::{Task, TaskManager};
pub use vfs::{HostVfs, NodeMonitorEvent, VnodeTable};
pub use volume::{DirCookie, DirEntry, Stat, Volume, VolumeEvent, VolumeRef};
pub use volume_manager::VolumeManager;
