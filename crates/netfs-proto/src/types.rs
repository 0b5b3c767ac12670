use netfs_types::{RemoteNodeId, Revision};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// Stat block as the server reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeStat {
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
    pub blksize: i32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub crtime: i64,
}

impl NodeStat {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: RemoteNodeId,
    pub stat: NodeStat,
    pub revision: Revision,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntryInfo {
    pub directory_id: RemoteNodeId,
    pub name: String,
    pub node_info: NodeInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttributeInfo {
    pub name: String,
    pub type_code: u32,
    pub size: i64,
    /// Small attributes come inline; large ones must be read explicitly.
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttrDirInfo {
    pub attributes: Vec<AttributeInfo>,
    pub revision: Revision,
    pub is_valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ShareInfo {
    pub share_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_name: String,
    pub connection_method: String,
    pub shares: Vec<ShareInfo>,
}

impl ServerInfo {
    pub fn share(&self, name: &str) -> Option<&ShareInfo> {
        self.shares.iter().find(|s| s.share_name == name)
    }
}

/// Permission bits returned by the mount handshake.
pub mod share_permissions {
    pub const MOUNT: u32 = 0x01;
    pub const QUERY: u32 = 0x02;
    pub const READ: u32 = 0x04;
    pub const WRITE: u32 = 0x08;
    pub const READ_DIR: u32 = 0x10;
    pub const WRITE_DIR: u32 = 0x20;
}

/// Open mode bits carried by `Open` / `CreateFile`.
pub mod open_mode {
    pub const RDONLY: i32 = 0x0000;
    pub const WRONLY: i32 = 0x0001;
    pub const RDWR: i32 = 0x0002;
    pub const ACCMODE: i32 = 0x0003;
    pub const CREAT: i32 = 0x0200;
    pub const TRUNC: i32 = 0x0400;
    pub const EXCL: i32 = 0x0800;
}

/// Node monitor opcodes, as forwarded to the host VFS.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum MonitorOpcode {
    EntryCreated = 1,
    EntryRemoved = 2,
    EntryMoved = 3,
    StatChanged = 4,
    AttrChanged = 5,
}
