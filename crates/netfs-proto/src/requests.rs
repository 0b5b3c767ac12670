use netfs_net::Message;
use netfs_types::{
    RPCCode, RemoteNodeId, RemoteVolumeId, Result, Revision, Status, StatusCode, status_code_t,
};
use serde::{Deserialize, Serialize};

use crate::types::{AttrDirInfo, AttributeInfo, EntryInfo, MonitorOpcode, NodeInfo, ServerInfo};

/// Server-side handle for an open file, directory, attribute directory or query.
pub type Cookie = i64;

/// Implemented by every reply: the server's verdict on the request.
pub trait Reply: Sized {
    fn error(&self) -> status_code_t;

    /// `Ok(self)` when the server reported success, its code otherwise.
    fn into_result(self) -> Result<Self> {
        match self.error() {
            StatusCode::OK => Ok(self),
            code => Err(Status::new(code)),
        }
    }
}

// ── Connection ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitConnectionRequest {
    pub big_endian: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InitConnectionReply {
    pub error: status_code_t,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRequest {
    pub share: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MountReply {
    pub error: status_code_t,
    pub volume_id: RemoteVolumeId,
    pub share_permissions: u32,
    pub node_info: NodeInfo,
    /// Set whenever the credentials were rejected, so the client can ask again.
    pub no_permission: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmountRequest {
    pub volume_id: RemoteVolumeId,
}

// ── Nodes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadVNodeRequest {
    pub volume_id: RemoteVolumeId,
    pub node_id: RemoteNodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadVNodeReply {
    pub error: status_code_t,
    pub node_info: NodeInfo,
}

/// Which stat fields a `WriteStat` changes.
pub mod stat_mask {
    pub const MODE: u32 = 0x01;
    pub const UID: u32 = 0x02;
    pub const GID: u32 = 0x04;
    pub const SIZE: u32 = 0x08;
    pub const ATIME: u32 = 0x10;
    pub const MTIME: u32 = 0x20;
    pub const CRTIME: u32 = 0x40;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStatRequest {
    pub volume_id: RemoteVolumeId,
    pub node_id: RemoteNodeId,
    pub node_info: NodeInfo,
    pub mask: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WriteStatReply {
    pub error: status_code_t,
    pub node_info: NodeInfo,
    pub node_info_valid: bool,
}

// ── Files ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateFileRequest {
    pub volume_id: RemoteVolumeId,
    pub directory_id: RemoteNodeId,
    pub name: String,
    pub open_mode: i32,
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CreateFileReply {
    pub error: status_code_t,
    pub entry_info: EntryInfo,
    pub cookie: Cookie,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub volume_id: RemoteVolumeId,
    pub node_id: RemoteNodeId,
    pub open_mode: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenReply {
    pub error: status_code_t,
    pub node_info: NodeInfo,
    pub cookie: Cookie,
}

/// Closes any kind of cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseRequest {
    pub volume_id: RemoteVolumeId,
    pub cookie: Cookie,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub volume_id: RemoteVolumeId,
    pub cookie: Cookie,
    pub pos: i64,
    pub size: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadReply {
    pub error: status_code_t,
    pub pos: i64,
    pub data: Vec<u8>,
    pub more_to_come: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub volume_id: RemoteVolumeId,
    pub cookie: Cookie,
    pub pos: i64,
    pub data: Vec<u8>,
}

// ── Links and directories ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLinkRequest {
    pub volume_id: RemoteVolumeId,
    pub directory_id: RemoteNodeId,
    pub name: String,
    pub node_id: RemoteNodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkRequest {
    pub volume_id: RemoteVolumeId,
    pub directory_id: RemoteNodeId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSymlinkRequest {
    pub volume_id: RemoteVolumeId,
    pub directory_id: RemoteNodeId,
    pub name: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadLinkRequest {
    pub volume_id: RemoteVolumeId,
    pub node_id: RemoteNodeId,
    pub max_size: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadLinkReply {
    pub error: status_code_t,
    pub node_info: NodeInfo,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameRequest {
    pub volume_id: RemoteVolumeId,
    pub old_directory_id: RemoteNodeId,
    pub old_name: String,
    pub new_directory_id: RemoteNodeId,
    pub new_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MakeDirRequest {
    pub volume_id: RemoteVolumeId,
    pub directory_id: RemoteNodeId,
    pub name: String,
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveDirRequest {
    pub volume_id: RemoteVolumeId,
    pub directory_id: RemoteNodeId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenDirRequest {
    pub volume_id: RemoteVolumeId,
    pub node_id: RemoteNodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenDirReply {
    pub error: status_code_t,
    pub node_info: NodeInfo,
    pub cookie: Cookie,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadDirRequest {
    pub volume_id: RemoteVolumeId,
    pub cookie: Cookie,
    pub count: i32,
    pub rewind: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadDirReply {
    pub error: status_code_t,
    pub entry_infos: Vec<EntryInfo>,
    /// Directory revision at the time the listing started.
    pub revision: Revision,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkRequest {
    pub volume_id: RemoteVolumeId,
    pub node_id: RemoteNodeId,
    pub name: String,
    pub resolve_link: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WalkReply {
    pub error: status_code_t,
    pub entry_info: EntryInfo,
    /// Set when the entry is a symlink and resolution was asked for.
    pub link_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiWalkRequest {
    pub volume_id: RemoteVolumeId,
    pub node_id: RemoteNodeId,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MultiWalkReply {
    pub error: status_code_t,
    pub entry_infos: Vec<EntryInfo>,
}

// ── Attributes ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAttrDirRequest {
    pub volume_id: RemoteVolumeId,
    pub node_id: RemoteNodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenAttrDirReply {
    pub error: status_code_t,
    pub attr_dir_info: AttrDirInfo,
    pub cookie: Cookie,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadAttrDirRequest {
    pub volume_id: RemoteVolumeId,
    pub cookie: Cookie,
    pub count: i32,
    pub rewind: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadAttrDirReply {
    pub error: status_code_t,
    pub name: String,
    pub count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadAttrRequest {
    pub volume_id: RemoteVolumeId,
    pub node_id: RemoteNodeId,
    pub name: String,
    pub type_code: u32,
    pub pos: i64,
    pub size: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadAttrReply {
    pub error: status_code_t,
    pub pos: i64,
    pub data: Vec<u8>,
    pub more_to_come: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAttrRequest {
    pub volume_id: RemoteVolumeId,
    pub node_id: RemoteNodeId,
    pub name: String,
    pub type_code: u32,
    pub pos: i64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveAttrRequest {
    pub volume_id: RemoteVolumeId,
    pub node_id: RemoteNodeId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameAttrRequest {
    pub volume_id: RemoteVolumeId,
    pub node_id: RemoteNodeId,
    pub old_name: String,
    pub new_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatAttrRequest {
    pub volume_id: RemoteVolumeId,
    pub node_id: RemoteNodeId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatAttrReply {
    pub error: status_code_t,
    pub attr_info: AttributeInfo,
}

// ── Queries ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenQueryRequest {
    pub query_string: String,
    pub flags: u32,
    pub port: i32,
    pub token: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenQueryReply {
    pub error: status_code_t,
    pub cookie: Cookie,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadQueryRequest {
    pub cookie: Cookie,
    pub count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadQueryReply {
    pub error: status_code_t,
    /// Volumes of this connection that contain the entry.
    pub client_volume_ids: Vec<RemoteVolumeId>,
    pub dir_info: NodeInfo,
    pub entry_info: EntryInfo,
    pub count: i32,
}

// ── Node monitoring ────────────────────────────────────────────────────────

/// Fields shared by every node-monitoring request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorHeader {
    pub volume_id: RemoteVolumeId,
    pub opcode: MonitorOpcode,
    pub revision: Revision,
    pub node_id: RemoteNodeId,
    /// Query updates go to the listener registered by `port`/`token`
    /// instead of touching the cache.
    pub query_update: bool,
    pub port: i32,
    pub token: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryCreatedRequest {
    pub header: MonitorHeader,
    pub directory_id: RemoteNodeId,
    pub name: String,
    pub entry_info: EntryInfo,
    pub entry_info_valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRemovedRequest {
    pub header: MonitorHeader,
    pub directory_id: RemoteNodeId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMovedRequest {
    pub header: MonitorHeader,
    pub from_directory_id: RemoteNodeId,
    pub to_directory_id: RemoteNodeId,
    pub from_name: String,
    pub to_name: String,
    pub entry_info: EntryInfo,
    pub entry_info_valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatChangedRequest {
    pub header: MonitorHeader,
    pub node_info: NodeInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChangedRequest {
    pub header: MonitorHeader,
    pub attr_dir_info: AttrDirInfo,
    pub attr_info: AttributeInfo,
    pub valid: bool,
    pub removed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfoRequest {
    pub server_info: ServerInfo,
}

/// Reply without a payload.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusReply {
    pub error: status_code_t,
}

impl StatusReply {
    pub fn ok() -> Self {
        Self {
            error: StatusCode::OK,
        }
    }
}

macro_rules! requests {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        /// Everything that travels over a netfs connection.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub enum Request {
            $($variant($ty),)*
        }

        impl Request {
            pub fn kind(&self) -> &'static str {
                match self {
                    $(Request::$variant(_) => stringify!($variant),)*
                }
            }
        }

        $(
            impl From<$ty> for Request {
                fn from(value: $ty) -> Self {
                    Request::$variant(value)
                }
            }

            impl TryFrom<Request> for $ty {
                type Error = Status;

                fn try_from(request: Request) -> Result<Self> {
                    match request {
                        Request::$variant(value) => Ok(value),
                        other => Err(Status::with_message(
                            RPCCode::BAD_DATA,
                            format!("expected {}, got {}", stringify!($variant), other.kind()),
                        )),
                    }
                }
            }
        )*
    };
}

requests! {
    InitConnection(InitConnectionRequest),
    InitConnectionReply(InitConnectionReply),
    Mount(MountRequest),
    MountReply(MountReply),
    Unmount(UnmountRequest),
    ReadVNode(ReadVNodeRequest),
    ReadVNodeReply(ReadVNodeReply),
    WriteStat(WriteStatRequest),
    WriteStatReply(WriteStatReply),
    CreateFile(CreateFileRequest),
    CreateFileReply(CreateFileReply),
    Open(OpenRequest),
    OpenReply(OpenReply),
    Close(CloseRequest),
    Read(ReadRequest),
    ReadReply(ReadReply),
    Write(WriteRequest),
    CreateLink(CreateLinkRequest),
    Unlink(UnlinkRequest),
    CreateSymlink(CreateSymlinkRequest),
    ReadLink(ReadLinkRequest),
    ReadLinkReply(ReadLinkReply),
    Rename(RenameRequest),
    MakeDir(MakeDirRequest),
    RemoveDir(RemoveDirRequest),
    OpenDir(OpenDirRequest),
    OpenDirReply(OpenDirReply),
    ReadDir(ReadDirRequest),
    ReadDirReply(ReadDirReply),
    Walk(WalkRequest),
    WalkReply(WalkReply),
    MultiWalk(MultiWalkRequest),
    MultiWalkReply(MultiWalkReply),
    OpenAttrDir(OpenAttrDirRequest),
    OpenAttrDirReply(OpenAttrDirReply),
    ReadAttrDir(ReadAttrDirRequest),
    ReadAttrDirReply(ReadAttrDirReply),
    ReadAttr(ReadAttrRequest),
    ReadAttrReply(ReadAttrReply),
    WriteAttr(WriteAttrRequest),
    RemoveAttr(RemoveAttrRequest),
    RenameAttr(RenameAttrRequest),
    StatAttr(StatAttrRequest),
    StatAttrReply(StatAttrReply),
    OpenQuery(OpenQueryRequest),
    OpenQueryReply(OpenQueryReply),
    ReadQuery(ReadQueryRequest),
    ReadQueryReply(ReadQueryReply),
    EntryCreated(EntryCreatedRequest),
    EntryRemoved(EntryRemovedRequest),
    EntryMoved(EntryMovedRequest),
    StatChanged(StatChangedRequest),
    AttributeChanged(AttributeChangedRequest),
    ServerInfo(ServerInfoRequest),
    StatusReply(StatusReply),
}

macro_rules! replies {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Reply for $ty {
                fn error(&self) -> status_code_t {
                    self.error
                }
            }
        )*
    };
}

replies!(
    InitConnectionReply,
    MountReply,
    ReadVNodeReply,
    WriteStatReply,
    CreateFileReply,
    OpenReply,
    ReadReply,
    ReadLinkReply,
    OpenDirReply,
    ReadDirReply,
    WalkReply,
    MultiWalkReply,
    OpenAttrDirReply,
    ReadAttrDirReply,
    ReadAttrReply,
    StatAttrReply,
    OpenQueryReply,
    ReadQueryReply,
    StatusReply,
);

impl Message for Request {
    fn more_to_come(&self) -> bool {
        match self {
            Request::ReadReply(reply) => reply.more_to_come,
            Request::ReadAttrReply(reply) => reply.more_to_come,
            _ => false,
        }
    }
}

impl Request {
    /// The header of a node-monitoring request.
    pub fn monitor_header(&self) -> Option<&MonitorHeader> {
        match self {
            Request::EntryCreated(r) => Some(&r.header),
            Request::EntryRemoved(r) => Some(&r.header),
            Request::EntryMoved(r) => Some(&r.header),
            Request::StatChanged(r) => Some(&r.header),
            Request::AttributeChanged(r) => Some(&r.header),
            _ => None,
        }
    }
}
