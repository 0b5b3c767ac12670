use std::fmt;

use serde::{Deserialize, Serialize};

strong_type!(
    /// Node id in the client-wide namespace handed to the host VFS.
    LocalNodeId,
    i64
);
strong_type!(VolumeId, i32);
strong_type!(MountId, i32);
strong_type!(
    /// Volume id as assigned by a server to one of its exported shares.
    RemoteVolumeId,
    i64
);
strong_type!(
    /// Per-directory / per-attribute-set change counter maintained by the server.
    Revision,
    i64
);

impl Revision {
    /// Revision of a directory that has never seen an event.
    pub const NONE: Revision = Revision(-1);
}

/// Server-assigned node identity: the pair is opaque to the client.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct RemoteNodeId {
    pub volume_id: RemoteVolumeId,
    pub node_id: i64,
}

impl RemoteNodeId {
    pub fn new(volume_id: impl Into<RemoteVolumeId>, node_id: i64) -> Self {
        Self {
            volume_id: volume_id.into(),
            node_id,
        }
    }
}

impl fmt::Debug for RemoteNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteNodeId({}:{})", self.volume_id, self.node_id)
    }
}

impl fmt::Display for RemoteNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.volume_id, self.node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_node_id() {
        let id = LocalNodeId(7);
        assert_eq!(*id, 7i64);
        assert_eq!(format!("{:?}", id), "LocalNodeId(7)");
    }

    #[test]
    fn test_revision_ordering() {
        assert!(Revision::NONE < Revision(0));
        assert!(Revision(3) <= Revision(3));
        assert_eq!(Revision::default(), Revision(0));
    }

    #[test]
    fn test_remote_node_id() {
        let a = RemoteNodeId::new(3, 10);
        let b = RemoteNodeId::new(RemoteVolumeId(3), 10);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "3:10");
        assert_eq!(format!("{:?}", a), "RemoteNodeId(3:10)");
    }

    #[test]
    fn test_remote_node_id_serde() {
        let id = RemoteNodeId::new(1, 2);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#"{"volume_id":1,"node_id":2}"#);
        let parsed: RemoteNodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
