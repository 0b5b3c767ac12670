//! Process-wide node ids, the volume registry and the volume event queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use netfs_net::Connector;
use netfs_types::{FsCode, LocalNodeId, MountId, Result, Status, VolumeId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::auth::CredentialPrompt;
use crate::config::ClientConfig;
use crate::query_manager::QueryManager;
use crate::root_volume::RootVolume;
use crate::vfs::HostVfs;
use crate::volume::{Volume, VolumeEvent, VolumeRef};

#[derive(Default)]
struct Registry {
    volumes: HashMap<VolumeId, Arc<dyn Volume>>,
    node_owners: HashMap<LocalNodeId, VolumeId>,
    next_node_id: i64,
}

/// Owns everything a mount shares between its volumes.
///
/// The registry does not count as a reference: a volume stays registered
/// until it is both marked removed and unreferenced, and is torn down by
/// whichever `put_volume` observes that.
pub struct VolumeManager {
    config: ClientConfig,
    vfs: Arc<dyn HostVfs>,
    query_manager: Arc<QueryManager>,
    credentials: Arc<dyn CredentialPrompt>,
    connector: Arc<dyn Connector>,
    registry: Mutex<Registry>,
    next_volume_id: AtomicI32,
    events: mpsc::UnboundedSender<VolumeEvent>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    root: Mutex<Option<VolumeRef>>,
}

impl VolumeManager {
    /// Must be called from within a tokio runtime; starts the event task.
    pub fn new(
        config: ClientConfig,
        vfs: Arc<dyn HostVfs>,
        credentials: Arc<dyn CredentialPrompt>,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            config,
            vfs,
            query_manager: QueryManager::new(),
            credentials,
            connector,
            registry: Mutex::new(Registry {
                next_node_id: 1,
                ..Default::default()
            }),
            next_volume_id: AtomicI32::new(1),
            events,
            event_task: Mutex::new(None),
            root: Mutex::new(None),
        });
        let task = tokio::spawn(deliver_events(Arc::downgrade(&manager), rx));
        *manager.event_task.lock() = Some(task);
        manager.vfs.attach(Arc::downgrade(&manager));
        manager
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn vfs(&self) -> &Arc<dyn HostVfs> {
        &self.vfs
    }

    pub fn query_manager(&self) -> &Arc<QueryManager> {
        &self.query_manager
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialPrompt> {
        &self.credentials
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn mount_id(&self) -> MountId {
        self.config.mount.mount_id
    }

    // ── mount ──────────────────────────────────────────────────────────

    /// Create the root volume and start server discovery. The manager keeps
    /// one reference to the root until `unmount`.
    pub async fn mount_root_volume(self: &Arc<Self>) -> Result<LocalNodeId> {
        if self.root.lock().is_some() {
            return Err(Status::with_message(FsCode::EXISTS, "root volume already mounted"));
        }
        let (root, root_ref) = RootVolume::mount(self).await?;
        let root_id = root.root_id();
        tracing::info!(volume = %root_ref.base().id(), root = %root_id, "root volume mounted");
        *self.root.lock() = Some(root_ref);
        Ok(root_id)
    }

    pub fn root_volume(&self) -> Option<VolumeRef> {
        self.root.lock().clone()
    }

    /// Tear the volume tree down. Vnodes the host still holds keep their
    /// volumes alive until they are put.
    pub async fn unmount(&self) {
        let root = self.root.lock().take();
        if let Some(root) = root {
            root.unmount().await;
            root.base().set_unmounting();
            drop(root);
        }
        let task = self.event_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        tracing::info!(volumes = self.volume_count(), "unmounted");
    }

    // ── node ids ───────────────────────────────────────────────────────

    pub fn new_node_id(&self, volume_id: VolumeId) -> Result<LocalNodeId> {
        let mut registry = self.registry.lock();
        if registry.next_node_id == i64::MAX {
            return Err(Status::new(FsCode::NO_MORE_IDS));
        }
        let id = LocalNodeId(registry.next_node_id);
        registry.next_node_id += 1;
        registry.node_owners.insert(id, volume_id);
        Ok(id)
    }

    pub fn remove_node_id(&self, id: LocalNodeId) {
        self.registry.lock().node_owners.remove(&id);
    }

    pub fn node_owner(&self, id: LocalNodeId) -> Option<VolumeId> {
        self.registry.lock().node_owners.get(&id).copied()
    }

    pub fn get_volume_for_node(&self, id: LocalNodeId) -> Option<VolumeRef> {
        let registry = self.registry.lock();
        let volume_id = registry.node_owners.get(&id)?;
        let volume = registry.volumes.get(volume_id)?;
        volume.base().acquire();
        Some(VolumeRef::adopt(volume.clone()))
    }

    // ── volumes ────────────────────────────────────────────────────────

    pub fn new_volume_id(&self) -> VolumeId {
        VolumeId(self.next_volume_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a freshly created volume and hand back its initial reference.
    pub fn add_volume(&self, volume: Arc<dyn Volume>) -> Result<VolumeRef> {
        let id = volume.base().id();
        {
            let mut registry = self.registry.lock();
            if registry.volumes.contains_key(&id) {
                return Err(Status::with_message(FsCode::EXISTS, format!("volume {id} registered twice")));
            }
            registry.volumes.insert(id, volume.clone());
        }
        tracing::debug!(volume = %id, name = volume.base().name(), "volume added");
        Ok(VolumeRef::adopt(volume))
    }

    pub fn get_volume(&self, id: VolumeId) -> Option<VolumeRef> {
        let registry = self.registry.lock();
        let volume = registry.volumes.get(&id)?;
        volume.base().acquire();
        Some(VolumeRef::adopt(volume.clone()))
    }

    /// Release one reference. Starts unmounting a volume marked unmounting,
    /// and tears down a removed volume once nothing references it.
    pub fn put_volume(&self, volume: &Arc<dyn Volume>) {
        let base = volume.base();
        if base.is_unmounting() && base.mark_removed() {
            tracing::debug!(volume = %base.id(), name = base.name(), "preparing to unmount");
            if let Some(parent) = base.parent() {
                parent.remove_child_volume(volume.as_ref());
            }
            volume.prepare_to_unmount();
        }

        if base.release() > 0 {
            return;
        }

        let doomed = {
            let mut registry = self.registry.lock();
            if base.ref_count() == 0 && base.is_removed() {
                registry.volumes.remove(&base.id())
            } else {
                None
            }
        };
        if let Some(volume) = doomed {
            volume.uninit();
            tracing::debug!(volume = %base.id(), name = base.name(), "volume destroyed");
        }
    }

    pub fn volume_count(&self) -> usize {
        self.registry.lock().volumes.len()
    }

    pub fn node_id_count(&self) -> usize {
        self.registry.lock().node_owners.len()
    }

    // ── events ─────────────────────────────────────────────────────────

    pub fn send_volume_event(&self, event: VolumeEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("volume event dropped after shutdown");
        }
    }
}

async fn deliver_events(manager: Weak<VolumeManager>, mut rx: mpsc::UnboundedReceiver<VolumeEvent>) {
    while let Some(event) = rx.recv().await {
        let volume = match manager.upgrade() {
            Some(manager) => manager.get_volume(event.volume_id()),
            None => break,
        };
        match volume {
            Some(volume) => volume.handle_event(event).await,
            None => tracing::debug!(?event, "event for unknown volume"),
        }
    }
}
