//! Reference-counted query iterators and their hierarchy.
//!
//! A query on a virtual volume is a hierarchical iterator whose sub-iterators
//! belong to the child volumes. A parent holds one reference on each of its
//! subs. When the last reference to an iterator goes away it is unlinked,
//! its subs are released, and the owning volume frees it, subs first.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use netfs_proto::Cookie;
use netfs_types::{FsCode, LocalNodeId, Result, Status};
use parking_lot::Mutex;

use crate::volume::Volume;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIteratorKind {
    /// Iterates the sub-iterators of the child volumes in order.
    Hierarchical,
    /// Backed by a query handle on a server.
    Server { cookie: Cookie },
}

/// A query iterator, owned by the volume it was opened on.
pub struct QueryIterator {
    id: u64,
    volume: Weak<dyn Volume>,
    volume_root: LocalNodeId,
    kind: QueryIteratorKind,
}

impl QueryIterator {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn volume(&self) -> Option<Arc<dyn Volume>> {
        self.volume.upgrade()
    }

    pub fn kind(&self) -> QueryIteratorKind {
        self.kind
    }
}

impl fmt::Debug for QueryIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryIterator")
            .field("id", &self.id)
            .field("volume_root", &self.volume_root)
            .field("kind", &self.kind)
            .finish()
    }
}

struct Record {
    iterator: Arc<QueryIterator>,
    refs: usize,
    parent: Option<u64>,
    subs: Vec<u64>,
    current: usize,
    registered: bool,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    records: HashMap<u64, Record>,
    by_volume: HashMap<LocalNodeId, Vec<u64>>,
}

impl Registry {
    fn unregister(&mut self, id: u64) {
        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        if !record.registered {
            return;
        }
        record.registered = false;
        let root = record.iterator.volume_root;
        if let Some(ids) = self.by_volume.get_mut(&root) {
            ids.retain(|&i| i != id);
            if ids.is_empty() {
                self.by_volume.remove(&root);
            }
        }
    }

    fn detach_from_parent(&mut self, id: u64) -> Option<u64> {
        let parent = self.records.get_mut(&id)?.parent.take()?;
        if let Some(record) = self.records.get_mut(&parent) {
            if let Some(pos) = record.subs.iter().position(|&s| s == id) {
                record.subs.remove(pos);
                if record.current > pos {
                    record.current -= 1;
                }
            }
        }
        Some(parent)
    }

    /// Drop one reference to `id`. Iterators that reach zero are appended to
    /// `freed`, subs before their parent.
    fn release(&mut self, id: u64, freed: &mut Vec<Arc<QueryIterator>>) {
        let Some(record) = self.records.get_mut(&id) else {
            return;
        };
        record.refs -= 1;
        if record.refs > 0 {
            return;
        }
        self.detach_from_parent(id);
        self.unregister(id);
        let Some(record) = self.records.remove(&id) else {
            return;
        };
        for sub in record.subs {
            if let Some(sub_record) = self.records.get_mut(&sub) {
                sub_record.parent = None;
            }
            self.release(sub, freed);
        }
        freed.push(record.iterator);
    }
}

pub struct QueryManager {
    registry: Mutex<Registry>,
}

impl QueryManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry {
                next_id: 1,
                ..Default::default()
            }),
        })
    }

    /// Register a new iterator of the volume rooted at `volume_root`.
    pub fn add_iterator(
        self: &Arc<Self>,
        volume: Weak<dyn Volume>,
        volume_root: LocalNodeId,
        kind: QueryIteratorKind,
    ) -> QueryIteratorRef {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        let iterator = Arc::new(QueryIterator {
            id,
            volume,
            volume_root,
            kind,
        });
        registry.records.insert(
            id,
            Record {
                iterator: iterator.clone(),
                refs: 1,
                parent: None,
                subs: Vec::new(),
                current: 0,
                registered: true,
            },
        );
        registry.by_volume.entry(volume_root).or_default().push(id);
        QueryIteratorRef {
            manager: self.clone(),
            iterator,
        }
    }

    /// Attach `sub` to `parent`; the parent takes its own reference.
    pub fn add_sub_iterator(&self, parent: &QueryIterator, sub: &QueryIterator) -> Result<()> {
        let mut registry = self.registry.lock();
        if !registry.records.contains_key(&parent.id) {
            return Err(Status::with_message(FsCode::BAD_VALUE, "parent iterator is gone"));
        }
        let sub_record = registry
            .records
            .get_mut(&sub.id)
            .ok_or_else(|| Status::with_message(FsCode::BAD_VALUE, "sub iterator is gone"))?;
        if sub_record.parent.is_some() {
            return Err(Status::with_message(FsCode::BUSY, "iterator already has a parent"));
        }
        sub_record.refs += 1;
        sub_record.parent = Some(parent.id);
        if let Some(record) = registry.records.get_mut(&parent.id) {
            record.subs.push(sub.id);
        }
        Ok(())
    }

    pub fn remove_sub_iterator(&self, parent: &QueryIterator, sub: &QueryIterator) {
        let freed = {
            let mut registry = self.registry.lock();
            let is_child = registry.records.get(&sub.id).and_then(|r| r.parent) == Some(parent.id);
            if !is_child {
                return;
            }
            registry.detach_from_parent(sub.id);
            let mut freed = Vec::new();
            registry.release(sub.id, &mut freed);
            freed
        };
        free_all(freed);
    }

    /// The sub-iterator under the cursor, with a reference of its own.
    pub fn get_current_sub_iterator(self: &Arc<Self>, parent: &QueryIterator) -> Option<QueryIteratorRef> {
        let mut registry = self.registry.lock();
        let record = registry.records.get(&parent.id)?;
        let sub = *record.subs.get(record.current)?;
        let sub_record = registry.records.get_mut(&sub)?;
        sub_record.refs += 1;
        Some(QueryIteratorRef {
            manager: self.clone(),
            iterator: sub_record.iterator.clone(),
        })
    }

    pub fn next_sub_iterator(&self, parent: &QueryIterator) {
        if let Some(record) = self.registry.lock().records.get_mut(&parent.id) {
            if record.current < record.subs.len() {
                record.current += 1;
            }
        }
    }

    pub fn rewind_sub_iterator(&self, parent: &QueryIterator) {
        if let Some(record) = self.registry.lock().records.get_mut(&parent.id) {
            record.current = 0;
        }
    }

    fn put_iterator(&self, iterator: &QueryIterator) {
        let freed = {
            let mut registry = self.registry.lock();
            let mut freed = Vec::new();
            registry.release(iterator.id, &mut freed);
            freed
        };
        free_all(freed);
    }

    /// The volume rooted at `volume_root` is going away: its iterators are
    /// cut loose from their parents and unregistered. Callers holding
    /// references keep them until they let go.
    pub fn volume_unmounting(&self, volume_root: LocalNodeId) {
        let freed = {
            let mut registry = self.registry.lock();
            let ids = registry.by_volume.remove(&volume_root).unwrap_or_default();
            let mut freed = Vec::new();
            for id in ids {
                if let Some(record) = registry.records.get_mut(&id) {
                    record.registered = false;
                }
                if registry.detach_from_parent(id).is_some() {
                    registry.release(id, &mut freed);
                }
            }
            freed
        };
        free_all(freed);
    }

    pub fn iterator_count(&self) -> usize {
        self.registry.lock().records.len()
    }

    pub fn sub_iterator_count(&self, parent: &QueryIterator) -> usize {
        self.registry
            .lock()
            .records
            .get(&parent.id)
            .map_or(0, |r| r.subs.len())
    }
}

fn free_all(freed: Vec<Arc<QueryIterator>>) {
    for iterator in freed {
        match iterator.volume() {
            Some(volume) => volume.free_query_iterator(&iterator),
            None => tracing::trace!(id = iterator.id, "iterator outlived its volume"),
        }
    }
}

/// One counted reference to a query iterator.
pub struct QueryIteratorRef {
    manager: Arc<QueryManager>,
    iterator: Arc<QueryIterator>,
}

impl QueryIteratorRef {
    pub fn manager(&self) -> &Arc<QueryManager> {
        &self.manager
    }
}

impl Clone for QueryIteratorRef {
    fn clone(&self) -> Self {
        if let Some(record) = self.manager.registry.lock().records.get_mut(&self.iterator.id) {
            record.refs += 1;
        }
        Self {
            manager: self.manager.clone(),
            iterator: self.iterator.clone(),
        }
    }
}

impl Drop for QueryIteratorRef {
    fn drop(&mut self) {
        self.manager.put_iterator(&self.iterator);
    }
}

impl Deref for QueryIteratorRef {
    type Target = QueryIterator;

    fn deref(&self) -> &Self::Target {
        &self.iterator
    }
}

impl fmt::Debug for QueryIteratorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.iterator.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ProbeVolume, test_manager};

    #[tokio::test]
    async fn test_subs_freed_before_parent() {
        let manager = test_manager();
        let (probe, vref) = ProbeVolume::create(&manager);
        let qm = manager.query_manager();
        let weak = probe.base().this_weak();

        let parent = qm.add_iterator(weak.clone(), LocalNodeId(1), QueryIteratorKind::Hierarchical);
        let a = qm.add_iterator(weak.clone(), LocalNodeId(2), QueryIteratorKind::Server { cookie: 7 });
        let b = qm.add_iterator(weak.clone(), LocalNodeId(3), QueryIteratorKind::Server { cookie: 8 });
        qm.add_sub_iterator(&parent, &a).unwrap();
        qm.add_sub_iterator(&parent, &b).unwrap();
        let (a_id, b_id, parent_id) = (a.id(), b.id(), parent.id());
        drop(a);
        drop(b);
        assert_eq!(qm.iterator_count(), 3);
        assert!(probe.freed_iterators().is_empty());

        drop(parent);
        assert_eq!(probe.freed_iterators(), vec![a_id, b_id, parent_id]);
        assert_eq!(qm.iterator_count(), 0);

        probe.base().set_unmounting();
        drop(vref);
    }

    #[tokio::test]
    async fn test_cursor_walks_subs() {
        let manager = test_manager();
        let (probe, vref) = ProbeVolume::create(&manager);
        let qm = manager.query_manager();
        let weak = probe.base().this_weak();

        let parent = qm.add_iterator(weak.clone(), LocalNodeId(1), QueryIteratorKind::Hierarchical);
        let a = qm.add_iterator(weak.clone(), LocalNodeId(2), QueryIteratorKind::Hierarchical);
        let b = qm.add_iterator(weak.clone(), LocalNodeId(3), QueryIteratorKind::Hierarchical);
        qm.add_sub_iterator(&parent, &a).unwrap();
        qm.add_sub_iterator(&parent, &b).unwrap();

        assert_eq!(qm.get_current_sub_iterator(&parent).unwrap().id(), a.id());
        qm.next_sub_iterator(&parent);
        assert_eq!(qm.get_current_sub_iterator(&parent).unwrap().id(), b.id());
        qm.next_sub_iterator(&parent);
        assert!(qm.get_current_sub_iterator(&parent).is_none());
        qm.rewind_sub_iterator(&parent);
        assert_eq!(qm.get_current_sub_iterator(&parent).unwrap().id(), a.id());

        let err = qm.add_sub_iterator(&parent, &a).unwrap_err();
        assert_eq!(err.code(), FsCode::BUSY);

        qm.remove_sub_iterator(&parent, &a);
        assert_eq!(qm.sub_iterator_count(&parent), 1);
        assert!(probe.freed_iterators().is_empty(), "caller still holds a");
        drop(a);
        assert_eq!(probe.freed_iterators().len(), 1);

        drop((parent, b));
        assert_eq!(qm.iterator_count(), 0);
        probe.base().set_unmounting();
        drop(vref);
    }

    #[tokio::test]
    async fn test_volume_unmounting_detaches_iterators() {
        let manager = test_manager();
        let (probe, vref) = ProbeVolume::create(&manager);
        let qm = manager.query_manager();
        let weak = probe.base().this_weak();

        let parent = qm.add_iterator(weak.clone(), LocalNodeId(1), QueryIteratorKind::Hierarchical);
        let sub = qm.add_iterator(weak.clone(), LocalNodeId(2), QueryIteratorKind::Hierarchical);
        qm.add_sub_iterator(&parent, &sub).unwrap();
        let sub_id = sub.id();
        drop(sub);

        qm.volume_unmounting(LocalNodeId(2));
        assert_eq!(qm.sub_iterator_count(&parent), 0);
        assert_eq!(probe.freed_iterators(), vec![sub_id]);
        assert_eq!(qm.iterator_count(), 1);

        drop(parent);
        assert_eq!(qm.iterator_count(), 0);
        probe.base().set_unmounting();
        drop(vref);
    }

    #[tokio::test]
    async fn test_iterator_outliving_volume() {
        let manager = test_manager();
        let (probe, vref) = ProbeVolume::create(&manager);
        let qm = manager.query_manager().clone();
        let iterator = qm.add_iterator(probe.base().this_weak(), LocalNodeId(5), QueryIteratorKind::Hierarchical);
        probe.base().set_unmounting();
        drop(vref);
        drop(probe);
        assert!(iterator.volume().is_none());
        drop(iterator);
        assert_eq!(qm.iterator_count(), 0);
    }
}
