use crate::{
    acl::{AclKey, AclVal},
    cfg::{CfgKey, CfgVal},
    iface::{IfaceKey, IfaceVal},
    nat::{NatKey, NatVal},
    Error, Result,
};
use aya::maps::{HashMap, Map, MapData, MapError};
use std::{
    io,
    marker::PhantomData,
    path::{Path, PathBuf},
};

pub const CFG_MAP: &str = "xmesh_cfg";
pub const IFACE_MAP: &str = "xmesh_iface";
pub const NAT_MAP: &str = "xmesh_nat";
pub const ACL_MAP: &str = "xmesh_acl";

/// Typed access to one kernel hash map.
///
/// Batch operations are applied entry by entry; each key's update is atomic
/// but a batch is not.
pub trait KernelMap<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Result<Option<V>>;

    fn put(&self, key: K, val: V) -> Result<()>;

    /// Removes `key`. Removing an absent key succeeds.
    fn delete(&self, key: &K) -> Result<()>;

    fn list(&self) -> Result<Vec<(K, V)>>;

    fn batch_put(&self, entries: &[(K, V)]) -> Result<()>
    where
        K: Copy,
        V: Copy,
    {
        for (k, v) in entries {
            self.put(*k, *v)?;
        }
        Ok(())
    }

    fn batch_delete(&self, keys: &[K]) -> Result<()> {
        for k in keys {
            self.delete(k)?;
        }
        Ok(())
    }
}

/// A map pinned on the BPF filesystem. The pin is opened for every operation
/// and closed when it completes, so no descriptor outlives a call.
pub struct PinnedMap<K, V> {
    name: &'static str,
    path: PathBuf,
    _marker: PhantomData<fn() -> (K, V)>,
}

/// The four maps shared with the data path.
pub struct Maps {
    pub cfg: PinnedMap<CfgKey, CfgVal>,
    pub iface: PinnedMap<IfaceKey, IfaceVal>,
    pub nat: PinnedMap<NatKey, NatVal>,
    pub acl: PinnedMap<AclKey, AclVal>,
}

// === impl Maps ===

impl Maps {
    pub fn pinned(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            cfg: PinnedMap::new(CFG_MAP, root.join(CFG_MAP)),
            iface: PinnedMap::new(IFACE_MAP, root.join(IFACE_MAP)),
            nat: PinnedMap::new(NAT_MAP, root.join(NAT_MAP)),
            acl: PinnedMap::new(ACL_MAP, root.join(ACL_MAP)),
        }
    }
}

// === impl PinnedMap ===

impl<K, V> PinnedMap<K, V> {
    pub fn new(name: &'static str, path: impl Into<PathBuf>) -> Self {
        Self {
            name,
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, op: &'static str, error: MapError) -> Error {
        let source = match error {
            MapError::SyscallError(e) => e.io_error,
            error => io::Error::other(error),
        };
        Error::Map {
            map: self.name,
            op,
            source,
        }
    }
}

impl<K: aya::Pod, V: aya::Pod> PinnedMap<K, V> {
    fn open(&self) -> Result<HashMap<MapData, K, V>> {
        let data = MapData::from_pin(&self.path).map_err(|e| self.error("open", e))?;
        HashMap::try_from(Map::HashMap(data)).map_err(|e| self.error("open", e))
    }
}

impl<K: aya::Pod, V: aya::Pod> KernelMap<K, V> for PinnedMap<K, V> {
    fn get(&self, key: &K) -> Result<Option<V>> {
        match self.open()?.get(key, 0) {
            Ok(v) => Ok(Some(v)),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(error) => Err(self.error("get", error)),
        }
    }

    fn put(&self, key: K, val: V) -> Result<()> {
        self.open()?
            .insert(key, val, 0)
            .map_err(|e| self.error("update", e))
    }

    fn delete(&self, key: &K) -> Result<()> {
        match self.open()?.remove(key) {
            Ok(()) | Err(MapError::KeyNotFound) => Ok(()),
            Err(MapError::SyscallError(e)) if e.io_error.raw_os_error() == Some(libc::ENOENT) => {
                Ok(())
            }
            Err(error) => Err(self.error("delete", error)),
        }
    }

    fn list(&self) -> Result<Vec<(K, V)>> {
        let map = self.open()?;
        map.iter()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| self.error("list", e))
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use self::mem::InMemoryMap;

#[cfg(any(test, feature = "test-util"))]
mod mem {
    use super::*;
    use parking_lot::Mutex;
    use std::{
        collections::HashMap,
        hash::Hash,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    /// A map held in process memory that counts mutations and can be told to
    /// fail them.
    #[derive(Debug, Default)]
    pub struct InMemoryMap<K, V> {
        entries: Mutex<HashMap<K, V>>,
        writes: AtomicUsize,
        deletes: AtomicUsize,
        failing: AtomicBool,
    }

    impl<K: Eq + Hash + Clone, V: Clone> InMemoryMap<K, V> {
        pub fn new() -> Self {
            Self {
                entries: Mutex::new(HashMap::new()),
                writes: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
            }
        }

        pub fn writes(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }

        pub fn deletes(&self) -> usize {
            self.deletes.load(Ordering::SeqCst)
        }

        pub fn len(&self) -> usize {
            self.entries.lock().len()
        }

        pub fn is_empty(&self) -> bool {
            self.entries.lock().is_empty()
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        /// Inserts without counting as a write.
        pub fn seed(&self, key: K, val: V) {
            self.entries.lock().insert(key, val);
        }

        pub fn snapshot(&self) -> HashMap<K, V> {
            self.entries.lock().clone()
        }

        fn check(&self, op: &'static str) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Map {
                    map: "memory",
                    op,
                    source: io::Error::from_raw_os_error(libc::EBUSY),
                });
            }
            Ok(())
        }
    }

    impl<K, V> KernelMap<K, V> for InMemoryMap<K, V>
    where
        K: Eq + Hash + Clone + Send + Sync,
        V: Clone + Send + Sync,
    {
        fn get(&self, key: &K) -> Result<Option<V>> {
            self.check("get")?;
            Ok(self.entries.lock().get(key).cloned())
        }

        fn put(&self, key: K, val: V) -> Result<()> {
            self.check("update")?;
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.entries.lock().insert(key, val);
            Ok(())
        }

        fn delete(&self, key: &K) -> Result<()> {
            self.check("delete")?;
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.entries.lock().remove(key);
            Ok(())
        }

        fn list(&self) -> Result<Vec<(K, V)>> {
            self.check("list")?;
            Ok(self
                .entries
                .lock()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }
    }
}

impl<K, V, M: KernelMap<K, V> + ?Sized> KernelMap<K, V> for std::sync::Arc<M> {
    fn get(&self, key: &K) -> Result<Option<V>> {
        (**self).get(key)
    }

    fn put(&self, key: K, val: V) -> Result<()> {
        (**self).put(key, val)
    }

    fn delete(&self, key: &K) -> Result<()> {
        (**self).delete(key)
    }

    fn list(&self) -> Result<Vec<(K, V)>> {
        (**self).list()
    }
}
