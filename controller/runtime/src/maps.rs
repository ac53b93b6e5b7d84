use crate::xnet::{
    AclKey, AclVal, CfgKey, CfgVal, IfaceKey, IfaceVal, KernelMap, Maps, NatKey, NatVal,
};
use std::{path::Path, sync::Arc};

/// Shared handles to the node's data-path maps.
#[derive(Clone)]
pub struct NodeMaps {
    pub cfg: Arc<dyn KernelMap<CfgKey, CfgVal>>,
    pub iface: Arc<dyn KernelMap<IfaceKey, IfaceVal>>,
    pub nat: Arc<dyn KernelMap<NatKey, NatVal>>,
    pub acl: Arc<dyn KernelMap<AclKey, AclVal>>,
}

impl NodeMaps {
    pub fn pinned(root: impl AsRef<Path>) -> Self {
        let Maps {
            cfg,
            iface,
            nat,
            acl,
        } = Maps::pinned(root);
        Self {
            cfg: Arc::new(cfg),
            iface: Arc::new(iface),
            nat: Arc::new(nat),
            acl: Arc::new(acl),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::xnet::maps::InMemoryMap;

    /// In-memory maps that tests can inspect.
    pub(crate) struct TestMaps {
        pub cfg: Arc<InMemoryMap<CfgKey, CfgVal>>,
        pub iface: Arc<InMemoryMap<IfaceKey, IfaceVal>>,
        pub nat: Arc<InMemoryMap<NatKey, NatVal>>,
        pub acl: Arc<InMemoryMap<AclKey, AclVal>>,
    }

    impl Default for TestMaps {
        fn default() -> Self {
            Self {
                cfg: Arc::new(InMemoryMap::new()),
                iface: Arc::new(InMemoryMap::new()),
                nat: Arc::new(InMemoryMap::new()),
                acl: Arc::new(InMemoryMap::new()),
            }
        }
    }

    impl TestMaps {
        pub(crate) fn node_maps(&self) -> NodeMaps {
            NodeMaps {
                cfg: self.cfg.clone(),
                iface: self.iface.clone(),
                nat: self.nat.clone(),
                acl: self.acl.clone(),
            }
        }
    }
}
