use crate::{maps::KernelMap, Mac, Result};

pub const IFNAMSIZ: usize = 16;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct IfaceKey {
    pub len: u8,
    pub name: [u8; IFNAMSIZ],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct IfaceVal {
    pub ifi: u32,
    pub addr: [u32; 4],
    pub mac: Mac,
    /// MAC of the peer end of the link.
    pub xmac: Mac,
}

unsafe impl aya::Pod for IfaceKey {}
unsafe impl aya::Pod for IfaceVal {}

// === impl IfaceKey ===

impl IfaceKey {
    /// Builds the key for `name`, truncated to the kernel's name limit.
    pub fn new(name: &str) -> Self {
        let bytes = name.as_bytes();
        let len = bytes.len().min(IFNAMSIZ);
        let mut key = Self {
            len: len as u8,
            ..Default::default()
        };
        key.name[..len].copy_from_slice(&bytes[..len]);
        key
    }

    pub fn name(&self) -> &str {
        let len = (self.len as usize).min(IFNAMSIZ);
        std::str::from_utf8(&self.name[..len]).unwrap_or_default()
    }
}

/// Looks up an interface's entry, e.g. the CNI bridge.
pub fn lookup<M>(map: &M, name: &str) -> Result<Option<IfaceVal>>
where
    M: KernelMap<IfaceKey, IfaceVal> + ?Sized,
{
    map.get(&IfaceKey::new(name))
}
