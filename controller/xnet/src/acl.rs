//! The ACL map and its reconciler.

use crate::{addr_to_words, maps::KernelMap, Proto, Result, SysId};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    net::IpAddr,
};

/// Tags identifying entries written by the reconciler.
pub const ACL_FLAG: u8 = b'a';
pub const ACL_ID: [u8; 2] = *b"cl";

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AclKey {
    pub sys: u32,
    pub addr: [u32; 4],
    /// Network byte order; zero matches any port.
    pub port: u16,
    pub proto: u8,
    pub pad: u8,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AclVal {
    pub acl: u8,
    pub flag: u8,
    pub id: [u8; 2],
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum AclVerdict {
    Allow = 1,
    Deny = 2,
    Trusted = 3,
}

unsafe impl aya::Pod for AclKey {}
unsafe impl aya::Pod for AclVal {}

/// Keeps the ACL map in sync with a desired address set for the mesh system,
/// issuing at most one batch delete and one batch upsert per pass.
///
/// The mirror is hydrated from the map on first use and only updated after a
/// batch succeeds, so a failed pass is retried in full. It is keyed by the
/// raw map key since the layout does not record the address family.
pub struct AclReconciler<M> {
    map: M,
    mirror: Mutex<Option<HashMap<AclKey, AclVerdict>>>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub deleted: usize,
    pub upserted: usize,
}

// === impl AclKey ===

impl AclKey {
    /// A key matching any TCP port on `addr`.
    pub fn any_port(addr: IpAddr) -> Self {
        let (addr, _) = addr_to_words(addr);
        Self {
            sys: SysId::Mesh.into(),
            addr,
            port: 0,
            proto: Proto::Tcp as u8,
            pad: 0,
        }
    }
}

// === impl AclVal ===

impl AclVal {
    pub fn new(verdict: AclVerdict) -> Self {
        Self {
            acl: verdict as u8,
            flag: ACL_FLAG,
            id: ACL_ID,
        }
    }

    fn is_managed(&self) -> bool {
        self.flag == ACL_FLAG && self.id == ACL_ID
    }
}

// === impl AclVerdict ===

impl TryFrom<u8> for AclVerdict {
    type Error = u8;

    fn try_from(v: u8) -> std::result::Result<Self, u8> {
        match v {
            1 => Ok(Self::Allow),
            2 => Ok(Self::Deny),
            3 => Ok(Self::Trusted),
            v => Err(v),
        }
    }
}

// === impl AclReconciler ===

impl<M: KernelMap<AclKey, AclVal>> AclReconciler<M> {
    pub fn new(map: M) -> Self {
        Self {
            map,
            mirror: Mutex::new(None),
        }
    }

    pub fn reconcile(&self, desired: &BTreeMap<IpAddr, AclVerdict>) -> Result<Outcome> {
        let mut guard = self.mirror.lock();
        if guard.is_none() {
            *guard = Some(self.hydrate()?);
        }
        let mirror = guard.get_or_insert_with(HashMap::new);

        let desired = desired
            .iter()
            .map(|(addr, verdict)| (AclKey::any_port(*addr), *verdict))
            .collect::<HashMap<_, _>>();
        let deletes = mirror
            .keys()
            .filter(|key| !desired.contains_key(*key))
            .copied()
            .collect::<Vec<_>>();
        let upserts = desired
            .iter()
            .filter(|(key, verdict)| mirror.get(*key) != Some(*verdict))
            .map(|(key, verdict)| (*key, AclVal::new(*verdict)))
            .collect::<Vec<_>>();

        let mut outcome = Outcome::default();

        if !deletes.is_empty() {
            self.map.batch_delete(&deletes)?;
            for key in &deletes {
                mirror.remove(key);
            }
            outcome.deleted = deletes.len();
        }

        if !upserts.is_empty() {
            self.map.batch_put(&upserts)?;
            for (key, _) in &upserts {
                mirror.insert(*key, desired[key]);
            }
            outcome.upserted = upserts.len();
        }

        if outcome != Outcome::default() {
            tracing::debug!(
                deleted = outcome.deleted,
                upserted = outcome.upserted,
                "Reconciled ACL map"
            );
        }
        Ok(outcome)
    }

    fn hydrate(&self) -> Result<HashMap<AclKey, AclVerdict>> {
        let mut mirror = HashMap::new();
        for (key, val) in self.map.list()? {
            if key.sys != u32::from(SysId::Mesh) || !val.is_managed() {
                continue;
            }
            if let Ok(verdict) = AclVerdict::try_from(val.acl) {
                mirror.insert(key, verdict);
            }
        }
        tracing::debug!(entries = mirror.len(), "Hydrated ACL mirror");
        Ok(mirror)
    }
}
