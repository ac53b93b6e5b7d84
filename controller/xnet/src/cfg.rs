//! The CFG map: per-system behavior toggles consulted by the classifier.

use crate::{maps::KernelMap, Result, SysId};

#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct CfgKey(pub u32);

/// A 64-bit flag vector.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Flags(pub u64);

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct CfgVal {
    pub ipv4: Flags,
    pub ipv6: Flags,
}

/// Bit offsets within a flag vector.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CfgFlag {
    DenyAll = 0,
    AllowAll = 1,
    TcpDenyAll = 2,
    TcpAllowAll = 3,
    TcpAllowNatEscape = 4,
    UdpDenyAll = 5,
    UdpAllowAll = 6,
    UdpAllowNatEscape = 7,
    OthDenyAll = 8,
    TcpNatByIpPortOn = 9,
    TcpNatByIpOn = 10,
    TcpNatAllOff = 11,
    TcpNatOptOn = 12,
    TcpNatOptWithLocalAddrOn = 13,
    TcpNatOptWithLocalPortOn = 14,
    UdpNatByIpPortOn = 15,
    UdpNatByIpOn = 16,
    UdpNatByPortOn = 17,
    UdpNatAllOff = 18,
    UdpNatOptOn = 19,
    UdpNatOptWithLocalAddrOn = 20,
    UdpNatOptWithLocalPortOn = 21,
    AclCheckOn = 22,
    TraceHdrOn = 23,
    TraceNatOn = 24,
    TraceOptOn = 25,
    TraceAclOn = 26,
    TraceFlowOn = 27,
    TraceByIpOn = 28,
    TraceByPortOn = 29,
}

unsafe impl aya::Pod for CfgKey {}
unsafe impl aya::Pod for CfgVal {}

// === impl CfgKey ===

impl From<SysId> for CfgKey {
    fn from(sys: SysId) -> Self {
        Self(sys.into())
    }
}

// === impl Flags ===

impl Flags {
    pub fn get(&self, flag: CfgFlag) -> u64 {
        (self.0 >> flag as u8) & 1
    }

    pub fn set(&mut self, flag: CfgFlag) {
        self.0 |= 1 << flag as u8;
    }

    pub fn clear(&mut self, flag: CfgFlag) {
        self.0 &= !(1 << flag as u8);
    }

    pub fn is_set(&self, flag: CfgFlag) -> bool {
        self.get(flag) == 1
    }
}

/// Reads the system's config, applies `f`, and writes it back if it changed.
/// A missing entry starts from all flags cleared. Returns whether a write was
/// issued.
pub fn update<M>(map: &M, sys: SysId, f: impl FnOnce(&mut CfgVal)) -> Result<bool>
where
    M: KernelMap<CfgKey, CfgVal> + ?Sized,
{
    let key = CfgKey::from(sys);
    let current = map.get(&key)?.unwrap_or_default();
    let mut next = current;
    f(&mut next);
    if next == current {
        return Ok(false);
    }
    map.put(key, next)?;
    Ok(true)
}
