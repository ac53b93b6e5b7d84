//! User-space access to the node data path: the pinned eBPF maps the kernel
//! program consults, plus the neighbor table and L2 advertisements that make
//! EIPs reachable.

#![deny(warnings, rust_2018_idioms)]

pub mod acl;
pub mod arp;
pub mod cfg;
pub mod iface;
pub mod maps;
pub mod nat;
pub mod route;

pub use self::{
    acl::{AclKey, AclReconciler, AclVal, AclVerdict},
    arp::{Announcer, RawAnnouncer},
    cfg::{CfgFlag, CfgKey, CfgVal, Flags},
    iface::{IfaceKey, IfaceVal},
    maps::{KernelMap, Maps, PinnedMap},
    nat::{NatEp, NatKey, NatVal, Upstream},
    route::{Gateway, Neighbors, Netlink},
};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{op} on {map} map failed: {source}")]
    Map {
        map: &'static str,
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("netlink request failed: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("no default route")]
    NoDefaultRoute,

    #[error("interface {0} has no hardware address")]
    NoHardwareAddress(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The system a map entry belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum SysId {
    Mesh = 1,
    E4lb = 2,
}

/// The traffic-classifier hook an entry applies to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TcDir {
    Ingress = 0,
    Egress = 1,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Proto {
    Tcp = libc::IPPROTO_TCP as u8,
    Udp = libc::IPPROTO_UDP as u8,
}

/// Redirect out of the selected interface's ingress path.
pub const F_INGRESS: u8 = 1;
/// Redirect out of the selected interface's egress path.
pub const F_EGRESS: u8 = 0;

pub const MAC_LEN: usize = 6;
pub type Mac = [u8; MAC_LEN];

// === impl SysId ===

impl From<SysId> for u32 {
    fn from(sys: SysId) -> Self {
        sys as u32
    }
}

// === impl TcDir ===

impl TcDir {
    pub const ALL: [TcDir; 2] = [TcDir::Ingress, TcDir::Egress];
}

/// Encodes an address in the maps' four-word layout. IPv4 occupies the first
/// word, in network byte order.
pub fn addr_to_words(addr: IpAddr) -> ([u32; 4], bool) {
    match addr {
        IpAddr::V4(v4) => ([u32::from_ne_bytes(v4.octets()), 0, 0, 0], false),
        IpAddr::V6(v6) => {
            let o = v6.octets();
            let mut words = [0u32; 4];
            for (i, w) in words.iter_mut().enumerate() {
                *w = u32::from_ne_bytes([o[i * 4], o[i * 4 + 1], o[i * 4 + 2], o[i * 4 + 3]]);
            }
            (words, true)
        }
    }
}

pub fn words_to_addr(words: [u32; 4], v6: bool) -> IpAddr {
    if !v6 {
        return IpAddr::V4(Ipv4Addr::from(words[0].to_ne_bytes()));
    }
    let mut o = [0u8; 16];
    for (i, w) in words.iter().enumerate() {
        o[i * 4..i * 4 + 4].copy_from_slice(&w.to_ne_bytes());
    }
    IpAddr::V6(Ipv6Addr::from(o))
}

pub fn format_mac(mac: &Mac) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_words() {
        let v4: IpAddr = "10.0.0.1".parse().unwrap();
        let (words, v6) = addr_to_words(v4);
        assert!(!v6);
        assert_eq!(words[1..], [0, 0, 0]);
        assert_eq!(words[0].to_ne_bytes(), [10, 0, 0, 1]);
        assert_eq!(words_to_addr(words, v6), v4);

        let v6addr: IpAddr = "2001:db8::7".parse().unwrap();
        let (words, v6) = addr_to_words(v6addr);
        assert!(v6);
        assert_eq!(words_to_addr(words, v6), v6addr);
    }

    #[test]
    fn mac_format() {
        assert_eq!(
            format_mac(&[0x02, 0x42, 0xac, 0x11, 0x00, 0x02]),
            "02:42:ac:11:00:02"
        );
    }
}
