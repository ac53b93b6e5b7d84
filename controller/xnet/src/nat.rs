//! The NAT map: virtual address to a bounded set of upstream endpoints.

use crate::{addr_to_words, words_to_addr, Mac, Proto, SysId, TcDir};
use std::{fmt, net::IpAddr};

pub const MAX_EPS: usize = 128;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NatKey {
    pub sys: u32,
    pub daddr: [u32; 4],
    /// Network byte order.
    pub dport: u16,
    pub proto: u8,
    pub v6: u8,
    pub tc_dir: u8,
    pub pad: [u8; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct NatEp {
    pub raddr: [u32; 4],
    /// Network byte order.
    pub rport: u16,
    pub rmac: Mac,
    pub ofi: u32,
    pub oflags: u8,
    pub omac: Mac,
    pub omac_set: u8,
    pub active: u8,
    pub pad: [u8; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NatVal {
    pub lock: u32,
    pub ep_sel: u16,
    pub ep_cnt: u16,
    pub eps: [NatEp; MAX_EPS],
}

/// An endpoint to program into a [`NatVal`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Upstream {
    pub addr: IpAddr,
    pub port: u16,
    pub mac: Mac,
    pub ofi: u32,
    pub oflags: u8,
    pub omac: Option<Mac>,
    pub active: bool,
}

unsafe impl aya::Pod for NatKey {}
unsafe impl aya::Pod for NatVal {}

// === impl NatKey ===

impl NatKey {
    pub fn new(sys: SysId, daddr: IpAddr, dport: u16, proto: Proto, tc_dir: TcDir) -> Self {
        let (daddr, v6) = addr_to_words(daddr);
        Self {
            sys: sys.into(),
            daddr,
            dport: dport.to_be(),
            proto: proto as u8,
            v6: v6 as u8,
            tc_dir: tc_dir as u8,
            pad: [0; 3],
        }
    }

    pub fn daddr(&self) -> IpAddr {
        words_to_addr(self.daddr, self.is_v6())
    }

    pub fn is_v6(&self) -> bool {
        self.v6 != 0
    }

    pub fn dport(&self) -> u16 {
        u16::from_be(self.dport)
    }

    pub fn with_dir(mut self, tc_dir: TcDir) -> Self {
        self.tc_dir = tc_dir as u8;
        self
    }
}

/// The canonical textual form, used to key in-memory mirrors.
impl fmt::Display for NatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}:{}/{}/{}",
            self.sys,
            self.daddr(),
            self.dport(),
            self.proto,
            self.tc_dir
        )
    }
}

// === impl NatEp ===

impl NatEp {
    const EMPTY: Self = Self {
        raddr: [0; 4],
        rport: 0,
        rmac: [0; 6],
        ofi: 0,
        oflags: 0,
        omac: [0; 6],
        omac_set: 0,
        active: 0,
        pad: [0; 3],
    };

    /// Endpoints carry no family of their own; it is the family of the
    /// [`NatKey`] they are stored under.
    pub fn raddr(&self, v6: bool) -> IpAddr {
        words_to_addr(self.raddr, v6)
    }

    pub fn rport(&self) -> u16 {
        u16::from_be(self.rport)
    }

    fn assign(&mut self, up: &Upstream) {
        let (raddr, _) = addr_to_words(up.addr);
        self.raddr = raddr;
        self.rport = up.port.to_be();
        self.rmac = up.mac;
        self.ofi = up.ofi;
        self.oflags = up.oflags;
        match up.omac {
            Some(omac) if omac.iter().any(|b| *b != 0) => {
                self.omac = omac;
                self.omac_set = 1;
            }
            _ => {
                self.omac = [0; 6];
                self.omac_set = 0;
            }
        }
        self.active = up.active as u8;
    }
}

// === impl NatVal ===

impl Default for NatVal {
    fn default() -> Self {
        Self {
            lock: 0,
            ep_sel: 0,
            ep_cnt: 0,
            eps: [NatEp::EMPTY; MAX_EPS],
        }
    }
}

impl NatVal {
    pub fn endpoints(&self) -> &[NatEp] {
        &self.eps[..(self.ep_cnt as usize).min(MAX_EPS)]
    }

    /// Updates the endpoint with the same address and port in place, or
    /// appends it. Returns false when the value is full.
    pub fn add_endpoint(&mut self, up: &Upstream) -> bool {
        let (raddr, _) = addr_to_words(up.addr);
        let rport = up.port.to_be();
        let cnt = (self.ep_cnt as usize).min(MAX_EPS);

        if let Some(ep) = self.eps[..cnt]
            .iter_mut()
            .find(|ep| ep.raddr == raddr && ep.rport == rport)
        {
            ep.assign(up);
            return true;
        }

        if cnt >= MAX_EPS {
            return false;
        }
        self.eps[cnt].assign(up);
        self.ep_cnt += 1;
        true
    }

    /// Removes the endpoint by swapping the last endpoint into its slot.
    /// Returns whether an endpoint was removed.
    pub fn del_endpoint(&mut self, addr: IpAddr, port: u16) -> bool {
        let (raddr, _) = addr_to_words(addr);
        let rport = port.to_be();
        let cnt = (self.ep_cnt as usize).min(MAX_EPS);

        let Some(idx) = self.eps[..cnt]
            .iter()
            .position(|ep| ep.raddr == raddr && ep.rport == rport)
        else {
            return false;
        };

        let last = cnt - 1;
        self.eps[idx] = self.eps[last];
        self.eps[last] = NatEp::EMPTY;
        self.ep_cnt -= 1;
        true
    }

    /// Whether every active endpoint can be addressed at L2.
    pub fn is_addressable(&self) -> bool {
        self.endpoints().iter().all(|ep| {
            ep.active == 0 || ep.rmac.iter().any(|b| *b != 0) || ep.omac_set != 0
        })
    }
}
