//! Default-route discovery and neighbor-table maintenance over rtnetlink.

use crate::{Error, Mac, Result, MAC_LEN};
use futures::TryStreamExt;
use netlink_packet_route::{
    link::LinkAttribute,
    neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourState},
    route::{RouteAddress, RouteAttribute},
};
use rtnetlink::{Handle, IpVersion};
use std::net::IpAddr;
use tracing::debug;

/// The interface that carries the default route.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Gateway {
    pub ifindex: u32,
    pub ifname: String,
    pub mac: Mac,
    /// The next-hop router, when the route has one.
    pub via: Option<IpAddr>,
    /// The interface's primary IPv4 address, used as the ARP sender.
    pub addr: Option<IpAddr>,
}

#[async_trait::async_trait]
pub trait Neighbors: Send + Sync {
    async fn default_gateway(&self) -> Result<Gateway>;

    /// Installs or refreshes a `REACHABLE` neighbor entry.
    async fn ensure_neighbor(&self, ifindex: u32, ip: IpAddr, mac: Mac) -> Result<()>;

    /// Removes a neighbor entry. Removing an absent entry succeeds.
    async fn delete_neighbor(&self, ifindex: u32, ip: IpAddr) -> Result<()>;

    /// Returns the kernel's current hardware address for `ip`, if known.
    async fn lookup_neighbor(&self, ifindex: u32, ip: IpAddr) -> Result<Option<Mac>>;
}

#[derive(Clone)]
pub struct Netlink {
    handle: Handle,
}

// === impl Netlink ===

impl Netlink {
    /// Opens a netlink connection whose driver runs on the current runtime.
    pub fn connect() -> Result<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);
        Ok(Self { handle })
    }

    async fn link(&self, ifindex: u32) -> Result<(String, Option<Mac>)> {
        let mut links = self.handle.link().get().match_index(ifindex).execute();
        let mut name = String::new();
        let mut mac = None;
        if let Some(msg) = links.try_next().await? {
            for attr in msg.attributes {
                match attr {
                    LinkAttribute::IfName(n) => name = n,
                    LinkAttribute::Address(a) if a.len() == MAC_LEN => {
                        let mut m = [0u8; MAC_LEN];
                        m.copy_from_slice(&a);
                        mac = Some(m);
                    }
                    _ => {}
                }
            }
        }
        Ok((name, mac))
    }

    async fn link_addr(&self, ifindex: u32) -> Result<Option<IpAddr>> {
        use netlink_packet_route::address::AddressAttribute;

        let mut addrs = self
            .handle
            .address()
            .get()
            .set_link_index_filter(ifindex)
            .execute();
        while let Some(msg) = addrs.try_next().await? {
            for attr in msg.attributes {
                if let AddressAttribute::Address(addr @ IpAddr::V4(_)) = attr {
                    return Ok(Some(addr));
                }
            }
        }
        Ok(None)
    }

    async fn find_neighbor(
        &self,
        ifindex: u32,
        ip: IpAddr,
    ) -> Result<Option<netlink_packet_route::neighbour::NeighbourMessage>> {
        let mut neighbors = self.handle.neighbours().get().execute();
        while let Some(msg) = neighbors.try_next().await? {
            if msg.header.ifindex != ifindex {
                continue;
            }
            let matches = msg.attributes.iter().any(|attr| match attr {
                NeighbourAttribute::Destination(NeighbourAddress::Inet(a)) => {
                    IpAddr::V4(*a) == ip
                }
                NeighbourAttribute::Destination(NeighbourAddress::Inet6(a)) => {
                    IpAddr::V6(*a) == ip
                }
                _ => false,
            });
            if matches {
                return Ok(Some(msg));
            }
        }
        Ok(None)
    }
}

#[async_trait::async_trait]
impl Neighbors for Netlink {
    async fn default_gateway(&self) -> Result<Gateway> {
        let mut routes = self.handle.route().get(IpVersion::V4).execute();
        while let Some(msg) = routes.try_next().await? {
            if msg.header.destination_prefix_length != 0 {
                continue;
            }
            let mut oif = None;
            let mut via = None;
            for attr in &msg.attributes {
                match attr {
                    RouteAttribute::Oif(i) => oif = Some(*i),
                    RouteAttribute::Gateway(RouteAddress::Inet(a)) => via = Some(IpAddr::V4(*a)),
                    _ => {}
                }
            }
            let Some(ifindex) = oif else {
                continue;
            };
            let (ifname, mac) = self.link(ifindex).await?;
            let mac = mac.ok_or(Error::NoHardwareAddress(ifindex))?;
            let addr = self.link_addr(ifindex).await?;
            debug!(%ifname, ifindex, ?via, "Discovered default gateway");
            return Ok(Gateway {
                ifindex,
                ifname,
                mac,
                via,
                addr,
            });
        }
        Err(Error::NoDefaultRoute)
    }

    async fn ensure_neighbor(&self, ifindex: u32, ip: IpAddr, mac: Mac) -> Result<()> {
        self.handle
            .neighbours()
            .add(ifindex, ip)
            .link_local_address(&mac)
            .state(NeighbourState::Reachable)
            .replace()
            .execute()
            .await?;
        Ok(())
    }

    async fn delete_neighbor(&self, ifindex: u32, ip: IpAddr) -> Result<()> {
        let Some(msg) = self.find_neighbor(ifindex, ip).await? else {
            return Ok(());
        };
        match self.handle.neighbours().del(msg).execute().await {
            Ok(()) => Ok(()),
            Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ENOENT => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn lookup_neighbor(&self, ifindex: u32, ip: IpAddr) -> Result<Option<Mac>> {
        let Some(msg) = self.find_neighbor(ifindex, ip).await? else {
            return Ok(None);
        };
        for attr in msg.attributes {
            if let NeighbourAttribute::LinkLocalAddress(a) = attr {
                if a.len() == MAC_LEN {
                    let mut m = [0u8; MAC_LEN];
                    m.copy_from_slice(&a);
                    return Ok(Some(m));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use self::fake::FakeNeighbors;

#[cfg(any(test, feature = "test-util"))]
mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// Records neighbor state in memory.
    #[derive(Debug)]
    pub struct FakeNeighbors {
        gateway: Mutex<Option<Gateway>>,
        entries: Mutex<BTreeMap<(u32, IpAddr), Mac>>,
    }

    impl FakeNeighbors {
        pub fn new(gateway: Option<Gateway>) -> Self {
            Self {
                gateway: Mutex::new(gateway),
                entries: Mutex::new(BTreeMap::new()),
            }
        }

        pub fn set_gateway(&self, gateway: Option<Gateway>) {
            *self.gateway.lock() = gateway;
        }

        pub fn entries(&self) -> BTreeMap<(u32, IpAddr), Mac> {
            self.entries.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl Neighbors for FakeNeighbors {
        async fn default_gateway(&self) -> Result<Gateway> {
            self.gateway.lock().clone().ok_or(Error::NoDefaultRoute)
        }

        async fn ensure_neighbor(&self, ifindex: u32, ip: IpAddr, mac: Mac) -> Result<()> {
            self.entries.lock().insert((ifindex, ip), mac);
            Ok(())
        }

        async fn delete_neighbor(&self, ifindex: u32, ip: IpAddr) -> Result<()> {
            self.entries.lock().remove(&(ifindex, ip));
            Ok(())
        }

        async fn lookup_neighbor(&self, ifindex: u32, ip: IpAddr) -> Result<Option<Mac>> {
            Ok(self.entries.lock().get(&(ifindex, ip)).copied())
        }
    }
}
