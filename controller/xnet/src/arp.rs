//! Gratuitous ARP and unsolicited neighbor advertisements, plus ARP probing
//! used to resolve next hops that the kernel has not learned yet.

use crate::{route::Gateway, Mac, Result, MAC_LEN};
use smoltcp::{
    phy::ChecksumCapabilities,
    wire::{
        ArpOperation, ArpPacket, ArpRepr, EthernetAddress, EthernetFrame, EthernetProtocol,
        EthernetRepr, Icmpv6Packet, Icmpv6Repr, IpProtocol, Ipv4Address, Ipv6Address, Ipv6Packet,
        Ipv6Repr, NdiscNeighborFlags, NdiscRepr, RawHardwareAddress,
    },
};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::{
    io::{self, Read},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::{Duration, Instant},
};
use tracing::{debug, trace};

const BROADCAST: Mac = [0xff; MAC_LEN];
const ALL_NODES_MAC: Mac = [0x33, 0x33, 0, 0, 0, 1];
const ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

const ETH_P_ARP: u16 = 0x0806;
const ETH_P_IPV6: u16 = 0x86dd;

const ARPING_TIMEOUT: Duration = Duration::from_millis(500);

/// Emits L2 advertisements for addresses owned by this node.
#[async_trait::async_trait]
pub trait Announcer: Send + Sync {
    /// Broadcasts a gratuitous ARP (IPv4) or an unsolicited neighbor
    /// advertisement (IPv6) for `addr` out of the gateway interface.
    async fn announce(&self, gw: &Gateway, addr: IpAddr) -> Result<()>;

    /// Asks `target` for its hardware address, returning `None` if no reply
    /// arrives in time.
    async fn arping(&self, gw: &Gateway, target: Ipv4Addr) -> Result<Option<Mac>>;
}

/// Sends frames on raw packet sockets. Requires `CAP_NET_RAW`.
#[derive(Clone, Debug, Default)]
pub struct RawAnnouncer(());

// === impl RawAnnouncer ===

impl RawAnnouncer {
    pub fn new() -> Self {
        Self(())
    }
}

#[async_trait::async_trait]
impl Announcer for RawAnnouncer {
    async fn announce(&self, gw: &Gateway, addr: IpAddr) -> Result<()> {
        let (ifindex, mac) = (gw.ifindex, gw.mac);
        blocking(move || match addr {
            IpAddr::V4(ip) => {
                send_frame(ifindex, ETH_P_ARP, &BROADCAST, &gratuitous_arp(mac, ip))
            }
            IpAddr::V6(ip) => send_frame(
                ifindex,
                ETH_P_IPV6,
                &ALL_NODES_MAC,
                &unsolicited_na(mac, ip),
            ),
        })
        .await?;
        debug!(%addr, iface = %gw.ifname, "Advertised address");
        Ok(())
    }

    async fn arping(&self, gw: &Gateway, target: Ipv4Addr) -> Result<Option<Mac>> {
        let src = match gw.addr {
            Some(IpAddr::V4(src)) => src,
            _ => Ipv4Addr::UNSPECIFIED,
        };
        let (ifindex, mac) = (gw.ifindex, gw.mac);
        let found = blocking(move || {
            let sock = packet_socket(ETH_P_ARP)?;
            sock.send_to(
                &arp_request(mac, src, target),
                &link_addr(ifindex, ETH_P_ARP, &BROADCAST),
            )?;
            sock.set_read_timeout(Some(ARPING_TIMEOUT))?;

            let deadline = Instant::now() + ARPING_TIMEOUT;
            let mut buf = [0u8; 128];
            while Instant::now() < deadline {
                let n = match (&sock).read(&mut buf) {
                    Ok(n) => n,
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut =>
                    {
                        break
                    }
                    Err(e) => return Err(e),
                };
                if let Some(mac) = parse_arp_reply(&buf[..n], target) {
                    return Ok(Some(mac));
                }
            }
            Ok(None)
        })
        .await?;
        trace!(%target, found = found.is_some(), "Probed neighbor");
        Ok(found)
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let res = tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?;
    Ok(res?)
}

fn packet_socket(protocol: u16) -> io::Result<Socket> {
    Socket::new(
        Domain::PACKET,
        Type::RAW,
        Some(Protocol::from(i32::from(protocol.to_be()))),
    )
}

fn send_frame(ifindex: u32, protocol: u16, dst: &Mac, frame: &[u8]) -> io::Result<()> {
    let sock = packet_socket(protocol)?;
    sock.send_to(frame, &link_addr(ifindex, protocol, dst))?;
    Ok(())
}

fn link_addr(ifindex: u32, protocol: u16, dst: &Mac) -> SockAddr {
    // SAFETY: a zeroed sockaddr_storage is valid, and it is large enough and
    // sufficiently aligned to hold a sockaddr_ll.
    unsafe {
        let mut storage: libc::sockaddr_storage = std::mem::zeroed();
        let ll = &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_ll>();
        ll.sll_family = libc::AF_PACKET as u16;
        ll.sll_protocol = protocol.to_be();
        ll.sll_ifindex = ifindex as i32;
        ll.sll_halen = MAC_LEN as u8;
        ll.sll_addr[..MAC_LEN].copy_from_slice(dst);
        SockAddr::new(
            storage,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    }
}

/// A broadcast ARP request whose sender and target are both `ip`.
pub fn gratuitous_arp(mac: Mac, ip: Ipv4Addr) -> Vec<u8> {
    arp_request(mac, ip, ip)
}

pub fn arp_request(mac: Mac, src: Ipv4Addr, target: Ipv4Addr) -> Vec<u8> {
    let hw = EthernetAddress(mac);
    let eth_repr = EthernetRepr {
        src_addr: hw,
        dst_addr: EthernetAddress::BROADCAST,
        ethertype: EthernetProtocol::Arp,
    };
    let arp_repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: hw,
        source_protocol_addr: Ipv4Address::from(src),
        target_hardware_addr: EthernetAddress([0; MAC_LEN]),
        target_protocol_addr: Ipv4Address::from(target),
    };

    let mut buffer = vec![0u8; eth_repr.buffer_len() + arp_repr.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut frame);
    let mut arp_packet = ArpPacket::new_unchecked(frame.payload_mut());
    arp_repr.emit(&mut arp_packet);
    buffer
}

/// Returns the sender hardware address if `frame` is an ARP reply from
/// `from`.
pub fn parse_arp_reply(frame: &[u8], from: Ipv4Addr) -> Option<Mac> {
    let frame = EthernetFrame::new_checked(frame).ok()?;
    if frame.ethertype() != EthernetProtocol::Arp {
        return None;
    }
    let arp_packet = ArpPacket::new_checked(frame.payload()).ok()?;
    match ArpRepr::parse(&arp_packet).ok()? {
        ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Reply,
            source_hardware_addr,
            source_protocol_addr,
            ..
        } if Ipv4Addr::from(source_protocol_addr) == from => Some(source_hardware_addr.0),
        _ => None,
    }
}

/// An unsolicited neighbor advertisement for `target` sent to all nodes, with
/// the override flag and a target link-layer address option.
pub fn unsolicited_na(mac: Mac, target: Ipv6Addr) -> Vec<u8> {
    let src = Ipv6Address::from(target);
    let dst = Ipv6Address::from(ALL_NODES);
    let icmp_repr = Icmpv6Repr::Ndisc(NdiscRepr::NeighborAdvert {
        flags: NdiscNeighborFlags::OVERRIDE,
        target_addr: src,
        lladdr: Some(RawHardwareAddress::from_bytes(&mac)),
    });
    let ipv6_repr = Ipv6Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: IpProtocol::Icmpv6,
        payload_len: icmp_repr.buffer_len(),
        hop_limit: 255,
    };
    let eth_repr = EthernetRepr {
        src_addr: EthernetAddress(mac),
        dst_addr: EthernetAddress(ALL_NODES_MAC),
        ethertype: EthernetProtocol::Ipv6,
    };

    let total_len = eth_repr.buffer_len() + ipv6_repr.buffer_len() + icmp_repr.buffer_len();
    let mut buffer = vec![0u8; total_len];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    eth_repr.emit(&mut frame);
    let mut ipv6_packet = Ipv6Packet::new_unchecked(frame.payload_mut());
    ipv6_repr.emit(&mut ipv6_packet);
    let mut icmp_packet = Icmpv6Packet::new_unchecked(ipv6_packet.payload_mut());
    icmp_repr.emit(
        &src,
        &dst,
        &mut icmp_packet,
        &ChecksumCapabilities::default(),
    );
    buffer
}

#[cfg(any(test, feature = "test-util"))]
pub use self::fake::RecordingAnnouncer;

#[cfg(any(test, feature = "test-util"))]
mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Records advertisements and answers probes from a fixed table.
    #[derive(Debug, Default)]
    pub struct RecordingAnnouncer {
        announced: Mutex<Vec<(String, IpAddr)>>,
        replies: Mutex<HashMap<Ipv4Addr, Mac>>,
    }

    impl RecordingAnnouncer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reply(&self, ip: Ipv4Addr, mac: Mac) {
            self.replies.lock().insert(ip, mac);
        }

        pub fn announced(&self) -> Vec<(String, IpAddr)> {
            self.announced.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl Announcer for RecordingAnnouncer {
        async fn announce(&self, gw: &Gateway, addr: IpAddr) -> Result<()> {
            self.announced.lock().push((gw.ifname.clone(), addr));
            Ok(())
        }

        async fn arping(&self, _: &Gateway, target: Ipv4Addr) -> Result<Option<Mac>> {
            Ok(self.replies.lock().get(&target).copied())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: Mac = [0x02, 0x42, 0xac, 0x11, 0x00, 0x02];
    const PEER: Mac = [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];

    fn parse_arp(buf: &[u8]) -> (EthernetRepr, ArpRepr) {
        let frame = EthernetFrame::new_checked(buf).unwrap();
        let eth = EthernetRepr::parse(&frame).unwrap();
        let arp = ArpRepr::parse(&ArpPacket::new_checked(frame.payload()).unwrap()).unwrap();
        (eth, arp)
    }

    fn reply(from: Ipv4Addr, mac: Mac, to: Ipv4Addr) -> Vec<u8> {
        let eth_repr = EthernetRepr {
            src_addr: EthernetAddress(mac),
            dst_addr: EthernetAddress(MAC),
            ethertype: EthernetProtocol::Arp,
        };
        let arp_repr = ArpRepr::EthernetIpv4 {
            operation: ArpOperation::Reply,
            source_hardware_addr: EthernetAddress(mac),
            source_protocol_addr: from.into(),
            target_hardware_addr: EthernetAddress(MAC),
            target_protocol_addr: to.into(),
        };
        let mut buffer = vec![0u8; eth_repr.buffer_len() + arp_repr.buffer_len()];
        let mut frame = EthernetFrame::new_unchecked(&mut buffer);
        eth_repr.emit(&mut frame);
        arp_repr.emit(&mut ArpPacket::new_unchecked(frame.payload_mut()));
        buffer
    }

    #[test]
    fn gratuitous_arp_announces_own_address() {
        let ip = Ipv4Addr::new(203, 0, 113, 7);
        let (eth, arp) = parse_arp(&gratuitous_arp(MAC, ip));
        assert_eq!(eth.dst_addr, EthernetAddress::BROADCAST);
        assert_eq!(eth.src_addr, EthernetAddress(MAC));
        assert_eq!(eth.ethertype, EthernetProtocol::Arp);
        assert_eq!(
            arp,
            ArpRepr::EthernetIpv4 {
                operation: ArpOperation::Request,
                source_hardware_addr: EthernetAddress(MAC),
                source_protocol_addr: ip.into(),
                target_hardware_addr: EthernetAddress([0; MAC_LEN]),
                target_protocol_addr: ip.into(),
            }
        );
    }

    #[test]
    fn arp_request_asks_for_target() {
        let src = Ipv4Addr::new(192, 168, 1, 5);
        let target = Ipv4Addr::new(192, 168, 1, 1);
        let (eth, arp) = parse_arp(&arp_request(MAC, src, target));
        assert_eq!(eth.dst_addr, EthernetAddress::BROADCAST);
        match arp {
            ArpRepr::EthernetIpv4 {
                operation,
                source_protocol_addr,
                target_protocol_addr,
                ..
            } => {
                assert_eq!(operation, ArpOperation::Request);
                assert_eq!(Ipv4Addr::from(source_protocol_addr), src);
                assert_eq!(Ipv4Addr::from(target_protocol_addr), target);
            }
            arp => panic!("unexpected ARP packet: {arp:?}"),
        }
    }

    #[test]
    fn parses_matching_reply_only() {
        let gw_ip = Ipv4Addr::new(192, 168, 1, 1);
        let me = Ipv4Addr::new(192, 168, 1, 5);
        let rsp = reply(gw_ip, PEER, me);
        assert_eq!(parse_arp_reply(&rsp, gw_ip), Some(PEER));
        assert_eq!(parse_arp_reply(&rsp, Ipv4Addr::new(192, 168, 1, 2)), None);

        // Requests, even from the right address, carry no answer.
        assert_eq!(parse_arp_reply(&arp_request(PEER, gw_ip, me), gw_ip), None);
        assert_eq!(parse_arp_reply(&rsp[..30], gw_ip), None);
        let na = unsolicited_na(PEER, "2001:db8::1".parse().unwrap());
        assert_eq!(parse_arp_reply(&na, gw_ip), None);
    }

    #[test]
    fn neighbor_advertisement_overrides_for_all_nodes() {
        let target: Ipv6Addr = "2001:db8::7".parse().unwrap();
        let buf = unsolicited_na(MAC, target);

        let frame = EthernetFrame::new_checked(&buf[..]).unwrap();
        assert_eq!(frame.dst_addr(), EthernetAddress(ALL_NODES_MAC));
        assert_eq!(frame.ethertype(), EthernetProtocol::Ipv6);

        let ipv6 = Ipv6Packet::new_checked(frame.payload()).unwrap();
        assert_eq!(ipv6.hop_limit(), 255);
        assert_eq!(ipv6.next_header(), IpProtocol::Icmpv6);
        assert_eq!(Ipv6Addr::from(ipv6.src_addr()), target);
        assert_eq!(Ipv6Addr::from(ipv6.dst_addr()), ALL_NODES);

        // Parsing verifies the checksum.
        let icmp = Icmpv6Packet::new_checked(ipv6.payload()).unwrap();
        let repr = Icmpv6Repr::parse(
            &ipv6.src_addr(),
            &ipv6.dst_addr(),
            &icmp,
            &ChecksumCapabilities::default(),
        )
        .unwrap();
        assert_eq!(
            repr,
            Icmpv6Repr::Ndisc(NdiscRepr::NeighborAdvert {
                flags: NdiscNeighborFlags::OVERRIDE,
                target_addr: target.into(),
                lladdr: Some(RawHardwareAddress::from_bytes(&MAC)),
            })
        );
    }

    #[tokio::test]
    async fn recording_announcer() {
        let gw = Gateway {
            ifindex: 2,
            ifname: "eth0".to_string(),
            mac: MAC,
            via: None,
            addr: None,
        };
        let announcer = RecordingAnnouncer::new();
        announcer.reply(Ipv4Addr::new(10, 0, 0, 1), [1; 6]);
        announcer
            .announce(&gw, "203.0.113.7".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(
            announcer.announced(),
            vec![("eth0".to_string(), "203.0.113.7".parse().unwrap())]
        );
        assert_eq!(
            announcer.arping(&gw, Ipv4Addr::new(10, 0, 0, 1)).await.unwrap(),
            Some([1; 6])
        );
        assert_eq!(
            announcer.arping(&gw, Ipv4Addr::new(10, 0, 0, 2)).await.unwrap(),
            None
        );
    }
}
