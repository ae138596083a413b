//! Wireguard device control over the `wireguard` generic netlink family.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use async_trait::async_trait;

use super::attr::{AttrIter, get};
use super::builder::MessageBuilder;
use super::error::{Error, Result};
use super::genl::{GenlConnection, attributes};
use crate::wireguard::{
    DeviceConfig, DeviceState, IpPrefix, PeerConfig, PeerState, WireguardClient, WireguardKey,
};

pub const WG_GENL_NAME: &str = "wireguard";
pub const WG_GENL_VERSION: u8 = 1;

const WG_CMD_GET_DEVICE: u8 = 0;
const WG_CMD_SET_DEVICE: u8 = 1;

/// WGDEVICE_A_* attributes.
mod device_attr {
    pub const IFNAME: u16 = 2;
    pub const PRIVATE_KEY: u16 = 3;
    pub const PUBLIC_KEY: u16 = 4;
    pub const LISTEN_PORT: u16 = 6;
    pub const FWMARK: u16 = 7;
    pub const PEERS: u16 = 8;
}

/// WGPEER_A_* attributes.
mod peer_attr {
    pub const PUBLIC_KEY: u16 = 1;
    pub const PRESHARED_KEY: u16 = 2;
    pub const FLAGS: u16 = 3;
    pub const ENDPOINT: u16 = 4;
    pub const PERSISTENT_KEEPALIVE: u16 = 5;
    pub const ALLOWED_IPS: u16 = 9;
}

/// WGALLOWEDIP_A_* attributes.
mod allowedip_attr {
    pub const FAMILY: u16 = 1;
    pub const IPADDR: u16 = 2;
    pub const CIDR_MASK: u16 = 3;
}

const WGPEER_F_REMOVE_ME: u32 = 1 << 0;
const WGPEER_F_REPLACE_ALLOWEDIPS: u32 = 1 << 1;

/// Generic netlink client for wireguard devices.
pub struct WireguardConnection {
    genl: GenlConnection,
    family_id: u16,
}

impl WireguardConnection {
    /// Open a genl socket and resolve the wireguard family.
    ///
    /// Fails with [`Error::FamilyNotFound`] when the wireguard module is not
    /// loaded.
    pub async fn new() -> Result<Self> {
        let genl = GenlConnection::new()?;
        let family_id = genl.family_id(WG_GENL_NAME).await?;
        Ok(Self { genl, family_id })
    }

    pub async fn get_device(&self, ifname: &str) -> Result<DeviceState> {
        let responses = self
            .genl
            .dump_command(self.family_id, WG_CMD_GET_DEVICE, WG_GENL_VERSION, |b| {
                b.append_attr_str(device_attr::IFNAME, ifname);
            })
            .await
            .map_err(|e| e.with_context(format!("reading wireguard device {ifname}")))?;

        if responses.is_empty() {
            return Err(Error::InterfaceNotFound {
                name: ifname.to_string(),
            });
        }

        let mut device = DeviceState::default();
        for response in &responses {
            parse_device_attrs(attributes(response)?, &mut device)?;
        }
        Ok(device)
    }

    pub async fn set_device(&self, ifname: &str, config: &DeviceConfig) -> Result<()> {
        self.genl
            .command(self.family_id, WG_CMD_SET_DEVICE, WG_GENL_VERSION, |b| {
                append_device_config(b, ifname, config)
            })
            .await
            .map_err(|e| e.with_context(format!("configuring wireguard device {ifname}")))
    }
}

#[async_trait]
impl WireguardClient for WireguardConnection {
    async fn device(&self, name: &str) -> crate::Result<DeviceState> {
        Ok(self.get_device(name).await?)
    }

    async fn configure(&self, name: &str, config: &DeviceConfig) -> crate::Result<()> {
        Ok(self.set_device(name, config).await?)
    }
}

/// Encode a patch as `WG_CMD_SET_DEVICE` attributes.
fn append_device_config(builder: &mut MessageBuilder, ifname: &str, config: &DeviceConfig) {
    builder.append_attr_str(device_attr::IFNAME, ifname);
    if let Some(key) = &config.private_key {
        builder.append_attr(device_attr::PRIVATE_KEY, key.as_bytes());
    }
    if let Some(port) = config.listen_port {
        builder.append_attr_u16(device_attr::LISTEN_PORT, port);
    }
    if let Some(mark) = config.firewall_mark {
        builder.append_attr_u32(device_attr::FWMARK, mark);
    }

    if config.peers.is_empty() {
        return;
    }
    let peers = builder.nest_start(device_attr::PEERS);
    for (idx, peer) in config.peers.iter().enumerate() {
        append_peer(builder, idx as u16, peer);
    }
    builder.nest_end(peers);
}

fn append_peer(builder: &mut MessageBuilder, idx: u16, peer: &PeerConfig) {
    let nest = builder.nest_start(idx);
    builder.append_attr(peer_attr::PUBLIC_KEY, peer.public_key.as_bytes());

    if peer.remove {
        builder.append_attr_u32(peer_attr::FLAGS, WGPEER_F_REMOVE_ME);
        builder.nest_end(nest);
        return;
    }
    if peer.replace_allowed_ips {
        builder.append_attr_u32(peer_attr::FLAGS, WGPEER_F_REPLACE_ALLOWEDIPS);
    }
    if let Some(psk) = &peer.preshared_key {
        builder.append_attr(peer_attr::PRESHARED_KEY, psk.as_bytes());
    }
    if let Some(endpoint) = &peer.endpoint {
        builder.append_attr(peer_attr::ENDPOINT, &sockaddr_to_bytes(endpoint));
    }
    if let Some(interval) = peer.persistent_keepalive {
        builder.append_attr_u16(peer_attr::PERSISTENT_KEEPALIVE, interval);
    }

    let ips = builder.nest_start(peer_attr::ALLOWED_IPS);
    for (idx, prefix) in peer.allowed_ips.iter().enumerate() {
        let ip = builder.nest_start(idx as u16);
        builder.append_attr_u16(allowedip_attr::FAMILY, prefix.family());
        builder.append_attr(allowedip_attr::IPADDR, &prefix.addr_bytes());
        builder.append_attr_u8(allowedip_attr::CIDR_MASK, prefix.prefix_len());
        builder.nest_end(ip);
    }
    builder.nest_end(ips);

    builder.nest_end(nest);
}

fn parse_device_attrs(data: &[u8], device: &mut DeviceState) -> Result<()> {
    for (attr_type, payload) in AttrIter::new(data) {
        match attr_type {
            device_attr::PRIVATE_KEY => {
                device.private_key = Some(WireguardKey::from_bytes(get::key(payload)?));
            }
            device_attr::PUBLIC_KEY => {
                device.public_key = Some(WireguardKey::from_bytes(get::key(payload)?));
            }
            device_attr::LISTEN_PORT => device.listen_port = get::u16_ne(payload)?,
            device_attr::FWMARK => device.firewall_mark = get::u32_ne(payload)?,
            device_attr::PEERS => {
                for (_idx, peer_data) in AttrIter::new(payload) {
                    let peer = parse_peer(peer_data)?;
                    // a peer with many allowed IPs continues in the next
                    // message, repeating its public key
                    match device.peers.last_mut() {
                        Some(last) if last.public_key == peer.public_key => {
                            last.allowed_ips.extend(peer.allowed_ips);
                        }
                        _ => device.peers.push(peer),
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_peer(data: &[u8]) -> Result<PeerState> {
    let mut peer = PeerState::default();
    for (attr_type, payload) in AttrIter::new(data) {
        match attr_type {
            peer_attr::PUBLIC_KEY => peer.public_key = WireguardKey::from_bytes(get::key(payload)?),
            peer_attr::PRESHARED_KEY => {
                peer.preshared_key = Some(WireguardKey::from_bytes(get::key(payload)?));
            }
            peer_attr::ENDPOINT => peer.endpoint = parse_sockaddr(payload),
            peer_attr::PERSISTENT_KEEPALIVE => peer.persistent_keepalive = get::u16_ne(payload)?,
            peer_attr::ALLOWED_IPS => {
                for (_idx, ip_data) in AttrIter::new(payload) {
                    if let Some(prefix) = parse_allowed_ip(ip_data)? {
                        peer.allowed_ips.push(prefix);
                    }
                }
            }
            _ => {}
        }
    }
    Ok(peer)
}

fn parse_allowed_ip(data: &[u8]) -> Result<Option<IpPrefix>> {
    let (mut family, mut addr, mut cidr) = (None, None, None);
    for (attr_type, payload) in AttrIter::new(data) {
        match attr_type {
            allowedip_attr::FAMILY => family = Some(get::u16_ne(payload)?),
            allowedip_attr::IPADDR => addr = Some(payload),
            allowedip_attr::CIDR_MASK => cidr = Some(get::u8(payload)?),
            _ => {}
        }
    }

    let (Some(family), Some(addr), Some(cidr)) = (family, addr, cidr) else {
        return Ok(None);
    };
    let addr = match i32::from(family) {
        libc::AF_INET => {
            let octets: [u8; 4] = addr
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| Error::InvalidAttribute("short IPv4 allowed IP".into()))?;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        libc::AF_INET6 => {
            let octets: [u8; 16] = addr
                .get(..16)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| Error::InvalidAttribute("short IPv6 allowed IP".into()))?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Ok(None),
    };

    IpPrefix::new(addr, cidr)
        .map(Some)
        .map_err(|e| Error::InvalidAttribute(e.to_string()))
}

/// Encode an endpoint as a kernel `sockaddr_in` / `sockaddr_in6`.
fn sockaddr_to_bytes(addr: &SocketAddr) -> Vec<u8> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut buf = vec![0u8; 16];
            buf[0..2].copy_from_slice(&(libc::AF_INET as u16).to_ne_bytes());
            buf[2..4].copy_from_slice(&v4.port().to_be_bytes());
            buf[4..8].copy_from_slice(&v4.ip().octets());
            buf
        }
        SocketAddr::V6(v6) => {
            let mut buf = vec![0u8; 28];
            buf[0..2].copy_from_slice(&(libc::AF_INET6 as u16).to_ne_bytes());
            buf[2..4].copy_from_slice(&v6.port().to_be_bytes());
            buf[4..8].copy_from_slice(&v6.flowinfo().to_be_bytes());
            buf[8..24].copy_from_slice(&v6.ip().octets());
            buf[24..28].copy_from_slice(&v6.scope_id().to_ne_bytes());
            buf
        }
    }
}

fn parse_sockaddr(data: &[u8]) -> Option<SocketAddr> {
    let family = u16::from_ne_bytes(data.get(0..2)?.try_into().ok()?);
    let port = u16::from_be_bytes(data.get(2..4)?.try_into().ok()?);

    match i32::from(family) {
        libc::AF_INET => {
            let octets: [u8; 4] = data.get(4..8)?.try_into().ok()?;
            Some(SocketAddr::V4(SocketAddrV4::new(octets.into(), port)))
        }
        libc::AF_INET6 => {
            let octets: [u8; 16] = data.get(8..24)?.try_into().ok()?;
            let scope_id = data
                .get(24..28)
                .and_then(|b| b.try_into().ok())
                .map_or(0, u32::from_ne_bytes);
            Some(SocketAddr::V6(SocketAddrV6::new(
                octets.into(),
                port,
                0,
                scope_id,
            )))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::genl::GenlMsgHdr;
    use crate::netlink::message::NLMSG_HDRLEN;

    fn key(n: u8) -> WireguardKey {
        WireguardKey::from_bytes([n; 32])
    }

    /// Encode a set request and return its attribute section.
    fn encoded(config: &DeviceConfig) -> Vec<u8> {
        let mut builder = MessageBuilder::new(0x20, 0);
        builder.append(&GenlMsgHdr::new(WG_CMD_SET_DEVICE, WG_GENL_VERSION));
        append_device_config(&mut builder, "wg0", config);
        let msg = builder.finish();
        attributes(&msg[NLMSG_HDRLEN..]).unwrap().to_vec()
    }

    #[test]
    fn set_request_carries_patch_fields() {
        let config = DeviceConfig {
            private_key: Some(key(1)),
            listen_port: Some(0),
            firewall_mark: None,
            peers: vec![PeerConfig {
                public_key: key(2),
                preshared_key: Some(WireguardKey::ZERO),
                endpoint: Some("192.0.2.1:51820".parse().unwrap()),
                persistent_keepalive: Some(25),
                replace_allowed_ips: true,
                allowed_ips: vec![
                    "10.0.0.0/24".parse().unwrap(),
                    "fd00::/64".parse().unwrap(),
                ],
                ..Default::default()
            }],
        };

        let attrs = encoded(&config);
        let kinds: Vec<u16> = AttrIter::new(&attrs).map(|(kind, _)| kind).collect();
        assert_eq!(
            kinds,
            [
                device_attr::IFNAME,
                device_attr::PRIVATE_KEY,
                device_attr::LISTEN_PORT,
                device_attr::PEERS
            ]
        );

        let mut device = DeviceState::default();
        parse_device_attrs(&attrs, &mut device).unwrap();
        assert_eq!(device.private_key, Some(key(1)));
        assert_eq!(device.listen_port, 0);

        let peer = &device.peers[0];
        assert_eq!(peer.public_key, key(2));
        assert_eq!(peer.preshared_key, Some(WireguardKey::ZERO));
        assert_eq!(peer.endpoint, Some("192.0.2.1:51820".parse().unwrap()));
        assert_eq!(peer.persistent_keepalive, 25);
        assert_eq!(peer.allowed_ips, config.peers[0].allowed_ips);
    }

    #[test]
    fn removal_sends_only_key_and_flag() {
        let config = DeviceConfig {
            peers: vec![PeerConfig::removal(key(3))],
            ..Default::default()
        };
        let attrs = encoded(&config);
        let (_, peers) = AttrIter::new(&attrs)
            .find(|(kind, _)| *kind == device_attr::PEERS)
            .unwrap();
        let (_, peer) = AttrIter::new(peers).next().unwrap();

        let fields: Vec<_> = AttrIter::new(peer).collect();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].0, peer_attr::PUBLIC_KEY);
        assert_eq!(fields[1].0, peer_attr::FLAGS);
        assert_eq!(get::u32_ne(fields[1].1).unwrap(), WGPEER_F_REMOVE_ME);
    }

    #[test]
    fn split_peer_is_merged() {
        let first = DeviceConfig {
            peers: vec![PeerConfig {
                public_key: key(4),
                allowed_ips: vec!["10.0.0.0/24".parse().unwrap()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let second = DeviceConfig {
            peers: vec![
                PeerConfig {
                    public_key: key(4),
                    allowed_ips: vec!["10.0.1.0/24".parse().unwrap()],
                    ..Default::default()
                },
                PeerConfig {
                    public_key: key(5),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let mut device = DeviceState::default();
        parse_device_attrs(&encoded(&first), &mut device).unwrap();
        parse_device_attrs(&encoded(&second), &mut device).unwrap();

        assert_eq!(device.peers.len(), 2);
        assert_eq!(device.peers[0].allowed_ips.len(), 2);
        assert_eq!(device.peers[1].public_key, key(5));
    }

    #[test]
    fn sockaddr_layouts() {
        let v4: SocketAddr = "198.51.100.7:4500".parse().unwrap();
        let bytes = sockaddr_to_bytes(&v4);
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[2..4], &4500u16.to_be_bytes());
        assert_eq!(parse_sockaddr(&bytes), Some(v4));

        let v6: SocketAddr = "[fd00::2]:51820".parse().unwrap();
        let bytes = sockaddr_to_bytes(&v6);
        assert_eq!(bytes.len(), 28);
        assert_eq!(parse_sockaddr(&bytes), Some(v6));

        assert_eq!(parse_sockaddr(&[0, 0]), None);
        assert_eq!(parse_sockaddr(&[0xff; 16]), None);
    }
}
