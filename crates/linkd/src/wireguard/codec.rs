//! Conversion between declared wireguard specs and device patches.
//!
//! [`decode`] turns kernel device state into a [`WireguardSpec`] so it can be
//! compared with the declaration; [`encode`] computes the patch that takes
//! the device from one spec to the other.

use std::cmp::Ordering;
use std::net::{SocketAddr, ToSocketAddrs};

use super::types::{DeviceConfig, DeviceState, PeerConfig, WireguardKey};
use crate::error::{Error, Result};
use crate::spec::{WireguardPeer, WireguardSpec};

/// Compute the patch that turns `existing` into `desired`.
///
/// Both peer lists must be sorted by public key (see
/// [`WireguardSpec::sort`]). Peers are matched with a single merge pass:
/// peers only in `desired` are added with their allowed IPs replaced, peers
/// only in `existing` are removed, and peers in both are rewritten when any
/// field differs. Any unparsable key or endpoint fails the whole patch.
pub fn encode(desired: &WireguardSpec, existing: &WireguardSpec) -> Result<DeviceConfig> {
    let mut config = DeviceConfig::default();

    if desired.private_key != existing.private_key {
        config.private_key = Some(desired.private_key.parse()?);
    }
    if desired.listen_port != existing.listen_port {
        config.listen_port = Some(desired.listen_port);
    }
    if desired.firewall_mark != existing.firewall_mark {
        config.firewall_mark = Some(desired.firewall_mark);
    }

    let (old, new) = (&existing.peers, &desired.peers);
    let (mut left, mut right) = (0, 0);
    loop {
        match (old.get(left), new.get(right)) {
            (None, None) => break,
            (Some(gone), None) => {
                config.peers.push(removal(gone)?);
                left += 1;
            }
            (None, Some(added)) => {
                config.peers.push(peer_entry(added)?);
                right += 1;
            }
            (Some(current), Some(wanted)) => match current.public_key.cmp(&wanted.public_key) {
                Ordering::Less => {
                    config.peers.push(removal(current)?);
                    left += 1;
                }
                Ordering::Greater => {
                    config.peers.push(peer_entry(wanted)?);
                    right += 1;
                }
                Ordering::Equal => {
                    if current != wanted {
                        config.peers.push(peer_entry(wanted)?);
                    }
                    left += 1;
                    right += 1;
                }
            },
        }
    }

    Ok(config)
}

fn removal(peer: &WireguardPeer) -> Result<PeerConfig> {
    Ok(PeerConfig::removal(peer.public_key.parse()?))
}

/// Full add/replace entry for a peer.
///
/// The preshared key is always sent (zero when none is declared) so a stale
/// kernel key is cleared.
fn peer_entry(peer: &WireguardPeer) -> Result<PeerConfig> {
    let preshared_key = if peer.preshared_key.is_empty() {
        WireguardKey::ZERO
    } else {
        peer.preshared_key.parse()?
    };
    let endpoint = if peer.endpoint.is_empty() {
        None
    } else {
        Some(resolve_endpoint(&peer.endpoint)?)
    };

    Ok(PeerConfig {
        public_key: peer.public_key.parse()?,
        remove: false,
        preshared_key: Some(preshared_key),
        endpoint,
        persistent_keepalive: Some(peer.persistent_keepalive),
        replace_allowed_ips: true,
        allowed_ips: peer.allowed_ips.clone(),
    })
}

/// Parse `ip:port`, falling back to a name lookup for `host:port`.
///
/// The lookup is blocking; it only happens while building a patch.
pub fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr> {
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let invalid = |reason: String| Error::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };
    endpoint
        .to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?
        .next()
        .ok_or_else(|| invalid("no addresses".to_string()))
}

/// Turn device state into a spec.
///
/// With `is_status` the local key field holds the public key (what a status
/// report shows); otherwise it holds the private key (what a declaration
/// holds). Zero preshared keys decode as absent.
pub fn decode(device: &DeviceState, is_status: bool) -> WireguardSpec {
    let key_text = |key: Option<WireguardKey>| key.map(|k| k.to_string()).unwrap_or_default();

    let (private_key, public_key) = if is_status {
        (String::new(), key_text(device.public_key))
    } else {
        (key_text(device.private_key), String::new())
    };

    WireguardSpec {
        private_key,
        public_key,
        listen_port: device.listen_port,
        firewall_mark: device.firewall_mark,
        peers: device
            .peers
            .iter()
            .map(|peer| WireguardPeer {
                public_key: peer.public_key.to_string(),
                preshared_key: key_text(peer.preshared_key.filter(|k| !k.is_zero())),
                endpoint: peer.endpoint.map(|e| e.to_string()).unwrap_or_default(),
                persistent_keepalive: peer.persistent_keepalive,
                allowed_ips: peer.allowed_ips.clone(),
            })
            .collect(),
    }
}
