//! Wireguard key, prefix and device types.

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Size of a wireguard key in bytes.
pub const WG_KEY_LEN: usize = 32;

/// A 32-byte wireguard key (private, public or preshared).
///
/// The text form is standard base64, as printed by `wg`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WireguardKey([u8; WG_KEY_LEN]);

impl WireguardKey {
    /// The all-zero key; as a preshared key it means "none".
    pub const ZERO: Self = Self([0; WG_KEY_LEN]);

    pub const fn from_bytes(bytes: [u8; WG_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; WG_KEY_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; WG_KEY_LEN]
    }
}

impl FromStr for WireguardKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(s.trim())
            .map_err(|e| Error::InvalidKey(format!("{s:?}: {e}")))?;
        let bytes: [u8; WG_KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            Error::InvalidKey(format!("{s:?}: expected {WG_KEY_LEN} bytes, got {}", b.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for WireguardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.0))
    }
}

// Private keys end up in patches; keep them out of debug logs.
impl fmt::Debug for WireguardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            f.write_str("WireguardKey(zero)")
        } else {
            f.write_str("WireguardKey(..)")
        }
    }
}

/// An allowed-IP prefix such as `10.0.0.0/24`.
///
/// Host bits are cleared on construction so a declared `10.0.0.1/24`
/// compares equal to the `10.0.0.0/24` the kernel reports back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpPrefix {
    addr: IpAddr,
    len: u8,
}

impl IpPrefix {
    pub fn new(addr: IpAddr, len: u8) -> Result<Self> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if len > max {
            return Err(Error::InvalidPrefix(format!("{addr}/{len}")));
        }
        Ok(Self {
            addr: mask(addr, len),
            len,
        })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    /// Address family (`AF_INET` or `AF_INET6`).
    pub fn family(&self) -> u16 {
        match self.addr {
            IpAddr::V4(_) => libc::AF_INET as u16,
            IpAddr::V6(_) => libc::AF_INET6 as u16,
        }
    }

    pub fn addr_bytes(&self) -> Vec<u8> {
        match self.addr {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        }
    }
}

fn mask(addr: IpAddr, len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let masked = bits & u32::MAX.checked_shl(32 - u32::from(len)).unwrap_or(0);
            IpAddr::V4(Ipv4Addr::from(masked))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let masked = bits & u128::MAX.checked_shl(128 - u32::from(len)).unwrap_or(0);
            IpAddr::V6(Ipv6Addr::from(masked))
        }
    }
}

impl Ord for IpPrefix {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr
            .cmp(&other.addr)
            .then_with(|| self.len.cmp(&other.len))
    }
}

impl PartialOrd for IpPrefix {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for IpPrefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidPrefix(s.to_string());
        let (addr, len) = match s.split_once('/') {
            Some((addr, len)) => {
                let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
                (addr, len.parse::<u8>().map_err(|_| invalid())?)
            }
            // a bare address is a host route
            None => {
                let addr: IpAddr = s.parse().map_err(|_| invalid())?;
                let len = if addr.is_ipv4() { 32 } else { 128 };
                (addr, len)
            }
        };
        Self::new(addr, len).map_err(|_| invalid())
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl Serialize for IpPrefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpPrefix {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Device configuration as reported by the kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
    pub private_key: Option<WireguardKey>,
    pub public_key: Option<WireguardKey>,
    pub listen_port: u16,
    pub firewall_mark: u32,
    pub peers: Vec<PeerState>,
}

/// One peer as reported by the kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerState {
    pub public_key: WireguardKey,
    /// Reported as the zero key when none is configured.
    pub preshared_key: Option<WireguardKey>,
    pub endpoint: Option<SocketAddr>,
    /// Seconds; 0 disables keepalives.
    pub persistent_keepalive: u16,
    pub allowed_ips: Vec<IpPrefix>,
}

/// Imperative patch applied with `WG_CMD_SET_DEVICE`.
///
/// Unset fields are left untouched by the kernel; peers not named in
/// `peers` are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceConfig {
    pub private_key: Option<WireguardKey>,
    pub listen_port: Option<u16>,
    pub firewall_mark: Option<u32>,
    pub peers: Vec<PeerConfig>,
}

impl DeviceConfig {
    /// True when applying the patch would change nothing.
    pub fn is_empty(&self) -> bool {
        self.private_key.is_none()
            && self.listen_port.is_none()
            && self.firewall_mark.is_none()
            && self.peers.is_empty()
    }
}

/// Add, replace or remove entry for one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConfig {
    pub public_key: WireguardKey,
    /// Remove the peer; every other field is ignored.
    pub remove: bool,
    pub preshared_key: Option<WireguardKey>,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive: Option<u16>,
    /// Replace the allowed-IP set instead of adding to it.
    pub replace_allowed_ips: bool,
    pub allowed_ips: Vec<IpPrefix>,
}

impl PeerConfig {
    pub fn removal(public_key: WireguardKey) -> Self {
        Self {
            public_key,
            remove: true,
            ..Default::default()
        }
    }
}
