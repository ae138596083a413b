//! Declared link configuration.
//!
//! These are the types an administrator writes in the declaration file and
//! the store hands to the reconciler. Wireguard keys and endpoints stay in
//! their text form here; they are parsed when a patch is built.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::kind::LinkKind;
use crate::wireguard::codec::resolve_endpoint;
use crate::wireguard::{IpPrefix, WireguardKey};

/// Desired state of one network link.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpec {
    /// Interface name; unique among declared links.
    pub name: String,
    /// Software-defined link (bond, vlan, wireguard) rather than hardware.
    #[serde(default)]
    pub logical: bool,
    #[serde(default)]
    pub kind: LinkKind,
    /// ARPHRD type code; defaults to the usual type for `kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<u16>,
    #[serde(default)]
    pub up: bool,
    /// 0 leaves the MTU unmanaged.
    #[serde(default)]
    pub mtu: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wireguard: Option<WireguardSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bond_master: Option<BondSettings>,
    /// Creation-time VLAN settings; a mismatch forces recreation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<VlanSettings>,
    /// Name of the bond this link is enslaved to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,
}

impl LinkSpec {
    pub fn new(name: impl Into<String>, kind: LinkKind) -> Self {
        Self {
            name: name.into(),
            kind,
            ..Default::default()
        }
    }

    /// The declared type code, or the kind's default if it has one.
    pub fn link_type(&self) -> Option<u16> {
        self.link_type
            .or(self.kind.behavior().default_link_type)
    }

    /// Check everything that can be checked without the kernel.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > 15 {
            return Err(Error::Config(format!(
                "invalid interface name {:?}",
                self.name
            )));
        }
        if self.master.as_deref() == Some(self.name.as_str()) {
            return Err(Error::Config(format!("{} cannot be its own master", self.name)));
        }
        if let Some(wg) = &self.wireguard {
            if self.kind != LinkKind::Wireguard {
                return Err(Error::Config(format!(
                    "{} has wireguard settings but kind {}",
                    self.name, self.kind
                )));
            }
            wg.validate()?;
        }
        if let Some(bond) = &self.bond_master {
            if self.kind != LinkKind::Bond {
                return Err(Error::Config(format!(
                    "{} has bond settings but kind {}",
                    self.name, self.kind
                )));
            }
            bond.validate()?;
        }
        if let Some(vlan) = &self.vlan {
            if self.kind != LinkKind::Vlan {
                return Err(Error::Config(format!(
                    "{} has vlan settings but kind {}",
                    self.name, self.kind
                )));
            }
            if vlan.vid == 0 || vlan.vid > 4094 {
                return Err(Error::Config(format!("{}: invalid vlan id {}", self.name, vlan.vid)));
            }
        }
        Ok(())
    }
}

/// Declared wireguard device configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireguardSpec {
    /// Base64 private key.
    pub private_key: String,
    /// Base64 public key; only filled in status views.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub public_key: String,
    /// 0 is a real port (kernel picks one), not "unset".
    pub listen_port: u16,
    pub firewall_mark: u32,
    pub peers: Vec<WireguardPeer>,
}

/// Declared wireguard peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireguardPeer {
    pub public_key: String,
    /// Empty means no preshared key.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub preshared_key: String,
    /// `ip:port` or `host:port`; empty means roaming.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
    /// Seconds between keepalives; 0 disables them.
    pub persistent_keepalive: u16,
    pub allowed_ips: Vec<IpPrefix>,
}

impl WireguardSpec {
    /// Order peers by public key and each peer's allowed IPs, so that two
    /// specs describing the same device compare equal.
    pub fn sort(&mut self) {
        self.peers
            .sort_by(|a, b| a.public_key.cmp(&b.public_key));
        for peer in &mut self.peers {
            peer.allowed_ips.sort();
            peer.allowed_ips.dedup();
        }
    }

    /// The configuration part of the spec (status-only fields cleared).
    pub fn config_view(&self) -> Self {
        Self {
            public_key: String::new(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.private_key.parse::<WireguardKey>()?;

        let mut seen = HashSet::new();
        for peer in &self.peers {
            peer.public_key.parse::<WireguardKey>()?;
            if !seen.insert(peer.public_key.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate wireguard peer {}",
                    peer.public_key
                )));
            }
            if !peer.preshared_key.is_empty() {
                peer.preshared_key.parse::<WireguardKey>()?;
            }
            if !peer.endpoint.is_empty() {
                resolve_endpoint(&peer.endpoint)?;
            }
        }
        Ok(())
    }
}

/// Bonding mode (`IFLA_BOND_MODE`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BondMode {
    #[default]
    #[serde(rename = "balance-rr")]
    BalanceRr = 0,
    #[serde(rename = "active-backup")]
    ActiveBackup = 1,
    #[serde(rename = "balance-xor")]
    BalanceXor = 2,
    #[serde(rename = "broadcast")]
    Broadcast = 3,
    #[serde(rename = "802.3ad")]
    Lacp = 4,
    #[serde(rename = "balance-tlb")]
    BalanceTlb = 5,
    #[serde(rename = "balance-alb")]
    BalanceAlb = 6,
}

impl BondMode {
    pub fn from_u8(mode: u8) -> Option<Self> {
        Some(match mode {
            0 => Self::BalanceRr,
            1 => Self::ActiveBackup,
            2 => Self::BalanceXor,
            3 => Self::Broadcast,
            4 => Self::Lacp,
            5 => Self::BalanceTlb,
            6 => Self::BalanceAlb,
            _ => return None,
        })
    }
}

/// Bond master settings.
///
/// The kernel only accepts most of these while the bond is down and has no
/// members.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondSettings {
    #[serde(default)]
    pub mode: BondMode,
    /// Link monitoring interval in milliseconds.
    #[serde(default, alias = "miimon")]
    pub mii_monitor: u32,
    #[serde(default, alias = "updelay")]
    pub up_delay: u32,
    #[serde(default, alias = "downdelay")]
    pub down_delay: u32,
}

impl BondSettings {
    /// The bonding driver refuses delays without link monitoring and
    /// rounds them down to a multiple of the monitoring interval. Settings
    /// it would not store verbatim never read back equal.
    pub fn validate(&self) -> Result<()> {
        for (name, delay) in [("updelay", self.up_delay), ("downdelay", self.down_delay)] {
            if delay == 0 {
                continue;
            }
            if self.mii_monitor == 0 {
                return Err(Error::Config(format!("bond {name} {delay} requires miimon")));
            }
            if delay % self.mii_monitor != 0 {
                return Err(Error::Config(format!(
                    "bond {name} {delay} is not a multiple of miimon {}",
                    self.mii_monitor
                )));
            }
        }
        Ok(())
    }
}

/// VLAN tag protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VlanProtocol {
    #[default]
    #[serde(rename = "802.1q")]
    Ieee8021q,
    #[serde(rename = "802.1ad")]
    Ieee8021ad,
}

impl VlanProtocol {
    pub fn ethertype(self) -> u16 {
        match self {
            Self::Ieee8021q => 0x8100,
            Self::Ieee8021ad => 0x88a8,
        }
    }

    pub fn from_ethertype(ethertype: u16) -> Option<Self> {
        match ethertype {
            0x8100 => Some(Self::Ieee8021q),
            0x88a8 => Some(Self::Ieee8021ad),
            _ => None,
        }
    }
}

/// VLAN settings; fixed when the link is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanSettings {
    pub vid: u16,
    #[serde(default)]
    pub protocol: VlanProtocol,
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE=";
    const KEY_B: &str = "AgICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgI=";

    fn peer(key: &str, ips: &[&str]) -> WireguardPeer {
        WireguardPeer {
            public_key: key.into(),
            allowed_ips: ips.iter().map(|ip| ip.parse().unwrap()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn deserializes_from_yaml() {
        let yaml = r#"
name: wg0
logical: true
kind: wireguard
up: true
mtu: 1420
wireguard:
  private_key: AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE=
  listen_port: 51820
  peers:
    - public_key: AgICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgI=
      endpoint: 192.0.2.1:51820
      persistent_keepalive: 25
      allowed_ips: [10.0.0.0/24, fd00::/64]
"#;
        let spec: LinkSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.kind, LinkKind::Wireguard);
        assert_eq!(spec.link_type(), Some(libc::ARPHRD_NONE));
        let wg = spec.wireguard.as_ref().unwrap();
        assert_eq!(wg.listen_port, 51820);
        assert_eq!(wg.peers[0].allowed_ips.len(), 2);
        assert_eq!(wg.peers[0].persistent_keepalive, 25);
        spec.validate().unwrap();
    }

    #[test]
    fn bond_and_vlan_settings() {
        let yaml = r#"
- name: bond0
  logical: true
  kind: bond
  bond_master: { mode: 802.3ad, miimon: 100 }
- name: bond0.10
  logical: true
  kind: vlan
  vlan: { vid: 10, protocol: 802.1ad }
  master: bond0
"#;
        let specs: Vec<LinkSpec> = serde_yaml::from_str(yaml).unwrap();
        let bond = specs[0].bond_master.unwrap();
        assert_eq!(bond.mode, BondMode::Lacp);
        assert_eq!(bond.mii_monitor, 100);
        assert_eq!(specs[1].vlan.unwrap().protocol, VlanProtocol::Ieee8021ad);
        assert_eq!(specs[1].master.as_deref(), Some("bond0"));
        assert_eq!(specs[1].link_type(), Some(libc::ARPHRD_ETHER));
    }

    #[test]
    fn sort_orders_peers_and_prefixes() {
        let mut wg = WireguardSpec {
            peers: vec![
                peer(KEY_B, &["10.0.2.0/24", "10.0.1.0/24"]),
                peer(KEY_A, &["fd00::/64", "10.0.0.0/8"]),
            ],
            ..Default::default()
        };
        wg.sort();
        assert_eq!(wg.peers[0].public_key, KEY_A);
        assert_eq!(wg.peers[0].allowed_ips[0].to_string(), "10.0.0.0/8");
        assert_eq!(wg.peers[1].allowed_ips[0].to_string(), "10.0.1.0/24");
    }

    #[test]
    fn validate_rejects_bad_declarations() {
        let mut spec = LinkSpec::new("wg0", LinkKind::Wireguard);
        spec.wireguard = Some(WireguardSpec {
            private_key: "short".into(),
            ..Default::default()
        });
        assert!(matches!(spec.validate(), Err(Error::InvalidKey(_))));

        spec.wireguard = Some(WireguardSpec {
            private_key: KEY_A.into(),
            peers: vec![peer(KEY_B, &[]), peer(KEY_B, &[])],
            ..Default::default()
        });
        assert!(matches!(spec.validate(), Err(Error::Config(_))));

        let mut vlan = LinkSpec::new("eth0.5000", LinkKind::Vlan);
        vlan.vlan = Some(VlanSettings {
            vid: 5000,
            ..Default::default()
        });
        assert!(vlan.validate().is_err());

        let mut bond = LinkSpec::new("eth0", LinkKind::Physical);
        bond.bond_master = Some(BondSettings::default());
        assert!(bond.validate().is_err());

        assert!(LinkSpec::new("a-very-long-interface", LinkKind::Physical)
            .validate()
            .is_err());
    }

    #[test]
    fn bond_delays_follow_miimon() {
        let mut bond = LinkSpec::new("bond0", LinkKind::Bond);
        bond.bond_master = Some(BondSettings {
            mode: BondMode::ActiveBackup,
            ..Default::default()
        });
        bond.validate().unwrap();

        let unmonitored = BondSettings {
            up_delay: 200,
            ..Default::default()
        };
        assert!(matches!(unmonitored.validate(), Err(Error::Config(_))));

        let rounded = BondSettings {
            mii_monitor: 100,
            up_delay: 150,
            ..Default::default()
        };
        assert!(matches!(rounded.validate(), Err(Error::Config(_))));
        bond.bond_master = Some(rounded);
        assert!(bond.validate().is_err());

        BondSettings {
            mii_monitor: 100,
            up_delay: 200,
            down_delay: 300,
            ..Default::default()
        }
        .validate()
        .unwrap();
    }

    #[test]
    fn ethertypes() {
        assert_eq!(VlanProtocol::from_ethertype(0x8100), Some(VlanProtocol::Ieee8021q));
        assert_eq!(VlanProtocol::Ieee8021ad.ethertype(), 0x88a8);
        assert_eq!(VlanProtocol::from_ethertype(0x0800), None);
        assert_eq!(BondMode::from_u8(6), Some(BondMode::BalanceAlb));
        assert_eq!(BondMode::from_u8(7), None);
    }
}
