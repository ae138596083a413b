//! In-memory stand-ins for the kernel and the wireguard family.
//!
//! `FakeKernel` keeps a link table and applies link operations the way
//! rtnetlink does, including the bonding driver's refusals (settings on a
//! running bond or one with members, delays without miimon, enslaving a
//! running link) and its rounding of delays to a multiple of miimon.
//! `FakeWireguard` keeps device state and applies patches to it.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use linkd::kernel::{KernelLink, LinkHandle, LinkInfoData, LinkModify, NewLink};
use linkd::spec::{BondSettings, WireguardPeer, WireguardSpec};
use linkd::wireguard::{DeviceConfig, DeviceState, PeerState, WireguardClient, WireguardKey};
use linkd::{Result, netlink};

/// A recorded link operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Create(String),
    Delete(String),
    Modify(String, LinkModify),
}

#[derive(Debug, Default)]
struct KernelState {
    links: Vec<KernelLink>,
    next_index: u32,
    ops: Vec<Op>,
    swallow_creates: bool,
    conflict_creates: bool,
}

impl KernelState {
    fn name_of(&self, index: u32) -> String {
        self.links
            .iter()
            .find(|l| l.index == index)
            .map(|l| l.name.clone())
            .unwrap_or_else(|| format!("#{index}"))
    }
}

#[derive(Debug, Default)]
pub struct FakeKernel {
    state: Mutex<KernelState>,
}

fn errno(errno: i32) -> linkd::Error {
    netlink::Error::from_errno(-errno).into()
}

impl FakeKernel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(KernelState {
                next_index: 1,
                ..Default::default()
            }),
        }
    }

    /// Add a link that exists before the controller starts.
    pub fn add(&self, mut link: KernelLink) -> u32 {
        let mut state = self.state.lock().unwrap();
        link.index = state.next_index;
        state.next_index += 1;
        let index = link.index;
        state.links.push(link);
        index
    }

    /// A physical ethernet link.
    pub fn add_physical(&self, name: &str, mtu: u32) -> u32 {
        self.add(KernelLink {
            name: name.into(),
            link_type: libc::ARPHRD_ETHER,
            mtu,
            ..Default::default()
        })
    }

    /// Accept creates without adding anything.
    pub fn swallow_creates(&self) {
        self.state.lock().unwrap().swallow_creates = true;
    }

    /// Add the link on create but report EEXIST, as when another creator
    /// gets there first.
    pub fn conflict_creates(&self) {
        self.state.lock().unwrap().conflict_creates = true;
    }

    pub fn link(&self, name: &str) -> Option<KernelLink> {
        self.state
            .lock()
            .unwrap()
            .links
            .iter()
            .find(|l| l.name == name)
            .cloned()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().unwrap().ops.clear();
    }
}

#[async_trait]
impl LinkHandle for FakeKernel {
    async fn list(&self) -> Result<Vec<KernelLink>> {
        Ok(self.state.lock().unwrap().links.clone())
    }

    async fn create(&self, new: &NewLink) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(Op::Create(new.name.clone()));
        if state.links.iter().any(|l| l.name == new.name) {
            return Err(errno(libc::EEXIST));
        }
        if state.swallow_creates {
            return Ok(());
        }

        let index = state.next_index;
        state.next_index += 1;
        let info = match new.kind.as_str() {
            "bond" => LinkInfoData::Bond(BondSettings::default()),
            _ => LinkInfoData::None,
        };
        state.links.push(KernelLink {
            index,
            name: new.name.clone(),
            link_type: new.link_type,
            kind: Some(new.kind.clone()),
            mtu: if new.kind == "wireguard" { 1420 } else { 1500 },
            info,
            ..Default::default()
        });
        if state.conflict_creates {
            return Err(errno(libc::EEXIST));
        }
        Ok(())
    }

    async fn delete(&self, index: u32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let name = state.name_of(index);
        state.ops.push(Op::Delete(name));
        state.links.retain(|l| l.index != index);
        for link in &mut state.links {
            if link.master == Some(index) {
                link.master = None;
            }
        }
        Ok(())
    }

    async fn modify(&self, index: u32, change: &LinkModify) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let name = state.name_of(index);
        state.ops.push(Op::Modify(name, change.clone()));

        let has_members = state.links.iter().any(|l| l.master == Some(index));
        let Some(link) = state.links.iter_mut().find(|l| l.index == index) else {
            return Err(errno(libc::ENODEV));
        };

        if let Some(mut bond) = change.bond {
            if link.is_up() || has_members {
                return Err(errno(libc::EBUSY));
            }
            if bond.mii_monitor == 0 {
                if bond.up_delay != 0 || bond.down_delay != 0 {
                    return Err(errno(libc::EPERM));
                }
            } else {
                bond.up_delay -= bond.up_delay % bond.mii_monitor;
                bond.down_delay -= bond.down_delay % bond.mii_monitor;
            }
            link.info = LinkInfoData::Bond(bond);
        }
        if let Some(master) = change.master {
            if master != 0 && link.is_up() {
                return Err(errno(libc::EBUSY));
            }
            link.master = (master != 0).then_some(master);
        }
        if let Some(mtu) = change.mtu {
            link.mtu = mtu;
        }
        link.flags = (link.flags & !change.change) | (change.flags & change.change);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct WireguardState {
    devices: HashMap<String, DeviceState>,
    patches: Vec<(String, DeviceConfig)>,
}

/// Wireguard devices keyed by link name. A device that was never
/// configured reads as an empty one.
#[derive(Debug, Default)]
pub struct FakeWireguard {
    state: Mutex<WireguardState>,
}

impl FakeWireguard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn patches(&self) -> Vec<(String, DeviceConfig)> {
        self.state.lock().unwrap().patches.clone()
    }

    pub fn device_state(&self, name: &str) -> DeviceState {
        self.state
            .lock()
            .unwrap()
            .devices
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_device(&self, name: &str, device: DeviceState) {
        self.state
            .lock()
            .unwrap()
            .devices
            .insert(name.to_string(), device);
    }
}

#[async_trait]
impl WireguardClient for FakeWireguard {
    async fn device(&self, name: &str) -> Result<DeviceState> {
        Ok(self.device_state(name))
    }

    async fn configure(&self, name: &str, config: &DeviceConfig) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.patches.push((name.to_string(), config.clone()));
        let device = state.devices.entry(name.to_string()).or_default();

        if let Some(key) = config.private_key {
            device.private_key = Some(key);
        }
        if let Some(port) = config.listen_port {
            device.listen_port = port;
        }
        if let Some(mark) = config.firewall_mark {
            device.firewall_mark = mark;
        }

        for entry in &config.peers {
            let pos = device
                .peers
                .iter()
                .position(|p| p.public_key == entry.public_key);
            if entry.remove {
                if let Some(pos) = pos {
                    device.peers.remove(pos);
                }
                continue;
            }

            let peer = match pos {
                Some(pos) => &mut device.peers[pos],
                None => {
                    device.peers.push(PeerState {
                        public_key: entry.public_key,
                        ..Default::default()
                    });
                    device.peers.last_mut().unwrap()
                }
            };
            if let Some(psk) = entry.preshared_key {
                peer.preshared_key = Some(psk);
            }
            if let Some(endpoint) = entry.endpoint {
                peer.endpoint = Some(endpoint);
            }
            if let Some(keepalive) = entry.persistent_keepalive {
                peer.persistent_keepalive = keepalive;
            }
            if entry.replace_allowed_ips {
                peer.allowed_ips.clear();
            }
            peer.allowed_ips.extend(entry.allowed_ips.iter().copied());
        }
        Ok(())
    }
}

/// Base64 text of a key made of `n` repeated.
pub fn key(n: u8) -> String {
    WireguardKey::from_bytes([n; 32]).to_string()
}

pub fn wg_peer(n: u8, allowed_ips: &[&str]) -> WireguardPeer {
    WireguardPeer {
        public_key: key(n),
        allowed_ips: allowed_ips.iter().map(|ip| ip.parse().unwrap()).collect(),
        ..Default::default()
    }
}

pub fn wg_spec(private: u8, listen_port: u16, peers: Vec<WireguardPeer>) -> WireguardSpec {
    WireguardSpec {
        private_key: key(private),
        listen_port,
        peers,
        ..Default::default()
    }
}
