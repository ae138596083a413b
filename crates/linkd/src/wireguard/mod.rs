//! Wireguard device model and the declarative/imperative codec.
//!
//! Link creation goes through rtnetlink like any other link; keys, the
//! listen port and peers are read and written through a [`WireguardClient`]
//! (the `wireguard` generic netlink family in production). The [`codec`]
//! turns a declared [`WireguardSpec`](crate::spec::WireguardSpec) and the
//! decoded device state into a minimal [`DeviceConfig`] patch.

use async_trait::async_trait;

use crate::error::Result;

pub mod codec;
mod types;

pub use types::{DeviceConfig, DeviceState, IpPrefix, PeerConfig, PeerState, WG_KEY_LEN, WireguardKey};

/// Read and patch wireguard device configuration.
#[async_trait]
pub trait WireguardClient: Send + Sync {
    /// Current configuration of the device named `name`.
    async fn device(&self, name: &str) -> Result<DeviceState>;

    /// Apply a patch to the device named `name`.
    async fn configure(&self, name: &str, config: &DeviceConfig) -> Result<()>;
}
