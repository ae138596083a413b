//! Kernel link view and the link management seam.

use async_trait::async_trait;

use crate::error::Result;
use crate::spec::{BondSettings, VlanSettings};

/// Kind-specific link info parsed from `IFLA_INFO_DATA`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LinkInfoData {
    #[default]
    None,
    Bond(BondSettings),
    Vlan(VlanSettings),
}

/// A network interface as reported by the kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelLink {
    pub index: u32,
    pub name: String,
    /// ARPHRD type code.
    pub link_type: u16,
    /// `IFLA_INFO_KIND`; `None` when the kernel sent no link info.
    pub kind: Option<String>,
    pub flags: u32,
    pub mtu: u32,
    /// Index of the bond (or bridge) this link is enslaved to.
    pub master: Option<u32>,
    pub info: LinkInfoData,
}

impl KernelLink {
    pub fn is_up(&self) -> bool {
        self.flags & libc::IFF_UP as u32 != 0
    }
}

/// Parameters for creating a logical link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLink {
    pub name: String,
    pub link_type: u16,
    pub kind: String,
}

/// A partial link modification. Only set fields are applied; `flags` is
/// applied under the `change` mask.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkModify {
    pub flags: u32,
    pub change: u32,
    pub mtu: Option<u32>,
    /// Master index; 0 releases the link from its master.
    pub master: Option<u32>,
    pub bond: Option<BondSettings>,
}

impl LinkModify {
    /// Set or clear `IFF_UP` and nothing else.
    pub fn up(up: bool) -> Self {
        let iff_up = libc::IFF_UP as u32;
        Self {
            flags: if up { iff_up } else { 0 },
            change: iff_up,
            ..Default::default()
        }
    }

    pub fn mtu(mtu: u32) -> Self {
        Self {
            mtu: Some(mtu),
            ..Default::default()
        }
    }

    pub fn master(index: u32) -> Self {
        Self {
            master: Some(index),
            ..Default::default()
        }
    }

    pub fn bond(settings: BondSettings) -> Self {
        Self {
            bond: Some(settings),
            ..Default::default()
        }
    }
}

/// Link management operations (rtnetlink in production).
#[async_trait]
pub trait LinkHandle: Send + Sync {
    /// All links in kernel order.
    async fn list(&self) -> Result<Vec<KernelLink>>;

    async fn create(&self, link: &NewLink) -> Result<()>;

    /// Delete a link by index; a missing link is not an error.
    async fn delete(&self, index: u32) -> Result<()>;

    async fn modify(&self, index: u32, change: &LinkModify) -> Result<()>;
}

/// The kernel's link table as seen by one reconcile cycle.
///
/// Passed by value through each item sync and refreshed after any create or
/// delete so later items see the change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkSnapshot {
    links: Vec<KernelLink>,
}

impl LinkSnapshot {
    pub fn new(links: Vec<KernelLink>) -> Self {
        Self { links }
    }

    /// Take a fresh snapshot.
    pub async fn load(handle: &(impl LinkHandle + ?Sized)) -> Result<Self> {
        Ok(Self::new(handle.list().await?))
    }

    pub fn links(&self) -> &[KernelLink] {
        &self.links
    }

    pub fn find(&self, name: &str) -> Option<&KernelLink> {
        find_link(&self.links, name)
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut KernelLink> {
        self.links.iter_mut().find(|link| link.name == name)
    }

    /// Links enslaved to `master`.
    pub fn members_of(&self, master: u32) -> impl Iterator<Item = &KernelLink> {
        self.links
            .iter()
            .filter(move |link| link.master == Some(master))
    }
}

/// Look up a link by name.
pub fn find_link<'a>(links: &'a [KernelLink], name: &str) -> Option<&'a KernelLink> {
    links.iter().find(|link| link.name == name)
}
