//! The link reconciler.
//!
//! One cycle lists the declared links, pins a finalizer on every Running item,
//! snapshots the kernel link table and then syncs the items one after the
//! other. The snapshot is handed from item to item and reloaded whenever a
//! link is created or deleted. Item failures are collected and reported
//! together once every item has been visited.

use std::future::Future;
use std::sync::Arc;

use tracing::{Instrument, debug, info, warn};

use crate::error::{CycleError, Error, Result, ResultExt};
use crate::events::Wake;
use crate::kernel::{KernelLink, LinkHandle, LinkInfoData, LinkModify, LinkSnapshot, NewLink};
use crate::kind::{LinkKind, SettingsSync};
use crate::netlink;
use crate::runtime::{LinkItem, LinkRefresh, Phase, Runtime};
use crate::spec::LinkSpec;
use crate::wireguard::{WireguardClient, codec};

/// Finalizer owner used when none is configured.
pub const DEFAULT_OWNER: &str = "linkd";

/// Drives declared links toward kernel state.
pub struct LinkReconciler {
    runtime: Arc<dyn Runtime>,
    links: Arc<dyn LinkHandle>,
    wireguard: Option<Arc<dyn WireguardClient>>,
    owner: String,
}

impl LinkReconciler {
    pub fn new(runtime: Arc<dyn Runtime>, links: Arc<dyn LinkHandle>) -> Self {
        Self {
            runtime,
            links,
            wireguard: None,
            owner: DEFAULT_OWNER.to_string(),
        }
    }

    /// Use `client` for wireguard device configuration. Without one, every
    /// declared wireguard link fails to sync.
    pub fn with_wireguard(mut self, client: Arc<dyn WireguardClient>) -> Self {
        self.wireguard = Some(client);
        self
    }

    /// Name under which finalizers are held.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Reconcile on every wake until `shutdown` resolves or the wake source
    /// closes. A failed cycle ends the loop with its error.
    pub async fn run(&self, wake: &mut Wake, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    debug!("reconciler stopping");
                    return Ok(());
                }
                woke = wake.recv() => {
                    if woke.is_none() {
                        debug!("wake sources closed");
                        return Ok(());
                    }
                }
            }

            self.reconcile().await?;
        }
    }

    /// Run one full cycle.
    pub async fn reconcile(&self) -> Result<()> {
        let items = self.runtime.list().await.context("listing declared links")?;

        for item in items.iter().filter(|item| item.phase == Phase::Running) {
            self.runtime
                .add_finalizer(item.id(), &self.owner)
                .await
                .with_context(|| format!("adding finalizer to {}", item.id()))?;
        }

        let mut snapshot = LinkSnapshot::load(self.links.as_ref())
            .await
            .context("listing kernel links")?;

        let mut errors = CycleError::new();
        for item in &items {
            let span = tracing::info_span!("link", link = %item.id(), kind = %item.spec.kind);
            let (next, result) = self.sync_item(snapshot, item).instrument(span).await;
            snapshot = next;
            if let Err(e) = result {
                warn!(link = %item.id(), error = %e, "link sync failed");
                errors.push(item.id(), e);
            }
        }
        errors.into_result()?;

        debug!(links = items.len(), "cycle complete");
        self.runtime.reset_restart_backoff();
        Ok(())
    }

    /// Sync one item against `snapshot`, returning the (possibly refreshed)
    /// snapshot for the next item.
    pub async fn sync_item(
        &self,
        mut snapshot: LinkSnapshot,
        item: &LinkItem,
    ) -> (LinkSnapshot, Result<()>) {
        let result = match item.phase {
            Phase::Running => self.sync_running(&mut snapshot, &item.spec).await,
            Phase::TearingDown => self.sync_teardown(&mut snapshot, item).await,
        };
        (snapshot, result)
    }

    async fn sync_teardown(&self, snapshot: &mut LinkSnapshot, item: &LinkItem) -> Result<()> {
        let spec = &item.spec;
        if spec.logical {
            if let Some(link) = snapshot.find(&spec.name) {
                let index = link.index;
                info!(index, "deleting link");
                self.links.delete(index).await.context("deleting link")?;
                self.refresh(snapshot).await?;
            }
        }

        self.runtime
            .remove_finalizer(item.id(), &self.owner)
            .await
            .context("removing finalizer")
    }

    async fn sync_running(&self, snapshot: &mut LinkSnapshot, spec: &LinkSpec) -> Result<()> {
        let behavior = spec.kind.behavior();
        let mut existing = snapshot.find(&spec.name).cloned();

        if spec.logical {
            if let Some(link) = &existing {
                if link.kind.is_none() {
                    warn!("kernel reports no kind for link yet, skipping");
                    return Ok(());
                }
                if needs_replacement(spec, link) {
                    info!(
                        index = link.index,
                        have = link.kind.as_deref().unwrap_or_default(),
                        have_type = link.link_type,
                        "link kind or type changed, deleting"
                    );
                    self.links.delete(link.index).await.context("deleting replaced link")?;
                    self.refresh(snapshot).await?;
                    existing = None;
                }
            }
        }

        let mut link = match existing {
            Some(link) => link,
            None if !spec.logical => {
                debug!("physical link not present");
                return Ok(());
            }
            None if !behavior.creatable => {
                debug!("logical link not present, waiting for its owner to create it");
                return Ok(());
            }
            None => self.create(snapshot, spec).await?,
        };

        match behavior.settings {
            SettingsSync::Wireguard => self.sync_wireguard(spec).await?,
            SettingsSync::BondMaster => link = self.sync_bond_master(snapshot, spec, link).await?,
            SettingsSync::None => {}
        }

        self.sync_membership(snapshot, spec, &mut link).await?;
        self.sync_up(snapshot, spec, &mut link).await?;
        self.sync_mtu(snapshot, spec, &link).await
    }

    async fn create(&self, snapshot: &mut LinkSnapshot, spec: &LinkSpec) -> Result<KernelLink> {
        let new = NewLink {
            name: spec.name.clone(),
            link_type: spec.link_type().unwrap_or(libc::ARPHRD_NONE),
            kind: spec.kind.as_str().to_string(),
        };
        info!(link_type = new.link_type, "creating link");
        match self.links.create(&new).await {
            // created since the snapshot was taken; take it from the next one
            Err(Error::Netlink(e)) if e.is_already_exists() => {
                debug!("link appeared before create");
            }
            other => other.context("creating link")?,
        }
        self.refresh(snapshot).await?;

        snapshot
            .find(&spec.name)
            .cloned()
            .ok_or_else(|| Error::CreatedLinkMissing {
                name: spec.name.clone(),
            })
    }

    async fn sync_wireguard(&self, spec: &LinkSpec) -> Result<()> {
        let client = self
            .wireguard
            .as_ref()
            .ok_or_else(|| Error::WireguardUnavailable {
                link: spec.name.clone(),
            })?;
        let Some(declared) = &spec.wireguard else {
            debug!("no wireguard settings declared");
            return Ok(());
        };

        let device = client
            .device(&spec.name)
            .await
            .context("reading wireguard device")?;

        let mut existing = codec::decode(&device, false);
        let mut desired = declared.config_view();
        existing.sort();
        desired.sort();
        if existing == desired {
            debug!("wireguard device in sync");
            return Ok(());
        }

        let patch = codec::encode(&desired, &existing)?;
        info!(
            peers = patch.peers.len(),
            private_key = patch.private_key.is_some(),
            listen_port = ?patch.listen_port,
            "configuring wireguard device"
        );
        client
            .configure(&spec.name, &patch)
            .await
            .context("configuring wireguard device")?;

        self.runtime
            .modify_refresh(LinkKind::Wireguard.as_str(), &|refresh: &mut LinkRefresh| {
                refresh.bump()
            })
            .await
            .context("bumping wireguard refresh")
    }

    /// Apply bond settings the kernel only accepts on a bond that is down
    /// and has no members: release members, bring the bond down, apply. The
    /// bond comes back up in the up/down step; members are re-enslaved by
    /// their own items, possibly in a later cycle.
    async fn sync_bond_master(
        &self,
        snapshot: &mut LinkSnapshot,
        spec: &LinkSpec,
        link: KernelLink,
    ) -> Result<KernelLink> {
        let Some(desired) = spec.bond_master else {
            return Ok(link);
        };
        if link.info == LinkInfoData::Bond(desired) {
            return Ok(link);
        }
        desired.validate()?;

        let members: Vec<(u32, String)> = snapshot
            .members_of(link.index)
            .map(|member| (member.index, member.name.clone()))
            .collect();
        for (index, name) in members {
            info!(member = %name, "releasing bond member");
            self.links
                .modify(index, &LinkModify::master(0))
                .await
                .with_context(|| format!("releasing bond member {name}"))?;
        }
        if link.is_up() {
            self.links
                .modify(link.index, &LinkModify::up(false))
                .await
                .context("bringing bond down")?;
        }

        info!(mode = ?desired.mode, miimon = desired.mii_monitor, "applying bond settings");
        self.links
            .modify(link.index, &LinkModify::bond(desired))
            .await
            .context("applying bond settings")?;
        self.refresh(snapshot).await?;

        snapshot.find(&spec.name).cloned().ok_or_else(|| {
            Error::from(netlink::Error::InterfaceNotFound {
                name: spec.name.clone(),
            })
        })
    }

    /// Enslave the link to its declared master. A master that does not
    /// exist yet is retried on a later cycle; an undeclared master leaves
    /// any existing membership alone.
    async fn sync_membership(
        &self,
        snapshot: &mut LinkSnapshot,
        spec: &LinkSpec,
        link: &mut KernelLink,
    ) -> Result<()> {
        let Some(master_name) = &spec.master else {
            return Ok(());
        };
        let Some(master) = snapshot.find(master_name) else {
            debug!(master = %master_name, "master link not present yet");
            return Ok(());
        };
        let master_index = master.index;
        if link.master == Some(master_index) {
            return Ok(());
        }

        // bonding refuses to enslave a running link
        if link.is_up() {
            self.links
                .modify(link.index, &LinkModify::up(false))
                .await
                .context("bringing link down for enslaving")?;
            link.flags &= !(libc::IFF_UP as u32);
        }
        info!(master = %master_name, "enslaving link");
        self.links
            .modify(link.index, &LinkModify::master(master_index))
            .await
            .with_context(|| format!("enslaving to {master_name}"))?;

        link.master = Some(master_index);
        if let Some(entry) = snapshot.find_mut(&spec.name) {
            entry.master = Some(master_index);
            entry.flags = link.flags;
        }
        Ok(())
    }

    async fn sync_up(
        &self,
        snapshot: &mut LinkSnapshot,
        spec: &LinkSpec,
        link: &mut KernelLink,
    ) -> Result<()> {
        if link.is_up() == spec.up {
            return Ok(());
        }

        info!(up = spec.up, "setting link state");
        self.links
            .modify(link.index, &LinkModify::up(spec.up))
            .await
            .context("setting link up/down")?;

        let iff_up = libc::IFF_UP as u32;
        link.flags = if spec.up {
            link.flags | iff_up
        } else {
            link.flags & !iff_up
        };
        if let Some(entry) = snapshot.find_mut(&spec.name) {
            entry.flags = link.flags;
        }
        Ok(())
    }

    async fn sync_mtu(
        &self,
        snapshot: &mut LinkSnapshot,
        spec: &LinkSpec,
        link: &KernelLink,
    ) -> Result<()> {
        if spec.mtu == 0 || spec.mtu == link.mtu {
            return Ok(());
        }

        info!(mtu = spec.mtu, old = link.mtu, "setting mtu");
        self.links
            .modify(link.index, &LinkModify::mtu(spec.mtu))
            .await
            .context("setting mtu")?;

        if let Some(entry) = snapshot.find_mut(&spec.name) {
            entry.mtu = spec.mtu;
        }
        Ok(())
    }

    async fn refresh(&self, snapshot: &mut LinkSnapshot) -> Result<()> {
        *snapshot = LinkSnapshot::load(self.links.as_ref())
            .await
            .context("refreshing kernel links")?;
        Ok(())
    }
}

/// Kind and type are fixed when a link is created, and so is the info of
/// kinds marked immutable (VLAN id and protocol). A difference in any of
/// them means the link has to be recreated. A type that is neither declared
/// nor known for the kind is not compared.
fn needs_replacement(spec: &LinkSpec, link: &KernelLink) -> bool {
    if link.kind.as_deref() != spec.kind.kernel_kind() {
        return true;
    }
    if spec.link_type().is_some_and(|ty| ty != link.link_type) {
        return true;
    }
    if !spec.kind.behavior().immutable_info {
        return false;
    }
    match (&spec.vlan, &link.info) {
        (Some(desired), LinkInfoData::Vlan(actual)) => desired != actual,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{VlanProtocol, VlanSettings};

    fn kernel(name: &str, kind: &str, link_type: u16) -> KernelLink {
        KernelLink {
            index: 9,
            name: name.into(),
            link_type,
            kind: Some(kind.into()),
            ..Default::default()
        }
    }

    #[test]
    fn replacement_on_kind_or_type_change() {
        let mut spec = LinkSpec::new("link0", LinkKind::Wireguard);
        spec.logical = true;

        assert!(!needs_replacement(&spec, &kernel("link0", "wireguard", libc::ARPHRD_NONE)));
        assert!(needs_replacement(&spec, &kernel("link0", "bond", libc::ARPHRD_NONE)));
        assert!(needs_replacement(&spec, &kernel("link0", "wireguard", libc::ARPHRD_ETHER)));
    }

    #[test]
    fn foreign_kind_type_only_checked_when_declared() {
        let mut spec = LinkSpec::new("tun0", LinkKind::Other("ipip".into()));
        spec.logical = true;
        assert!(!needs_replacement(&spec, &kernel("tun0", "ipip", libc::ARPHRD_TUNNEL)));

        spec.link_type = Some(libc::ARPHRD_TUNNEL);
        assert!(!needs_replacement(&spec, &kernel("tun0", "ipip", libc::ARPHRD_TUNNEL)));
        assert!(needs_replacement(&spec, &kernel("tun0", "ipip", libc::ARPHRD_SIT)));
    }

    #[test]
    fn replacement_on_vlan_change() {
        let mut spec = LinkSpec::new("eth0.10", LinkKind::Vlan);
        spec.logical = true;
        spec.vlan = Some(VlanSettings {
            vid: 10,
            protocol: VlanProtocol::Ieee8021q,
        });

        let mut link = kernel("eth0.10", "vlan", libc::ARPHRD_ETHER);
        link.info = LinkInfoData::Vlan(VlanSettings {
            vid: 10,
            protocol: VlanProtocol::Ieee8021q,
        });
        assert!(!needs_replacement(&spec, &link));

        link.info = LinkInfoData::Vlan(VlanSettings {
            vid: 11,
            protocol: VlanProtocol::Ieee8021q,
        });
        assert!(needs_replacement(&spec, &link));

        // no parsed info: nothing to compare
        link.info = LinkInfoData::None;
        assert!(!needs_replacement(&spec, &link));
    }
}
