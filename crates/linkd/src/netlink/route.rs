//! rtnetlink link operations.
//!
//! [`RouteConnection`] is the kernel-backed [`LinkHandle`]: it dumps the link
//! table, creates and deletes logical links and applies masked modifications.

use async_trait::async_trait;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::attr::{AttrIter, get};
use super::builder::MessageBuilder;
use super::error::{Error, Result};
use super::message::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REQUEST, RTM_DELLINK, RTM_GETLINK,
    RTM_NEWLINK,
};
use super::socket::{NetlinkSocket, Protocol};
use crate::kernel::{KernelLink, LinkHandle, LinkInfoData, LinkModify, NewLink};
use crate::spec::{BondMode, BondSettings, VlanProtocol, VlanSettings};

/// IFLA_* attribute IDs.
mod ifla {
    pub const IFNAME: u16 = 3;
    pub const MTU: u16 = 4;
    pub const MASTER: u16 = 10;
    pub const LINKINFO: u16 = 18;

    pub const INFO_KIND: u16 = 1;
    pub const INFO_DATA: u16 = 2;

    pub const VLAN_ID: u16 = 1;
    pub const VLAN_PROTOCOL: u16 = 5;

    pub const BOND_MODE: u16 = 1;
    pub const BOND_MIIMON: u16 = 3;
    pub const BOND_UPDELAY: u16 = 4;
    pub const BOND_DOWNDELAY: u16 = 5;
}

/// Interface info message header (mirrors struct ifinfomsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IfInfoMsg {
    pub ifi_family: u8,
    pub ifi_pad: u8,
    pub ifi_type: u16,
    pub ifi_index: i32,
    pub ifi_flags: u32,
    pub ifi_change: u32,
}

impl IfInfoMsg {
    fn for_index(index: u32) -> Self {
        Self {
            ifi_index: index as i32,
            ..Default::default()
        }
    }
}

/// rtnetlink connection used for link management.
pub struct RouteConnection {
    socket: NetlinkSocket,
}

impl RouteConnection {
    pub fn new() -> Result<Self> {
        Ok(Self {
            socket: NetlinkSocket::new(Protocol::Route)?,
        })
    }

    /// Dump every link known to the kernel, in kernel (index) order.
    pub async fn get_links(&self) -> Result<Vec<KernelLink>> {
        let mut builder = MessageBuilder::new(RTM_GETLINK, NLM_F_REQUEST | NLM_F_DUMP);
        builder.append(&IfInfoMsg::default());

        let replies = self.socket.dump(builder).await?;
        let mut links = Vec::with_capacity(replies.len());
        for payload in &replies {
            match parse_link(payload) {
                Ok(link) => links.push(link),
                Err(e) => tracing::debug!(error = %e, "skipping unparsable link message"),
            }
        }
        Ok(links)
    }

    pub async fn add_link(&self, link: &NewLink) -> Result<()> {
        let mut builder = MessageBuilder::new(
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        );
        builder.append(&IfInfoMsg {
            ifi_type: link.link_type,
            ..Default::default()
        });
        builder.append_attr_str(ifla::IFNAME, &link.name);
        let info = builder.nest_start(ifla::LINKINFO);
        builder.append_attr_str(ifla::INFO_KIND, &link.kind);
        builder.nest_end(info);

        self.socket
            .request_ack(builder)
            .await
            .map_err(|e| e.with_context(format!("creating link {}", link.name)))
    }

    /// Delete a link by index. A link that is already gone is not an error.
    pub async fn del_link(&self, index: u32) -> Result<()> {
        let mut builder = MessageBuilder::new(RTM_DELLINK, NLM_F_REQUEST | NLM_F_ACK);
        builder.append(&IfInfoMsg::for_index(index));

        match self.socket.request_ack(builder).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other.map_err(|e| e.with_context(format!("deleting link {index}"))),
        }
    }

    pub async fn set_link(&self, index: u32, change: &LinkModify) -> Result<()> {
        self.socket
            .request_ack(set_link_request(index, change))
            .await
            .map_err(|e| e.with_context(format!("modifying link {index}")))
    }
}

fn set_link_request(index: u32, change: &LinkModify) -> MessageBuilder {
    let mut builder = MessageBuilder::new(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
    builder.append(&IfInfoMsg {
        ifi_flags: change.flags,
        ifi_change: change.change,
        ..IfInfoMsg::for_index(index)
    });

    if let Some(mtu) = change.mtu {
        builder.append_attr_u32(ifla::MTU, mtu);
    }
    if let Some(master) = change.master {
        builder.append_attr_u32(ifla::MASTER, master);
    }
    if let Some(bond) = &change.bond {
        let info = builder.nest_start(ifla::LINKINFO);
        builder.append_attr_str(ifla::INFO_KIND, "bond");
        let data = builder.nest_start(ifla::INFO_DATA);
        builder.append_attr_u8(ifla::BOND_MODE, bond.mode as u8);
        builder.append_attr_u32(ifla::BOND_MIIMON, bond.mii_monitor);
        // delays are refused while miimon is off
        if bond.mii_monitor != 0 {
            builder.append_attr_u32(ifla::BOND_UPDELAY, bond.up_delay);
            builder.append_attr_u32(ifla::BOND_DOWNDELAY, bond.down_delay);
        }
        builder.nest_end(data);
        builder.nest_end(info);
    }
    builder
}

#[async_trait]
impl LinkHandle for RouteConnection {
    async fn list(&self) -> crate::Result<Vec<KernelLink>> {
        Ok(self.get_links().await?)
    }

    async fn create(&self, link: &NewLink) -> crate::Result<()> {
        Ok(self.add_link(link).await?)
    }

    async fn delete(&self, index: u32) -> crate::Result<()> {
        Ok(self.del_link(index).await?)
    }

    async fn modify(&self, index: u32, change: &LinkModify) -> crate::Result<()> {
        Ok(self.set_link(index, change).await?)
    }
}

/// Parse an `RTM_NEWLINK` payload (ifinfomsg + attributes).
pub fn parse_link(payload: &[u8]) -> Result<KernelLink> {
    let (header, _) = IfInfoMsg::ref_from_prefix(payload).map_err(|_| Error::Truncated {
        expected: std::mem::size_of::<IfInfoMsg>(),
        actual: payload.len(),
    })?;

    let mut name = None;
    let mut link = KernelLink {
        index: header.ifi_index as u32,
        link_type: header.ifi_type,
        flags: header.ifi_flags,
        ..Default::default()
    };

    for (attr_type, data) in AttrIter::new(&payload[std::mem::size_of::<IfInfoMsg>()..]) {
        match attr_type {
            ifla::IFNAME => name = Some(get::string(data)?.to_string()),
            ifla::MTU => link.mtu = get::u32_ne(data)?,
            ifla::MASTER => link.master = Some(get::u32_ne(data)?).filter(|&m| m != 0),
            ifla::LINKINFO => parse_link_info(data, &mut link)?,
            _ => {}
        }
    }

    link.name = name.ok_or_else(|| {
        Error::InvalidMessage(format!("link {} carries no name", link.index))
    })?;
    Ok(link)
}

fn parse_link_info(data: &[u8], link: &mut KernelLink) -> Result<()> {
    let mut info_data = None;
    for (attr_type, payload) in AttrIter::new(data) {
        match attr_type {
            ifla::INFO_KIND => link.kind = Some(get::string(payload)?.to_string()),
            ifla::INFO_DATA => info_data = Some(payload),
            _ => {}
        }
    }

    // INFO_DATA is only meaningful once the kind is known
    link.info = match (link.kind.as_deref(), info_data) {
        (Some("bond"), Some(data)) => LinkInfoData::Bond(parse_bond(data)?),
        (Some("vlan"), Some(data)) => LinkInfoData::Vlan(parse_vlan(data)?),
        _ => LinkInfoData::None,
    };
    Ok(())
}

fn parse_bond(data: &[u8]) -> Result<BondSettings> {
    let mut bond = BondSettings::default();
    for (attr_type, payload) in AttrIter::new(data) {
        match attr_type {
            ifla::BOND_MODE => {
                let raw = get::u8(payload)?;
                bond.mode = BondMode::from_u8(raw)
                    .ok_or_else(|| Error::InvalidAttribute(format!("unknown bond mode {raw}")))?;
            }
            ifla::BOND_MIIMON => bond.mii_monitor = get::u32_ne(payload)?,
            ifla::BOND_UPDELAY => bond.up_delay = get::u32_ne(payload)?,
            ifla::BOND_DOWNDELAY => bond.down_delay = get::u32_ne(payload)?,
            _ => {}
        }
    }
    Ok(bond)
}

fn parse_vlan(data: &[u8]) -> Result<VlanSettings> {
    let mut vlan = VlanSettings::default();
    for (attr_type, payload) in AttrIter::new(data) {
        match attr_type {
            ifla::VLAN_ID => vlan.vid = get::u16_ne(payload)?,
            ifla::VLAN_PROTOCOL => {
                let raw = get::u16_be(payload)?;
                vlan.protocol = VlanProtocol::from_ethertype(raw).ok_or_else(|| {
                    Error::InvalidAttribute(format!("unknown vlan protocol {raw:#06x}"))
                })?;
            }
            _ => {}
        }
    }
    Ok(vlan)
}
