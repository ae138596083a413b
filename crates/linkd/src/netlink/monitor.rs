//! Link change notifications from the `RTNLGRP_LINK` multicast group.

use super::error::Result;
use super::message::{MessageIter, RTM_DELLINK, RTM_NEWLINK};
use super::route::parse_link;
use super::socket::{NetlinkSocket, Protocol, rtnetlink_groups};

/// A link appeared, changed or went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// `RTM_NEWLINK`: link created or its attributes changed.
    Changed { index: u32, name: String },
    /// `RTM_DELLINK`.
    Removed { index: u32, name: String },
}

impl LinkEvent {
    pub fn name(&self) -> &str {
        match self {
            Self::Changed { name, .. } | Self::Removed { name, .. } => name,
        }
    }
}

/// Subscriber for link events.
///
/// Requires no privileges; every process may join `RTNLGRP_LINK`.
pub struct LinkMonitor {
    socket: NetlinkSocket,
}

impl LinkMonitor {
    pub fn new() -> Result<Self> {
        let mut socket = NetlinkSocket::new(Protocol::Route)?;
        socket.add_membership(rtnetlink_groups::RTNLGRP_LINK)?;
        Ok(Self { socket })
    }

    /// Receive the next batch of link events.
    ///
    /// Returns `Ok(None)` if the socket was closed.
    pub async fn recv(&mut self) -> Result<Option<Vec<LinkEvent>>> {
        loop {
            let data = self.socket.recv().await?;
            if data.is_empty() {
                return Ok(None);
            }

            let events = parse_events(&data);
            if !events.is_empty() {
                return Ok(Some(events));
            }
        }
    }
}

fn parse_events(data: &[u8]) -> Vec<LinkEvent> {
    let mut events = Vec::new();
    for msg in MessageIter::new(data) {
        let Ok((header, payload)) = msg else { break };
        let event = match header.nlmsg_type {
            RTM_NEWLINK | RTM_DELLINK => match parse_link(payload) {
                Ok(link) if header.nlmsg_type == RTM_NEWLINK => LinkEvent::Changed {
                    index: link.index,
                    name: link.name,
                },
                Ok(link) => LinkEvent::Removed {
                    index: link.index,
                    name: link.name,
                },
                Err(e) => {
                    tracing::debug!(error = %e, "ignoring malformed link notification");
                    continue;
                }
            },
            _ => continue,
        };
        events.push(event);
    }
    events
}
