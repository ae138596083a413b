//! Async netlink transport and the kernel-backed collaborators.
//!
//! - [`RouteConnection`]: rtnetlink link dump/create/delete/modify, the
//!   production [`LinkHandle`](crate::kernel::LinkHandle).
//! - [`WireguardConnection`]: the `wireguard` generic netlink family, the
//!   production [`WireguardClient`](crate::wireguard::WireguardClient).
//! - [`LinkMonitor`]: `RTNLGRP_LINK` multicast listener used to wake the
//!   reconciler on topology changes.

pub mod attr;
pub mod builder;
mod error;
pub mod genl;
pub mod message;
mod monitor;
mod route;
mod socket;
mod wireguard;

pub use error::{Error, Result};
pub use genl::GenlConnection;
pub use monitor::{LinkEvent, LinkMonitor};
pub use route::{IfInfoMsg, RouteConnection, parse_link};
pub use socket::{NetlinkSocket, Protocol, rtnetlink_groups};
pub use wireguard::{WG_GENL_NAME, WireguardConnection};
