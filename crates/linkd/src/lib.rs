//! Declarative network link controller for Linux.
//!
//! A [`LinkReconciler`] drives the kernel's interfaces towards a set of
//! declared [`LinkSpec`]s: it creates and replaces logical links, keeps MTU,
//! administrative state and bond membership in line, and pushes WireGuard
//! device configuration as a minimal patch computed by [`wireguard::codec`].
//!
//! The kernel and the declaration store sit behind traits so the reconciler
//! can be driven against fakes:
//!
//! - [`LinkHandle`]: link dump, create, delete and modify
//!   (production: [`netlink::RouteConnection`]).
//! - [`WireguardClient`]: WireGuard device read and write
//!   (production: [`netlink::WireguardConnection`]).
//! - [`Runtime`]: declared items, finalizers and refresh counters
//!   (in-process: [`MemoryRuntime`]).
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use linkd::events::WakeSource;
//! use linkd::netlink::{LinkMonitor, RouteConnection};
//! use linkd::{Declaration, LinkReconciler, MemoryRuntime};
//!
//! #[tokio::main]
//! async fn main() -> linkd::Result<()> {
//!     let decl = Declaration::load("/etc/linkd.yaml")?;
//!     let runtime = Arc::new(MemoryRuntime::with_specs(decl.links));
//!     let reconciler = LinkReconciler::new(runtime.clone(), Arc::new(RouteConnection::new()?));
//!
//!     let mut source = WakeSource::new(Duration::from_millis(500));
//!     source.watch_links(LinkMonitor::new()?).watch_store(runtime.subscribe());
//!     let (mut wake, _tasks) = source.build();
//!
//!     reconciler.run(&mut wake, std::future::pending()).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod kernel;
pub mod kind;
pub mod netlink;
pub mod reconcile;
pub mod runtime;
pub mod spec;
pub mod wireguard;

pub use config::Declaration;
pub use error::{CycleError, Error, Result, ResultExt};
pub use kernel::{KernelLink, LinkHandle, LinkSnapshot};
pub use kind::LinkKind;
pub use reconcile::LinkReconciler;
pub use runtime::{LinkItem, MemoryRuntime, Phase, Runtime};
pub use spec::{LinkSpec, WireguardPeer, WireguardSpec};
pub use wireguard::WireguardClient;
