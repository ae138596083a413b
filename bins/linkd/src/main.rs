//! linkd - declarative link reconciliation daemon.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use linkd::events::WakeSource;
use linkd::netlink::{self, LinkMonitor, RouteConnection, WireguardConnection};
use linkd::config::Format;
use linkd::{Declaration, LinkReconciler, MemoryRuntime, WireguardClient};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "linkd", version, about = "Declarative link reconciliation daemon")]
struct Cli {
    /// Default log level when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile continuously until interrupted.
    Run(FileArgs),

    /// Run a single reconcile cycle.
    Once(FileArgs),

    /// Validate a declaration file.
    Check(CheckArgs),
}

#[derive(Args)]
struct FileArgs {
    /// Declaration file (YAML, or JSON with a .json extension).
    #[arg(short = 'c', long = "config", default_value = "/etc/linkd/links.yaml")]
    config: PathBuf,
}

#[derive(Args)]
struct CheckArgs {
    #[command(flatten)]
    file: FileArgs,

    /// Print the declaration as loaded, with defaults filled in.
    #[arg(long)]
    print: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(cli.log_level.into()),
        )
        .init();

    match cli.command {
        Command::Run(args) => run(&args.config).await,
        Command::Once(args) => once(&args.config).await,
        Command::Check(args) => check(&args.file.config, args.print),
    }
}

fn load(path: &Path) -> anyhow::Result<Declaration> {
    Declaration::load(path).with_context(|| format!("loading {}", path.display()))
}

fn check(path: &Path, print: bool) -> anyhow::Result<()> {
    let decl = load(path)?;
    if print {
        let rendered = decl.render(Format::from_path(path))?;
        println!("{}", rendered.trim_end());
        return Ok(());
    }
    println!(
        "{}: {} link(s), controller {}",
        path.display(),
        decl.links.len(),
        decl.controller.name
    );
    for link in &decl.links {
        let peers = link.wireguard.as_ref().map_or(0, |wg| wg.peers.len());
        println!(
            "  {:<16} {:<10} logical={} up={} mtu={} peers={}",
            link.name,
            link.kind.as_str(),
            link.logical,
            link.up,
            link.mtu,
            peers
        );
    }
    Ok(())
}

/// Open the kernel backends and build a reconciler over `runtime`.
async fn reconciler(
    decl: &Declaration,
    runtime: Arc<MemoryRuntime>,
) -> anyhow::Result<LinkReconciler> {
    let links = RouteConnection::new().context("opening rtnetlink socket")?;
    let mut reconciler =
        LinkReconciler::new(runtime, Arc::new(links)).with_owner(decl.controller.name.clone());

    match WireguardConnection::new().await {
        Ok(client) => {
            let client: Arc<dyn WireguardClient> = Arc::new(client);
            reconciler = reconciler.with_wireguard(client);
        }
        Err(e @ netlink::Error::FamilyNotFound { .. }) => {
            warn!(error = %e, "wireguard unavailable, wireguard links will fail to sync");
        }
        Err(e) => return Err(e).context("opening wireguard client"),
    }
    Ok(reconciler)
}

async fn once(path: &Path) -> anyhow::Result<()> {
    let decl = load(path)?;
    let runtime = Arc::new(MemoryRuntime::with_specs(decl.links.clone()));
    let reconciler = reconciler(&decl, runtime).await?;

    reconciler.reconcile().await?;
    info!(links = decl.links.len(), "links in sync");
    Ok(())
}

async fn run(path: &Path) -> anyhow::Result<()> {
    let decl = load(path)?;
    let runtime = Arc::new(MemoryRuntime::new(decl.controller.backoff()));
    runtime.replace_all(decl.links.clone());
    let reconciler = reconciler(&decl, runtime.clone()).await?;

    let mut source = WakeSource::new(decl.controller.min_wake_interval());
    source
        .watch_links(LinkMonitor::new().context("opening link monitor")?)
        .watch_store(runtime.subscribe());
    let waker = source.waker();
    let (mut wake, _tasks) = source.build();

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(handle_signals(path.to_path_buf(), runtime.clone(), stop_tx));

    info!(
        links = decl.links.len(),
        owner = reconciler.owner(),
        "linkd started"
    );

    loop {
        match reconciler.run(&mut wake, stopped(stop_rx.clone())).await {
            Ok(()) => break,
            Err(e) => {
                let delay = runtime.next_backoff();
                error!(error = %e, ?delay, "reconcile failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => waker.wake(),
                    _ = stopped(stop_rx.clone()) => break,
                }
            }
        }
    }

    info!("linkd stopped");
    Ok(())
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// SIGINT/SIGTERM stop the daemon; SIGHUP reloads the declaration file.
async fn handle_signals(path: PathBuf, runtime: Arc<MemoryRuntime>, stop: watch::Sender<bool>) {
    let signals = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    );
    let (mut int, mut term, mut hup) = match signals {
        (Ok(int), Ok(term), Ok(hup)) => (int, term, hup),
        _ => {
            error!("failed to install signal handlers");
            let _ = stop.send(true);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = int.recv() => break,
            _ = term.recv() => break,
            _ = hup.recv() => reload(&path, &runtime),
        }
    }
    info!("shutting down");
    let _ = stop.send(true);
}

fn reload(path: &Path, runtime: &MemoryRuntime) {
    match Declaration::load(path) {
        Ok(decl) => {
            let count = decl.links.len();
            let removed = runtime.replace_all(decl.links);
            info!(links = count, ?removed, "declaration reloaded");
        }
        Err(e) => error!(error = %e, path = %path.display(), "reload failed, keeping previous declaration"),
    }
}
