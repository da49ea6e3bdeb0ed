use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter};

mod connect;
mod control;
mod delivery;
mod entity;
mod hoststat;
mod ipc;
mod limits;
mod relay;
mod route;
mod sched;
mod waitq;

/// Outbound mail transfer daemon.
///
/// Accepts envelopes from the queue, schedules routes to remote MXs,
/// and dispatches delivery sessions.
#[derive(Debug, Parser)]
#[command(about)]
struct Opt {
    /// TOML file holding per-domain connection limit profiles.
    #[arg(long)]
    limits: Option<PathBuf>,

    /// Required if started as root; specifies which user to run as once
    /// privileges have been dropped.
    #[arg(long)]
    user: Option<String>,

    /// Chroot to this directory before entering the event loop.
    #[arg(long)]
    chroot: Option<PathBuf>,

    /// Diagnostic filter, e.g. "mtad=debug". Overrides MTAD_LOG.
    #[arg(long)]
    log_filter: Option<String>,
}

impl Opt {
    #[cfg(unix)]
    fn drop_privs(&self) -> anyhow::Result<()> {
        use nix::unistd::{Uid, User};

        let uid = Uid::effective();
        if !uid.is_root() {
            return Ok(());
        }

        let user_name = self.user.as_ref().ok_or_else(|| {
            anyhow::anyhow!("When running as root, you must set --user to the user to run as")
        })?;
        let user = User::from_name(user_name)?
            .ok_or_else(|| anyhow::anyhow!("Invalid user {user_name}"))?;

        if let Some(path) = &self.chroot {
            nix::unistd::chroot(path.as_path())
                .with_context(|| format!("chroot {}", path.display()))?;
            std::env::set_current_dir("/").context("chdir(\"/\")")?;
        }

        nix::unistd::setgid(user.gid).context("setgid")?;
        nix::unistd::setuid(user.uid).context("setuid")?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn drop_privs(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();
    opts.drop_privs()?;

    register_panic_hook();

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async move { run(opts).await })
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let filter = match &opts.log_filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_env("MTAD_LOG").unwrap_or_else(|_| EnvFilter::new("mtad=info")),
    };
    let (filter, filter_handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let limits = match &opts.limits {
        Some(path) => limits::LimitsTable::load(path)?,
        None => limits::LimitsTable::default(),
    };

    let (peers, events, endpoints) = ipc::peer_channels();
    let mut mta = sched::Mta::new(limits, peers);
    mta.set_verbose_hook(Box::new(move |level| {
        let directive = match level {
            0 => "mtad=info",
            1 => "mtad=debug",
            _ => "mtad=trace",
        };
        filter_handle.reload(EnvFilter::new(directive)).ok();
    }));

    // The peer processes attach here. Their channel ends must outlive
    // the dispatch loop.
    let _endpoints = endpoints;

    spawn_signal_handlers();

    tracing::info!("info: mail transfer agent ready");
    sched::run(mta, events).await;
    tracing::info!("info: mail transfer agent exiting");
    Ok(())
}

fn spawn_signal_handlers() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut term =
                signal(SignalKind::terminate()).expect("install SIGTERM handler");
            let mut hup = signal(SignalKind::hangup()).expect("install SIGHUP handler");
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = term.recv() => break,
                    // SIGHUP is ignored.
                    _ = hup.recv() => continue,
                }
            }
        }
        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
        }
        tracing::info!("info: mail transfer agent exiting");
        std::process::exit(0);
    });
}

fn register_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let payload = info.payload();
        let payload = payload.downcast_ref::<&str>().unwrap_or(&"!?");
        if let Some(loc) = info.location() {
            tracing::error!(
                "panic at {}:{}:{} - {}",
                loc.file(),
                loc.line(),
                loc.column(),
                payload
            );
        } else {
            tracing::error!("panic - {}", payload);
        }
        default_hook(info);
    }));
}
