// dbs-linux: distributed backup peer daemon. Multicast transport and stdin console.

mod config;
mod console;
mod transport;

use std::path::PathBuf;

use anyhow::{bail, Context};
use dbs_core::{ChannelKind, Dispatcher, Message, Outbound, PeerCore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use transport::ChannelSocket;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    peer_id: Option<u32>,
}

fn parse_args() -> anyhow::Result<Option<Args>> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("dbs-linux {}", VERSION);
                return Ok(None);
            }
            "--config" => {
                let p = it.next().context("--config needs a path")?;
                args.config = Some(PathBuf::from(p));
            }
            "--peer-id" => {
                let v = it.next().context("--peer-id needs a value")?;
                let id = v.parse().with_context(|| format!("invalid peer id {v:?}"))?;
                args.peer_id = Some(id);
            }
            other => bail!("unknown argument {other:?}"),
        }
    }
    Ok(Some(args))
}

fn main() -> anyhow::Result<()> {
    let Some(args) = parse_args()? else {
        return Ok(());
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("dbs_core=info,dbs_linux=info")),
        )
        .init();

    let mut cfg = config::load(args.config.as_deref())?;
    if let Some(id) = args.peer_id {
        cfg.peer_id = id;
    }
    let core_config = cfg.core_config()?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (core, outbound) = PeerCore::open(core_config).context("cannot open peer storage")?;
        info!(
            peer_id = %core.peer_id(),
            version = %core.version(),
            storage = %core.storage_dir().display(),
            "peer started"
        );

        let Outbound {
            control,
            backup,
            restore,
        } = outbound;
        let dispatcher = Dispatcher::new(core.clone());
        for (kind, channel, rx) in [
            (ChannelKind::Control, cfg.control, control),
            (ChannelKind::Backup, cfg.backup, backup),
            (ChannelKind::Restore, cfg.restore, restore),
        ] {
            ChannelSocket::bind(kind, channel)
                .with_context(|| format!("cannot bind {kind} channel"))?
                .spawn(dispatcher.clone(), rx);
        }

        check_deleted(&core);

        let console_core = core.clone();
        tokio::spawn(async move {
            if let Err(e) = console::run_console(console_core).await {
                warn!(error = %e, "console closed");
            }
        });
        println!("{}", console::USAGE);

        shutdown_signal().await?;
        info!(peer_id = %core.peer_id(), "shutting down");
        anyhow::Ok(())
    })?;
    Ok(())
}

/// Ask the owners of every file held here whether it was deleted while we were away.
fn check_deleted(core: &PeerCore) {
    let files = core.stored_chunks.files();
    for file_id in &files {
        let msg = Message::CheckDelete {
            header: core.header(*file_id),
        };
        core.channels.control.send_message(&msg);
    }
    if !files.is_empty() {
        info!(files = files.len(), "CHECKDELETE sent for held files");
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
