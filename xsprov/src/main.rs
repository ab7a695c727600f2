use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use xsprov::lookup::{self, HostFilter, NameFilter, PifFilter};
use xsprov::reconciler::network::{NetworkReconciler, NicUse, VlanReconciler, available_nics};
use xsprov::reconciler::pif::PifConfigureReconciler;
use xsprov::reconciler::pool::PoolReconciler;
use xsprov::reconciler::snapshot::SnapshotReconciler;
use xsprov::reconciler::sr::SrReconciler;
use xsprov::reconciler::sr::nfs::NfsSrReconciler;
use xsprov::reconciler::sr::smb::SmbSrReconciler;
use xsprov::reconciler::vdi::VdiReconciler;
use xsprov::reconciler::vm::VmReconciler;
use xsprov::xapi::JsonRpcConnector;
use xsprov::{ProviderConfig, ProviderContext, ProviderError, Reconciler};

#[derive(Parser)]
#[command(name = "xsprov")]
#[command(about = "Reconcile declared XenServer resources", long_about = None)]
struct Cli {
    #[command(flatten)]
    provider: ProviderConfig,

    #[command(subcommand)]
    kind: Kind,
}

#[derive(Subcommand)]
enum Kind {
    /// Pool name, default SR, management network and membership
    Pool {
        #[command(subcommand)]
        action: Action,
    },
    /// VM cloned from a template
    Vm {
        #[command(subcommand)]
        action: Action,
    },
    /// Virtual disk, optionally imported from a local image
    Vdi {
        #[command(subcommand)]
        action: Action,
    },
    /// VM snapshot or checkpoint
    Snapshot {
        #[command(subcommand)]
        action: Action,
    },
    /// Storage repository with a raw device config
    Sr {
        #[command(subcommand)]
        action: Action,
    },
    /// NFS storage repository
    NfsSr {
        #[command(subcommand)]
        action: Action,
    },
    /// SMB storage repository
    SmbSr {
        #[command(subcommand)]
        action: Action,
    },
    /// Network without a physical attachment
    Network {
        #[command(subcommand)]
        action: Action,
    },
    /// Network tagged onto a NIC
    Vlan {
        #[command(subcommand)]
        action: Action,
    },
    /// Settings of an existing physical interface
    PifConfigure {
        #[command(subcommand)]
        action: Action,
    },
    /// List existing objects without changing anything
    Lookup {
        #[command(subcommand)]
        what: Lookup,
    },
}

#[derive(Subcommand)]
enum Lookup {
    /// Hosts by name, UUID or address
    Host(HostFilter),
    Sr(NameFilter),
    Network(NameFilter),
    /// VMs, templates and snapshots by name or UUID
    Vm(NameFilter),
    Pif(PifFilter),
    /// NIC names usable in a VLAN network's `nic`
    Nic {
        #[arg(long, value_enum)]
        network_type: Option<NicUse>,
    },
}

#[derive(Subcommand)]
enum Action {
    /// Create from a declared configuration and print the state
    Create {
        #[arg(long)]
        config: PathBuf,
    },
    /// Refresh a state from the remote objects
    Read {
        #[arg(long)]
        state: PathBuf,
    },
    /// Move an existing resource to a new configuration
    Update {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        state: PathBuf,
    },
    /// Remove the resource described by a state
    Delete {
        #[arg(long)]
        state: PathBuf,
    },
}

async fn load<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

async fn execute<R>(reconciler: R, ctx: &ProviderContext, action: Action) -> anyhow::Result<()>
where
    R: Reconciler,
    R::Config: DeserializeOwned,
    R::State: Serialize + DeserializeOwned,
{
    let state = match action {
        Action::Create { config } => {
            let config = load(&config).await?;
            Some(reconciler.create(ctx, &config).await?)
        }
        Action::Read { state } => {
            let state = load(&state).await?;
            Some(reconciler.read(ctx, &state).await?)
        }
        Action::Update { config, state } => {
            let config = load(&config).await?;
            let state = load(&state).await?;
            Some(reconciler.update(ctx, &config, &state).await?)
        }
        Action::Delete { state } => {
            let state = load(&state).await?;
            reconciler.delete(ctx, &state).await?;
            None
        }
    };
    match state {
        Some(state) => print(&state),
        None => Ok(()),
    }
}

fn print<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn find(ctx: &ProviderContext, what: Lookup) -> anyhow::Result<()> {
    let session = &ctx.session;
    match what {
        Lookup::Host(filter) => print(&lookup::hosts(session, &filter).await?),
        Lookup::Sr(filter) => print(&lookup::srs(session, &filter).await?),
        Lookup::Network(filter) => print(&lookup::networks(session, &filter).await?),
        Lookup::Vm(filter) => print(&lookup::vms(session, &filter).await?),
        Lookup::Pif(filter) => print(&lookup::pifs(session, &filter).await?),
        Lookup::Nic { network_type } => print(&available_nics(session, network_type).await?),
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    let connector = Arc::new(JsonRpcConnector::default());
    let ctx = ProviderContext::connect(cli.provider, connector, cancel).await?;

    match cli.kind {
        Kind::Pool { action } => execute(PoolReconciler::default(), &ctx, action).await,
        Kind::Vm { action } => execute(VmReconciler::default(), &ctx, action).await,
        Kind::Vdi { action } => execute(VdiReconciler::default(), &ctx, action).await,
        Kind::Snapshot { action } => execute(SnapshotReconciler, &ctx, action).await,
        Kind::Sr { action } => execute(SrReconciler, &ctx, action).await,
        Kind::NfsSr { action } => execute(NfsSrReconciler, &ctx, action).await,
        Kind::SmbSr { action } => execute(SmbSrReconciler, &ctx, action).await,
        Kind::Network { action } => execute(NetworkReconciler, &ctx, action).await,
        Kind::Vlan { action } => execute(VlanReconciler, &ctx, action).await,
        Kind::PifConfigure { action } => execute(PifConfigureReconciler::default(), &ctx, action).await,
        Kind::Lookup { what } => find(&ctx, what).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries the state document.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("xsprov=info,reqwest=warn,hyper=warn")),
        )
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received SIGINT, cancelling");
            on_interrupt.cancel();
        }
    });

    match run(cli, cancel).await {
        Ok(()) => {
            info!("done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            if let Some(attribute) = e.downcast_ref::<ProviderError>().and_then(ProviderError::attribute) {
                eprintln!("  attribute: {attribute}");
            }
            ExitCode::FAILURE
        }
    }
}
