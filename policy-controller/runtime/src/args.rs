use crate::{
    admin::{self, Admin},
    authz::{AccessReviews, Authorizer, ReviewConfig},
    bootstrap::{self, PolicyDocument, CREATE_BOOTSTRAP_POLICY_FILE_COMMAND},
    core::PolicyStore,
    index::{self, Index, IndexConfig, IndexMetrics},
    log::{self, LogFormat},
    store::{MemoryStore, MemoryStoreConfig, ValidatingStore},
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future;
use prometheus_client::registry::Registry;
use std::{io, net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::time::Duration;
use tracing::{debug, info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "rbac-policy-controller", about = "An RBAC policy controller")]
pub struct Args {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Runs the policy controller.
    Run(RunArgs),

    /// Writes the default bootstrap policy to a file.
    CreateBootstrapPolicyFile(CreateBootstrapPolicyFileArgs),
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    #[clap(
        long,
        default_value = "rbac=info,warn",
        env = "RBAC_POLICY_CONTROLLER_LOG"
    )]
    log_level: String,

    #[clap(long, default_value = "plain")]
    log_format: LogFormat,

    #[clap(long, default_value = "0.0.0.0:9990")]
    admin_addr: SocketAddr,

    /// Seeds the store from this policy document instead of the built-in default.
    #[clap(long, env = "RBAC_POLICY_CONTROLLER_BOOTSTRAP_POLICY_FILE")]
    bootstrap_policy_file: Option<PathBuf>,

    /// Replaces existing records with the bootstrap policy's records.
    #[clap(long)]
    overwrite_policy: bool,

    /// The number of store events retained to resume watches.
    #[clap(long, default_value = "1024")]
    watch_history: usize,

    #[clap(long, default_value = "1000")]
    min_backoff_ms: u64,

    #[clap(long, default_value = "30000")]
    max_backoff_ms: u64,

    /// Access reviews not decided within this many milliseconds fail as unavailable.
    #[clap(long, default_value = "10000")]
    review_timeout_ms: u64,
}

#[derive(Debug, clap::Args)]
struct CreateBootstrapPolicyFileArgs {
    #[clap(long)]
    filename: PathBuf,

    /// Regenerates the file if it already exists.
    #[clap(long)]
    overwrite: bool,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Run(args) => args.run().await,
            Command::CreateBootstrapPolicyFile(CreateBootstrapPolicyFileArgs {
                filename,
                overwrite,
            }) => {
                bootstrap::create_bootstrap_policy_file(&filename, overwrite, &mut io::stdout())
                    .await?;
                Ok(())
            }
        }
    }
}

impl RunArgs {
    async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            admin_addr,
            bootstrap_policy_file,
            overwrite_policy,
            watch_history,
            min_backoff_ms,
            max_backoff_ms,
            review_timeout_ms,
        } = self;

        log::init(&log_level, log_format)?;

        let store: Arc<dyn PolicyStore> = Arc::new(ValidatingStore::new(MemoryStore::new(
            MemoryStoreConfig {
                history: watch_history,
                ..Default::default()
            },
        )));

        // Build the index, which is updated by the watches and read by the authorizer.
        let (index, reader) = Index::shared();
        let mut prom = <Registry>::default();
        let metrics = IndexMetrics::register(prom.sub_registry_with_prefix("index"), reader.clone());

        let (drain_tx, drain_rx) = drain::channel();
        let watches = index::spawn_watches(
            store.clone(),
            index,
            metrics,
            IndexConfig {
                min_backoff: Duration::from_millis(min_backoff_ms),
                max_backoff: Duration::from_millis(max_backoff_ms.max(min_backoff_ms)),
            },
            drain_rx.clone(),
        );

        match bootstrap_policy_file {
            Some(path) => {
                bootstrap::overwrite_bootstrap_policy(
                    &*store,
                    &path,
                    CREATE_BOOTSTRAP_POLICY_FILE_COMMAND,
                    overwrite_policy,
                    &mut io::stdout(),
                )
                .await?
            }
            None => {
                let doc = PolicyDocument::default_policy()
                    .context("failed to parse the default bootstrap policy")?;
                bootstrap::seed(&*store, &doc, overwrite_policy)
                    .await
                    .context("failed to seed bootstrap policy")?;
            }
        }

        let reviews = AccessReviews::new(Authorizer::new(reader.clone()), ReviewConfig::default());
        let admin = Admin::new(
            reader,
            prom,
            reviews,
            Duration::from_millis(review_timeout_ms),
        );
        let admin = tokio::spawn(
            admin::serve(admin_addr, admin, drain_rx).instrument(info_span!("admin")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background
        // tasks to complete before exiting.
        shutdown_signal().await?;
        info!("Shutting down");
        drain_tx.drain().await;

        for res in future::join_all(watches).await {
            res.context("watch task panicked")?;
        }
        admin.await.context("admin task panicked")??;
        debug!("Shutdown complete");
        Ok(())
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("failed to register SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("failed to listen for SIGINT")?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")
}
