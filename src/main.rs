mod cli;
mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use coord::{Election, Error, GatewayStore, LeaseId, Observer, Session, SessionConfig, Store};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbosity);

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let endpoint = config.endpoint(cli.endpoint.as_deref());
    let session_config = config.session_config()?;
    let store: Arc<dyn Store> = Arc::new(
        GatewayStore::with_timeout(&endpoint, session_config.request_timeout())
            .with_context(|| format!("connecting to {endpoint}"))?,
    );
    info!(%endpoint, "using store");

    match cli.command {
        Commands::Campaign { election, identity } => {
            campaign(store, session_config, &election, identity).await
        }
        Commands::Observe { election } => observe(store, &election).await,
        Commands::Leader { election } => leader(store, &election).await,
        Commands::Resign { election, lease } => resign(store, session_config, &election, lease).await,
    }
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("leasehold={level},coord={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn campaign(
    store: Arc<dyn Store>,
    config: SessionConfig,
    name: &str,
    identity: Option<String>,
) -> Result<()> {
    let identity = identity.unwrap_or_else(|| format!("leasehold-{}", uuid::Uuid::new_v4()));
    let session = Session::open(store, config).await.context("opening session")?;
    println!("lease {}", session.lease_id());

    let election = Election::new(&session, name);
    let interrupted = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let outcome = match election.campaign_until(identity, interrupted).await {
        Ok(leader) => {
            println!("elected {} as {}", leader.key, leader.value_str());
            tokio::select! {
                cause = election.lost() => {
                    warn!(%cause, "leadership lost");
                    Err(anyhow::Error::new(cause))
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, stepping down");
                    Ok(())
                }
            }
        }
        Err(Error::Cancelled) => {
            info!("interrupted before being elected");
            Ok(())
        }
        Err(e) => Err(anyhow::Error::new(e).context("campaign failed")),
    };

    if let Err(e) = election.resign().await {
        warn!(error = %e, "could not resign");
    }
    session.close().await?;
    outcome
}

async fn observe(store: Arc<dyn Store>, name: &str) -> Result<()> {
    let mut observer = Observer::new(store, name);
    loop {
        let item = tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            item = observer.next() => item,
        };
        match item {
            Some(Ok(leader)) => println!(
                "{} {} {}",
                leader.create_revision,
                leader.key,
                leader.value_str()
            ),
            Some(Err(e)) if e.is_transient() => {
                warn!(error = %e, "observer interrupted, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(()),
        }
    }
}

async fn leader(store: Arc<dyn Store>, name: &str) -> Result<()> {
    match coord::election::leader_key(store.as_ref(), name).await {
        Ok(leader) => {
            println!("{} {}", leader.key, leader.value_str());
            Ok(())
        }
        Err(Error::NoLeader) => {
            println!("no leader");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Deletes the candidacy of another process without revoking its lease.
async fn resign(store: Arc<dyn Store>, config: SessionConfig, name: &str, lease: LeaseId) -> Result<()> {
    let session = Session::resume(store, lease, config)
        .await
        .with_context(|| format!("lease {lease} is not usable"))?;
    let election = Election::new(&session, name);
    election.resign().await?;
    println!("resigned {}", election.key());
    Ok(())
}
