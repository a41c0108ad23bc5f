use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use galsync_core::{
    GalDomain, GalError, HttpReplicaProxy, StaticReplicaCatalog, SyncOrchestrator,
};
use galsync_directory::error::DirectoryError;
use galsync_ldap::LdapDirectory;

mod config;
mod routes;

use config::{ConfigError, DomainsFile, ServiceConfig};
use routes::{gal_router, AppState};

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("domain {domain}: {source}")]
    Directory {
        domain: String,
        #[source]
        source: DirectoryError,
    },

    #[error(transparent)]
    Gal(#[from] GalError),
}

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,galsyncd=debug,galsync_core=debug")),
        )
        .init();

    let config = ServiceConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Configuration error: {e}");
        std::process::exit(1);
    });

    tracing::info!(
        listen_addr = %config.listen_addr,
        node = %config.node_name,
        domains_file = %config.domains_file.display(),
        "starting GAL sync service"
    );

    let orchestrator = build_orchestrator(&config).await.unwrap_or_else(|e| {
        eprintln!("Startup error: {e}");
        std::process::exit(1);
    });

    let app = gal_router(AppState::new(
        Arc::new(orchestrator),
        config.peer_token.clone(),
    ));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Bind error: {e}");
            std::process::exit(1);
        });

    tracing::info!(listen_addr = %config.listen_addr, "GAL sync service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_else(|e| {
            eprintln!("Server error: {e}");
            std::process::exit(1);
        });
}

async fn build_orchestrator(config: &ServiceConfig) -> Result<SyncOrchestrator, StartupError> {
    let file = DomainsFile::load(&config.domains_file)?;
    let peers = file.peer_urls()?;

    // No local mailbox store is attached, so replica reads always go to the
    // peer that hosts the account and otherwise fall back to LDAP.
    let mut orchestrator =
        SyncOrchestrator::new(config.node_name.clone(), Arc::new(StaticReplicaCatalog::new()));
    if !peers.is_empty() {
        let proxy = HttpReplicaProxy::new(peers, config.proxy_timeout)?
            .with_peer_token(config.peer_token.clone());
        orchestrator = orchestrator.with_proxy(Arc::new(proxy));
    }

    for entry in file.domains {
        let name = entry.config.name.clone();
        let mut domain = GalDomain::new(entry.config);
        if let Some(ldap) = entry.internal_ldap {
            let directory = connect(&name, ldap).await?;
            domain = domain.with_internal_directory(Arc::new(directory));
        }
        if let Some(ldap) = entry.external_ldap {
            let directory = connect(&name, ldap).await?;
            domain = domain.with_external_directory(Arc::new(directory));
        }
        tracing::info!(domain = %name, mode = ?domain.config.gal_mode, "domain registered");
        orchestrator.add_domain(domain)?;
    }
    Ok(orchestrator)
}

async fn connect(
    domain: &str,
    config: galsync_ldap::LdapConfig,
) -> Result<LdapDirectory, StartupError> {
    LdapDirectory::connect(config)
        .await
        .map_err(|source| StartupError::Directory {
            domain: domain.to_string(),
            source,
        })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
