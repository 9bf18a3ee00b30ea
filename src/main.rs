use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use reqwest::Client;
use tracing_subscriber::EnvFilter;
use url::Url;

use wardengate::application::coordinator::ApprovalCoordinator;
use wardengate::application::registry::ToolRegistry;
use wardengate::config::{GatewayConfig, MessengerKind};
use wardengate::domain::dispatcher::ServiceDispatcher;
use wardengate::domain::messenger::MessengerAdapter;
use wardengate::domain::policy::PolicyEngine;
use wardengate::domain::store::ApprovalStore;
use wardengate::error::WardenError;
use wardengate::infrastructure::dispatcher::HttpServiceDispatcher;
use wardengate::infrastructure::messenger::{LoggingMessenger, WebhookMessenger};
use wardengate::infrastructure::rate_limiter::RateLimiter;
use wardengate::infrastructure::store::SqliteApprovalStore;
use wardengate::presentation::server::Gateway;

/// Human-in-the-loop execution gateway between an autonomous agent and the
/// privileged services it calls.
#[derive(Debug, Parser)]
#[command(name = "wardengate")]
struct Cli {
    /// Path to the gateway's YAML configuration file.
    #[arg(long, env = "WARDENGATE_CONFIG", default_value = "./wardengate.yaml")]
    config: PathBuf,

    /// Overrides the tracing log level (error, warn, info, debug, trace).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = GatewayConfig::load(&cli.config)?;

    let registry: Arc<dyn wardengate::domain::tool::ToolLookup> =
        Arc::new(ToolRegistry::build(config.tools.clone())?);

    let policy_engine = Arc::new(PolicyEngine::compile(&config.policy_rules, &config.policy_defaults)?);

    let store: Arc<dyn wardengate::domain::store::ApprovalStore> = Arc::new(
        SqliteApprovalStore::connect(std::path::Path::new(&config.database_path)).await?,
    );

    let messenger: Arc<dyn MessengerAdapter> = match config.messenger.kind {
        MessengerKind::Logging => Arc::new(LoggingMessenger),
        MessengerKind::Webhook => {
            let url_str = config
                .messenger
                .webhook_url
                .clone()
                .ok_or_else(|| WardenError::Config("messenger.webhook_url is required for kind=webhook".into()))?;
            let url = Url::parse(&url_str).map_err(|e| WardenError::Config(e.to_string()))?;
            Arc::new(WebhookMessenger::new(url, Client::new()))
        }
    };

    let mut services: HashMap<String, Url> = HashMap::new();
    for (name, base_url) in &config.services {
        let url = Url::parse(base_url).map_err(|e| WardenError::Config(e.to_string()))?;
        services.insert(name.clone(), url);
    }
    let dispatcher: Arc<dyn ServiceDispatcher> =
        Arc::new(HttpServiceDispatcher::new(Client::new(), services));

    let coordinator = Arc::new(ApprovalCoordinator::new(
        store.clone(),
        messenger,
        dispatcher.clone(),
        registry.clone(),
        config.approval_ttl,
    ));

    // Crash recovery (spec.md §6): drop any pending row whose deadline
    // passed while nobody was running to watch it.
    let stale = store.cleanup_stale(now()).await?;
    if !stale.is_empty() {
        tracing::warn!(count = stale.len(), "dropped stale pending approvals on startup");
    }

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_window, config.rate_limit_capacity));

    let gateway = Gateway::new(
        registry,
        policy_engine,
        coordinator,
        dispatcher,
        store,
        rate_limiter,
        config.agent_token.clone(),
        config.approval_ttl,
        config.max_pending_approvals,
    );

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "wardengate listening");

    let shutdown_gateway = gateway.clone();
    axum::serve(listener, gateway.router())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown_gateway.shutdown().await;
        })
        .await?;

    Ok(())
}

fn now() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
