use anyhow::Context;
use api_server::{create_router, AppState};
use config_manager::SystemConfig;
use job_orchestrator::{JobService, Pipeline, QueueManager, RetentionSweeper, Stores};
use persistence_layer::{MemoryStore, PostgresClient};
use price_client::BirdeyePriceSource;
use solana_client::{RpcTransactionSource, SolanaClientConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tx_parser::{BalanceChangeDecoder, DecoderConfig};

async fn connect_stores(config: &SystemConfig) -> anyhow::Result<Stores> {
    if !config.database.enabled {
        warn!("⚠️ Database disabled, job state lives in memory and is lost on restart");
        return Ok(Stores::from_backend(Arc::new(MemoryStore::new())));
    }

    let delay = Duration::from_secs(config.queue.startup_retry_delay_seconds.max(1));
    let client = loop {
        match PostgresClient::new(&config.database.postgres_url, config.database.max_connections).await {
            Ok(client) => break client,
            Err(e) => {
                warn!("⚠️ Database unreachable ({}), retrying in {}s", e, delay.as_secs());
                tokio::time::sleep(delay).await;
            }
        }
    };
    client.ensure_schema().await.context("creating database schema")?;
    info!("✅ Database schema ready");
    Ok(Stores::from_backend(Arc::new(client)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,job_orchestrator=debug".into()),
        )
        .init();

    info!("Starting wallet analyzer...");

    let config = SystemConfig::load().context("loading configuration")?;
    info!("Configuration loaded successfully");

    let stores = connect_stores(&config).await?;

    let transaction_source = Arc::new(
        RpcTransactionSource::new(SolanaClientConfig::from(&config.solana))
            .context("creating RPC client")?,
    );
    let decoder = Arc::new(BalanceChangeDecoder::new(DecoderConfig::default()));
    let price_source = Arc::new(BirdeyePriceSource::new(&config.prices).context("creating price client")?);

    let retention = config.retention.clone();
    let bind_addr = format!("{}:{}", config.api.host, config.api.port);

    let pipeline = Pipeline::new(config, stores.clone(), transaction_source, decoder, price_source);
    let queue = QueueManager::new(pipeline.clone());
    let _admission = queue.start();
    let _sweeper = RetentionSweeper::new(stores, retention).start();

    let app = create_router(AppState::new(JobService::new(pipeline, queue)));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;
    info!("🚀 Server listening on {}", bind_addr);
    info!("   • POST /api/wallets/:address/analysis - Start or refresh an analysis");
    info!("   • GET /api/wallets/:address/status - Job status and progress");
    info!("   • GET /api/wallets/:address/results - Per-token results (page, page_size)");

    axum::serve(listener, app).await?;

    Ok(())
}
