use cohort_ledger::api;
use cohort_ledger::config::Config;
use cohort_ledger::db::Ledger;
use cohort_ledger::errors::ServerError;
use cohort_ledger::keystore;
use cohort_ledger::state::AppState;
use cohort_ledger::synthetic::SyntheticRecords;
use cohort_zk::CircuitShape;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    // Ledger and key files live under the data dir (ignored by git).
    std::fs::create_dir_all(&config.data_dir)?;

    let ledger = Ledger::open(&config.db_path()).await?;

    let keys_dir = config.keys_dir();
    let shape = CircuitShape::new(config.shard_size);
    let keys = tokio::task::spawn_blocking(move || keystore::load_or_setup(&keys_dir, shape))
        .await
        .map_err(std::io::Error::other)??;

    let records = Arc::new(SyntheticRecords::new(config.synthetic_seed));
    let addr = config.bind_addr.clone();
    let state = AppState::new(config, ledger, Arc::new(keys), records);

    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "backend listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    Ok(())
}
