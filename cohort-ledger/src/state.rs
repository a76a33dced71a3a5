use crate::config::Config;
use crate::db::Ledger;
use crate::synthetic::RecordSource;
use cohort_zk::ShardKeys;
use std::sync::Arc;

/// Shared handles for request handlers and generation jobs.
///
/// The key material is built once at startup and shared read-only from here on.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ledger: Ledger,
    pub keys: Arc<ShardKeys>,
    pub records: Arc<dyn RecordSource>,
}

impl AppState {
    pub fn new(config: Config, ledger: Ledger, keys: Arc<ShardKeys>, records: Arc<dyn RecordSource>) -> Self {
        Self { config: Arc::new(config), ledger, keys, records }
    }

    pub fn shard_size(&self) -> usize {
        self.keys.shape().shard_size
    }
}
