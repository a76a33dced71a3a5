//! Fixtures shared by the async tests: one set of small-shard keys per test binary.

use crate::config::Config;
use crate::db::Ledger;
use crate::state::AppState;
use crate::synthetic::{RecordSource, SyntheticRecords};
use cohort_zk::{CircuitShape, CommitmentScheme, ShardKeys};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::sync::{Arc, OnceLock};
use tempfile::TempDir;

pub const TEST_SHARD_SIZE: usize = 4;

pub fn shared_keys() -> Arc<ShardKeys> {
    static KEYS: OnceLock<Arc<ShardKeys>> = OnceLock::new();
    KEYS.get_or_init(|| {
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let keys = ShardKeys::setup(CircuitShape::new(TEST_SHARD_SIZE), CommitmentScheme::poseidon(), &mut rng)
            .expect("test setup");
        Arc::new(keys)
    })
    .clone()
}

pub async fn test_state_with(records: Arc<dyn RecordSource>) -> (AppState, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::testing(dir.path().to_path_buf(), TEST_SHARD_SIZE);
    let ledger = Ledger::open(&config.db_path()).await.unwrap();
    let keys = tokio::task::spawn_blocking(shared_keys).await.unwrap();
    (AppState::new(config, ledger, keys, records), dir)
}

pub async fn test_state() -> (AppState, TempDir) {
    test_state_with(Arc::new(SyntheticRecords::new(3))).await
}
