//! Background dataset generation: build, prove, verify and persist every shard, then chain the
//! shard commitments into the dataset commitment.
//!
//! Raw records are never written to disk and never exposed via the API.

use crate::db::{LedgerError, NewShard};
use crate::errors::ApiError;
use crate::state::AppState;
use crate::synthetic::RecordSource;
use base64::Engine;
use cohort_zk::groth16::serialize_proof;
use cohort_zk::types::{fr_from_hex, fr_to_hex};
use cohort_zk::{ShardKeys, ZkError};
use rand::rngs::OsRng;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum GenerationError {
    /// Building, proving or verifying a shard failed.
    #[error("shard {shard_index}: {source}")]
    Shard {
        shard_index: u64,
        #[source]
        source: ZkError,
    },

    /// Persisting a shard failed for good: either not retryable or out of attempts.
    #[error("shard {shard_index}: ledger write failed: {source}")]
    ShardWrite {
        shard_index: u64,
        #[source]
        source: LedgerError,
    },

    #[error("ledger write failed: {source}")]
    LedgerWrite {
        #[source]
        source: LedgerError,
    },

    #[error("ledger read failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("shard worker failed: {0}")]
    Worker(String),

    #[error("shard work cancelled")]
    Cancelled,

    #[error("barrier: {verified} of {total} shards persisted as verified, {done} reported done")]
    Barrier { verified: u64, done: u64, total: u64 },

    #[error("stored shard commitment is invalid: {0}")]
    Commitment(ZkError),
}

/// Validate a requested size and return the number of shards it splits into.
pub fn shards_for_size(dataset_size: u64, shard_size: u64, max_dataset_size: u64) -> Result<u64, String> {
    if dataset_size == 0 {
        return Err("dataset_size must be positive".to_string());
    }
    if dataset_size > max_dataset_size {
        return Err(format!("dataset_size must not exceed {max_dataset_size}"));
    }
    if dataset_size % shard_size != 0 {
        return Err(format!("dataset_size must be a multiple of shard_size ({shard_size})"));
    }
    Ok(dataset_size / shard_size)
}

/// Register a dataset in `generating` state and start its background job.
pub async fn create_dataset(state: &AppState, requested: Option<u64>) -> Result<(Uuid, JoinHandle<()>), ApiError> {
    let dataset_size = requested.unwrap_or(state.config.default_dataset_size);
    let shard_size = state.shard_size() as u64;
    let shards_total =
        shards_for_size(dataset_size, shard_size, state.config.max_dataset_size).map_err(ApiError::BadRequest)?;

    let dataset_id = Uuid::new_v4();
    state
        .ledger
        .insert_dataset(dataset_id, dataset_size, shard_size, shards_total)
        .await?;

    let job = tokio::spawn(generate_dataset_and_proofs(state.clone(), dataset_id, shards_total));
    Ok((dataset_id, job))
}

/// Retry a ledger operation a bounded number of times with linear backoff.
pub(crate) async fn with_retries<T, F, Fut>(attempts: u32, backoff: Duration, mut op: F) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < attempts && e.is_retryable() => {
                warn!(attempt, error = %e, "ledger write failed, retrying");
                tokio::time::sleep(backoff * attempt).await;
                attempt += 1;
            }
            Err(e) => {
                if attempt > 1 {
                    warn!(attempts = attempt, error = %e, "ledger write gave up");
                }
                return Err(e);
            }
        }
    }
}

/// Background job owning one dataset. Every fatal error ends up in the dataset's `error` field.
pub async fn generate_dataset_and_proofs(state: AppState, dataset_id: Uuid, shards_total: u64) {
    let started = Instant::now();
    match run_job(&state, dataset_id, shards_total).await {
        Ok(commitment_hex) => {
            info!(%dataset_id, shards_total, elapsed_ms = started.elapsed().as_millis() as u64, %commitment_hex, "dataset ready");
        }
        Err(e) => {
            error!(%dataset_id, error = %e, "dataset generation failed");
            let message = e.to_string();
            let config = &state.config;
            let recorded = with_retries(config.ledger_write_attempts, config.ledger_retry_backoff, || {
                state.ledger.set_dataset_failed(dataset_id, &message)
            })
            .await;
            if let Err(e) = recorded {
                error!(%dataset_id, error = %e, "could not record dataset failure");
            }
        }
    }
}

fn settle(joined: Result<Result<u64, GenerationError>, JoinError>) -> Result<u64, GenerationError> {
    joined.map_err(|e| GenerationError::Worker(e.to_string()))?
}

async fn run_job(state: &AppState, dataset_id: Uuid, shards_total: u64) -> Result<String, GenerationError> {
    let workers = state.config.prover_workers.max(1);
    info!(%dataset_id, shards_total, workers, "starting dataset generation");

    let permits = Arc::new(Semaphore::new(workers));
    let cancelled = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicU64::new(0));
    let mut tasks = JoinSet::new();
    let mut first_error = None;

    for shard_index in 0..shards_total {
        let permit = match permits.clone().acquire_owned().await {
            Ok(p) => p,
            Err(e) => {
                first_error = Some(GenerationError::Worker(e.to_string()));
                break;
            }
        };

        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = settle(joined) {
                first_error = Some(e);
                break;
            }
        }
        if first_error.is_some() {
            break;
        }

        let task_state = state.clone();
        let cancelled = cancelled.clone();
        let done = done.clone();
        tasks.spawn(async move {
            let _permit = permit;
            shard_task(task_state, dataset_id, shard_index, shards_total, cancelled, done).await
        });
    }

    if first_error.is_none() {
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = settle(joined) {
                first_error = Some(e);
                break;
            }
        }
    }

    if let Some(e) = first_error {
        cancelled.store(true, Ordering::SeqCst);
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        return Err(e);
    }

    finalize(state, dataset_id, shards_total, done.load(Ordering::SeqCst)).await
}

async fn shard_task(
    state: AppState,
    dataset_id: Uuid,
    shard_index: u64,
    shards_total: u64,
    cancelled: Arc<AtomicBool>,
    done: Arc<AtomicU64>,
) -> Result<u64, GenerationError> {
    let keys = state.keys.clone();
    let source = state.records.clone();
    let stop = cancelled.clone();

    let shard = tokio::task::spawn_blocking(move || {
        prove_shard(&keys, source.as_ref(), shard_index, &stop)
    })
    .await
    .map_err(|e| GenerationError::Worker(format!("shard {shard_index}: {e}")))??;

    if cancelled.load(Ordering::SeqCst) {
        return Err(GenerationError::Cancelled);
    }

    let config = &state.config;
    with_retries(config.ledger_write_attempts, config.ledger_retry_backoff, || {
        state.ledger.insert_shard(dataset_id, &shard)
    })
    .await
    .map_err(|source| GenerationError::ShardWrite { shard_index, source })?;

    let n = done.fetch_add(1, Ordering::SeqCst) + 1;
    if n % 10 == 0 || n == shards_total {
        info!(%dataset_id, shard_index, shards_done = n, shards_total, "shard persisted");
    }
    Ok(shard_index)
}

/// Build, prove and verify one shard. CPU-bound; runs on the blocking pool.
///
/// `abort_all` cannot interrupt blocking work, so `stop` is polled between steps. A Groth16 proof
/// already running finishes first; at most `prover_workers` of them are ever in flight.
fn prove_shard(
    keys: &ShardKeys,
    source: &dyn RecordSource,
    shard_index: u64,
    stop: &AtomicBool,
) -> Result<NewShard, GenerationError> {
    let shard_err = move |source: ZkError| GenerationError::Shard { shard_index, source };
    let check_stop = || if stop.load(Ordering::SeqCst) { Err(GenerationError::Cancelled) } else { Ok(()) };

    check_stop()?;
    let records = source.shard_records(shard_index, keys.shape().shard_size);
    let digest = keys.build_shard(&records).map_err(shard_err)?;

    check_stop()?;
    // OS randomness keeps proofs non-deterministic.
    let mut rng = OsRng;
    let proof = keys.prove(&mut rng, records, &digest).map_err(shard_err)?;

    check_stop()?;

    // Fail closed: an unverifiable proof is never persisted.
    keys.ensure_valid(&proof, &digest).map_err(shard_err)?;

    let proof_b64 = base64::engine::general_purpose::STANDARD.encode(serialize_proof(&proof).map_err(shard_err)?);
    Ok(NewShard {
        shard_index,
        shard_commitment_hex: fr_to_hex(&digest.commitment).map_err(shard_err)?,
        stats: digest.stats,
        proof_b64,
        verified: true,
    })
}

/// Barrier plus commitment chain: only runs once every shard task has joined successfully.
async fn finalize(state: &AppState, dataset_id: Uuid, shards_total: u64, done: u64) -> Result<String, GenerationError> {
    let verified = state.ledger.count_verified_shards(dataset_id).await?;
    if verified != shards_total || done != shards_total {
        return Err(GenerationError::Barrier { verified, done, total: shards_total });
    }

    let commitments = state
        .ledger
        .shard_commitments(dataset_id)
        .await?
        .iter()
        .map(|h| fr_from_hex(h))
        .collect::<Result<Vec<_>, _>>()
        .map_err(GenerationError::Commitment)?;

    let dataset_commitment = state.keys.scheme().chain_shard_commitments(&commitments);
    let commitment_hex = fr_to_hex(&dataset_commitment).map_err(GenerationError::Commitment)?;

    let config = &state.config;
    with_retries(config.ledger_write_attempts, config.ledger_retry_backoff, || {
        state.ledger.set_dataset_ready(dataset_id, &commitment_hex)
    })
    .await
    .map_err(|source| GenerationError::LedgerWrite { source })?;

    Ok(commitment_hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::DatasetStatus;
    use crate::synthetic::SyntheticRecords;
    use crate::testing::{TEST_SHARD_SIZE, shared_keys, test_state, test_state_with};
    use cohort_zk::constants::NUM_BUCKETS;
    use cohort_zk::{BucketTable, Record, ShardStats};
    use std::sync::atomic::AtomicU32;

    #[test]
    fn size_validation() {
        assert_eq!(shards_for_size(2000, 1000, 10_000), Ok(2));
        assert!(shards_for_size(0, 1000, 10_000).is_err());
        assert!(shards_for_size(1500, 1000, 10_000).is_err());
        assert!(shards_for_size(20_000, 1000, 10_000).is_err());
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let res: Result<(), LedgerError> = with_retries(3, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LedgerError::Sqlx(sqlx::Error::PoolTimedOut)) }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let calls = AtomicU32::new(0);
        let res = with_retries(3, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n == 0 { Err(LedgerError::Sqlx(sqlx::Error::PoolTimedOut)) } else { Ok(n) } }
        })
        .await;
        assert_eq!(res.unwrap(), 1);
    }

    #[tokio::test]
    async fn state_conflicts_are_not_retried() {
        let calls = AtomicU32::new(0);
        let res: Result<(), LedgerError> = with_retries(5, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LedgerError::NotGenerating { dataset_id: Uuid::nil() }) }
        })
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_shard_insert_is_attempted_once() {
        let (state, _dir) = test_state().await;
        let id = Uuid::new_v4();
        state.ledger.insert_dataset(id, 8, 4, 2).await.unwrap();
        let shard = NewShard {
            shard_index: 0,
            shard_commitment_hex: "01".to_string(),
            stats: ShardStats::zero(),
            proof_b64: "cHJvb2Y=".to_string(),
            verified: true,
        };
        state.ledger.insert_shard(id, &shard).await.unwrap();

        let calls = AtomicU32::new(0);
        let res = with_retries(5, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            state.ledger.insert_shard(id, &shard)
        })
        .await;
        assert!(matches!(res, Err(LedgerError::Sqlx(sqlx::Error::Database(_)))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.ledger.get_dataset(id).await.unwrap().unwrap().shards_done, 1);
    }

    #[test]
    fn shard_errors_name_the_shard() {
        let unverified = GenerationError::Shard { shard_index: 4, source: ZkError::VerificationFailure };
        assert_eq!(unverified.to_string(), "shard 4: proof verification failed");

        let unsatisfied = GenerationError::Shard {
            shard_index: 0,
            source: ZkError::WitnessUnsatisfiable("count sum".to_string()),
        };
        assert_eq!(
            unsatisfied.to_string(),
            "shard 0: witness does not satisfy the shard circuit: count sum"
        );
    }

    #[test]
    fn raised_stop_flag_skips_the_shard() {
        let keys = shared_keys();
        let stop = AtomicBool::new(true);
        let res = prove_shard(&keys, &SyntheticRecords::new(1), 0, &stop);
        assert!(matches!(res, Err(GenerationError::Cancelled)));
    }

    #[tokio::test]
    async fn two_shard_dataset_becomes_ready() {
        let (state, _dir) = test_state().await;
        let (id, job) = create_dataset(&state, Some(2 * TEST_SHARD_SIZE as u64)).await.unwrap();
        job.await.unwrap();

        let row = state.ledger.get_dataset(id).await.unwrap().unwrap();
        assert_eq!(row.status, DatasetStatus::Ready, "error: {:?}", row.error);
        assert_eq!(row.shards_total, 2);
        assert_eq!(row.shards_done, 2);
        assert!(row.error.is_none());

        // The published dataset commitment is the chain over shard commitments in index order.
        let shards = state.ledger.all_shards(id).await.unwrap();
        let commitments: Vec<_> = shards.iter().map(|s| fr_from_hex(&s.shard_commitment_hex).unwrap()).collect();
        let expected = fr_to_hex(&state.keys.scheme().chain_shard_commitments(&commitments)).unwrap();
        assert_eq!(row.dataset_commitment_hex, Some(expected));

        for s in &shards {
            assert_eq!(s.stats.total_count(), TEST_SHARD_SIZE as u64);
            assert_eq!(s.verified, Some(true));
        }
    }

    #[tokio::test]
    async fn bucket_counts_match_the_generator() {
        let (state, _dir) = test_state().await;
        let shards_total = 3u64;
        let (id, job) = create_dataset(&state, Some(shards_total * TEST_SHARD_SIZE as u64)).await.unwrap();
        job.await.unwrap();

        let table = BucketTable::standard();
        let mut expected_counts = [0u64; NUM_BUCKETS];
        let mut expected_sums = [0u64; NUM_BUCKETS];
        for i in 0..shards_total {
            for r in state.records.shard_records(i, TEST_SHARD_SIZE) {
                let b = table.bucket_for_age(r.age).unwrap();
                expected_counts[b] += 1;
                expected_sums[b] += u64::from(r.blood_glucose_mg_dl);
            }
        }

        let mut counts = [0u64; NUM_BUCKETS];
        let mut sums = [0u64; NUM_BUCKETS];
        for s in state.ledger.all_shards(id).await.unwrap() {
            for b in 0..NUM_BUCKETS {
                counts[b] += s.stats.count_by_bucket[b];
                sums[b] += s.stats.sum_glucose_by_bucket[b];
            }
        }
        assert_eq!(counts, expected_counts);
        assert_eq!(sums, expected_sums);
    }

    /// Emits an unbucketable age in one shard.
    struct PoisonedShard {
        inner: SyntheticRecords,
        bad_shard: u64,
    }

    impl RecordSource for PoisonedShard {
        fn shard_records(&self, shard_index: u64, shard_size: usize) -> Vec<Record> {
            let mut records = self.inner.shard_records(shard_index, shard_size);
            if shard_index == self.bad_shard {
                records[0].age = 130;
            }
            records
        }
    }

    #[tokio::test]
    async fn bad_shard_fails_the_whole_dataset() {
        let source = PoisonedShard { inner: SyntheticRecords::new(5), bad_shard: 1 };
        let (state, _dir) = test_state_with(Arc::new(source)).await;
        let (id, job) = create_dataset(&state, Some(3 * TEST_SHARD_SIZE as u64)).await.unwrap();
        job.await.unwrap();

        let row = state.ledger.get_dataset(id).await.unwrap().unwrap();
        assert_eq!(row.status, DatasetStatus::Failed);
        assert!(row.dataset_commitment_hex.is_none());
        let error = row.error.unwrap();
        assert!(error.starts_with("shard 1:"), "{error}");
        assert!(error.contains("age 130"), "{error}");
        assert!(row.shards_done < row.shards_total);
    }

    #[tokio::test]
    async fn rejected_shard_write_fails_the_dataset() {
        let (mut state, _dir) = test_state().await;
        state.config = Arc::new(Config { ledger_write_attempts: 4, ..(*state.config).clone() });
        sqlx::query(
            "CREATE TRIGGER reject_shard_one BEFORE INSERT ON shards WHEN NEW.shard_index = 1 \
             BEGIN SELECT RAISE(ABORT, 'disk full'); END",
        )
        .execute(state.ledger.pool())
        .await
        .unwrap();

        let (id, job) = create_dataset(&state, Some(3 * TEST_SHARD_SIZE as u64)).await.unwrap();
        job.await.unwrap();

        let row = state.ledger.get_dataset(id).await.unwrap().unwrap();
        assert_eq!(row.status, DatasetStatus::Failed);
        assert!(row.dataset_commitment_hex.is_none());
        let error = row.error.unwrap();
        assert!(error.starts_with("shard 1: ledger write failed"), "{error}");
        assert!(error.contains("disk full"), "{error}");
        assert!(row.shards_done < row.shards_total);
        assert!(state.ledger.all_shards(id).await.unwrap().iter().all(|s| s.shard_index != 1));
    }

    #[tokio::test]
    async fn invalid_sizes_never_create_a_dataset() {
        let (state, _dir) = test_state().await;
        assert!(matches!(create_dataset(&state, Some(0)).await, Err(ApiError::BadRequest(_))));
        assert!(matches!(
            create_dataset(&state, Some(TEST_SHARD_SIZE as u64 + 1)).await,
            Err(ApiError::BadRequest(_))
        ));
    }
}
