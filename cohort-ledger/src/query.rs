//! Bucketed aggregate queries over the verified shard aggregates of a ready dataset.

use crate::db::{Ledger, LedgerError, ShardRow};
use crate::models::{AgeRange, DatasetStatus};
use base64::Engine;
use cohort_zk::constants::NUM_BUCKETS;
use cohort_zk::groth16::deserialize_proof;
use cohort_zk::types::fr_from_hex;
use cohort_zk::{Bucket, ShardDigest, ShardKeys, ZkError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("dataset {0} not found")]
    DatasetNotFound(Uuid),

    #[error("dataset {dataset_id} is {status}, not ready")]
    DatasetNotReady { dataset_id: Uuid, status: DatasetStatus },

    #[error("age range {min_age}..={max_age} does not match a configured bucket")]
    InvalidBucket { min_age: u8, max_age: u8 },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("shard verifier error: {0}")]
    Verifier(#[from] ZkError),
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryResult {
    pub bucket: Bucket,
    pub sum: u64,
    pub count: u64,
    pub mean: Option<f64>,
    pub server_verified: bool,
}

/// Answer one bucket query. Never writes anything except missing verification flags.
pub async fn evaluate(
    ledger: &Ledger,
    keys: &Arc<ShardKeys>,
    dataset_id: Uuid,
    age_range: AgeRange,
) -> Result<QueryResult, QueryError> {
    let dataset = ledger
        .get_dataset(dataset_id)
        .await?
        .ok_or(QueryError::DatasetNotFound(dataset_id))?;
    if dataset.status != DatasetStatus::Ready {
        return Err(QueryError::DatasetNotReady { dataset_id, status: dataset.status });
    }

    let table = &keys.shape().buckets;
    let bucket = table
        .bucket_for_range(age_range.min_age, age_range.max_age)
        .and_then(|idx| table.get(idx))
        .copied()
        .ok_or(QueryError::InvalidBucket { min_age: age_range.min_age, max_age: age_range.max_age })?;

    let shards = ledger.all_shards(dataset_id).await?;

    let (sum, count) = aggregate(&shards, bucket.index);
    let mean = (count > 0).then(|| sum as f64 / count as f64);

    let mut server_verified = shards.len() as u64 == dataset.shards_total;
    for shard in &shards {
        let ok = match shard.verified {
            Some(v) => v,
            None => reverify(ledger, keys, dataset_id, shard).await?,
        };
        server_verified &= ok;
    }

    Ok(QueryResult { bucket, sum, count, mean, server_verified })
}

/// Sum one bucket's aggregates across shards.
pub fn aggregate(shards: &[ShardRow], bucket_index: usize) -> (u64, u64) {
    debug_assert!(bucket_index < NUM_BUCKETS);
    shards.iter().fold((0u64, 0u64), |(sum, count), s| {
        (
            sum + s.stats.sum_glucose_by_bucket[bucket_index],
            count + s.stats.count_by_bucket[bucket_index],
        )
    })
}

/// Verify a shard that has no cached flag yet, then cache the outcome.
async fn reverify(
    ledger: &Ledger,
    keys: &Arc<ShardKeys>,
    dataset_id: Uuid,
    shard: &ShardRow,
) -> Result<bool, QueryError> {
    let Some(proof_b64) = ledger.shard_proof(dataset_id, shard.shard_index).await? else {
        return Ok(false);
    };

    let keys = keys.clone();
    let commitment_hex = shard.shard_commitment_hex.clone();
    let stats = shard.stats.clone();
    let shard_index = shard.shard_index;

    let ok = tokio::task::spawn_blocking(move || -> Result<bool, ZkError> {
        let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(proof_b64) else {
            warn!(shard_index, "stored proof is not valid base64");
            return Ok(false);
        };
        let (Ok(proof), Ok(commitment)) = (deserialize_proof(&bytes), fr_from_hex(&commitment_hex)) else {
            warn!(shard_index, "stored proof or commitment does not decode");
            return Ok(false);
        };
        keys.verify(&proof, &ShardDigest { commitment, stats })
    })
    .await
    .map_err(|e| ZkError::Ark(format!("verifier task failed: {e}")))??;

    // Another query may have cached a result first; whatever is stored wins.
    if !ledger.record_verification(dataset_id, shard_index, ok).await? {
        debug!(%dataset_id, shard_index, "verification flag already cached");
    }
    Ok(ok)
}
