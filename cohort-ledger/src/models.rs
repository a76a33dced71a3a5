//! Typed request/response schemas for the HTTP surface.

use chrono::{DateTime, Utc};
use cohort_zk::constants::NUM_BUCKETS;
use cohort_zk::Bucket;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    Generating,
    Ready,
    Failed,
}

impl DatasetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetStatus::Generating => "generating",
            DatasetStatus::Ready => "ready",
            DatasetStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generating" => Ok(DatasetStatus::Generating),
            "ready" => Ok(DatasetStatus::Ready),
            "failed" => Ok(DatasetStatus::Failed),
            other => Err(format!("unknown dataset status {other:?}")),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetCreateRequest {
    /// Total number of synthetic records to commit. Must be a positive multiple of the shard size.
    pub dataset_size: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatasetCreateResponse {
    pub dataset_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatasetGetResponse {
    pub dataset_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub dataset_size: u64,
    pub shard_size: u64,
    pub num_buckets: u64,
    pub status: DatasetStatus,
    pub shards_total: u64,
    pub shards_done: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_commitment_hex: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Count,
    Sum,
    Mean,
}

/// The only measurement a query may aggregate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Field {
    #[serde(rename = "blood_glucose", alias = "blood_glucose_mg_dl")]
    BloodGlucose,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgeRange {
    pub min_age: u8,
    pub max_age: u8,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryRequest {
    pub dataset_id: Uuid,
    pub metric: Metric,
    pub field: Field,
    /// Must equal one configured bucket exactly.
    pub age_range: AgeRange,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query_id: Uuid,
    pub dataset_id: Uuid,
    pub metric: Metric,

    pub bucket_index: usize,
    pub bucket_range: (u8, u8),

    pub sum_glucose: u64,
    pub count: u64,
    pub mean_glucose: Option<f64>,

    /// True only if every shard backing the dataset has a verified proof.
    pub server_verified: bool,

    /// Where a researcher can fetch shard proofs and public inputs for independent verification.
    pub shard_proofs_endpoint: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListShardsParams {
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub include_proof: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ShardListResponse {
    pub dataset_id: Uuid,
    pub offset: u64,
    pub limit: u64,
    pub shards_total: u64,
    pub shards: Vec<ShardListItem>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ShardListItem {
    pub shard_index: u64,
    pub shard_commitment_hex: String,

    pub sum_glucose_by_bucket: [u64; NUM_BUCKETS],
    pub count_by_bucket: [u64; NUM_BUCKETS],

    /// `None` until the verifier has run for this shard.
    pub verified: Option<bool>,

    /// Included only if requested (large).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_b64: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BucketsResponse {
    pub buckets: Vec<Bucket>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ZkVkResponse {
    pub curve: String,
    pub proof_system: String,
    pub shard_size: u64,
    pub vk_b64: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyShardRequest {
    /// Defaults to the server's verifying key when omitted.
    pub vk_b64: Option<String>,
    pub proof_b64: String,

    pub public_shard_commitment_hex: String,
    pub public_sum_glucose_by_bucket: [u64; NUM_BUCKETS],
    pub public_count_by_bucket: [u64; NUM_BUCKETS],
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyShardResponse {
    pub ok: bool,
}
