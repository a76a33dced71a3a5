//! Types shared between the circuit and the host-side prover/verifier.

use crate::constants::NUM_BUCKETS;
use crate::error::ZkError;
use ark_bn254::Fr;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use serde::{Deserialize, Serialize};

/// One private health record.
///
/// Records only live long enough to be absorbed into a commitment and a proof witness.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Age in years.
    pub age: u8,
    /// Blood glucose (mg/dL).
    pub blood_glucose_mg_dl: u16,
}

/// A shard's aggregate statistics, bucketed by age.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardStats {
    /// Sum of blood glucose per age bucket.
    pub sum_glucose_by_bucket: [u64; NUM_BUCKETS],
    /// Count of records per age bucket.
    pub count_by_bucket: [u64; NUM_BUCKETS],
}

impl ShardStats {
    pub fn zero() -> Self {
        Self {
            sum_glucose_by_bucket: [0u64; NUM_BUCKETS],
            count_by_bucket: [0u64; NUM_BUCKETS],
        }
    }

    pub fn total_count(&self) -> u64 {
        self.count_by_bucket.iter().sum()
    }
}

/// Public output of the shard builder: everything a verifier sees about a shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardDigest {
    pub commitment: Fr,
    pub stats: ShardStats,
}

impl ShardDigest {
    /// Public-input vector in circuit allocation order: commitment, sums[0..B), counts[0..B).
    pub fn public_inputs(&self) -> Vec<Fr> {
        let mut v = Vec::with_capacity(1 + 2 * NUM_BUCKETS);
        v.push(self.commitment);
        v.extend(self.stats.sum_glucose_by_bucket.iter().map(|s| Fr::from(*s)));
        v.extend(self.stats.count_by_bucket.iter().map(|c| Fr::from(*c)));
        v
    }
}

/// JSON-friendly public inputs for a shard proof.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardPublicInputs {
    pub shard_commitment_hex: String,
    pub sum_glucose_by_bucket: [u64; NUM_BUCKETS],
    pub count_by_bucket: [u64; NUM_BUCKETS],
}

impl ShardPublicInputs {
    pub fn to_digest(&self) -> Result<ShardDigest, ZkError> {
        Ok(ShardDigest {
            commitment: fr_from_hex(&self.shard_commitment_hex)?,
            stats: ShardStats {
                sum_glucose_by_bucket: self.sum_glucose_by_bucket,
                count_by_bucket: self.count_by_bucket,
            },
        })
    }
}

/// Hex of arkworks' canonical compressed encoding, so every component agrees on one form.
pub fn fr_to_hex(x: &Fr) -> Result<String, ZkError> {
    let mut bytes = Vec::new();
    x.serialize_compressed(&mut bytes)
        .map_err(|e| ZkError::Serialization(format!("{e}")))?;
    Ok(hex::encode(bytes))
}

pub fn fr_from_hex(s: &str) -> Result<Fr, ZkError> {
    let bytes = hex::decode(s).map_err(|e| ZkError::Serialization(format!("invalid hex: {e}")))?;
    Fr::deserialize_compressed(&bytes[..])
        .map_err(|e| ZkError::Serialization(format!("invalid field bytes: {e}")))
}
