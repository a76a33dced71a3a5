//! Shard building: turn an ordered slice of records into its public commitment and aggregates.

use crate::buckets::BucketTable;
use crate::commitment::CommitmentScheme;
use crate::constants::{
    DEFAULT_SHARD_SIZE, MAX_GLUCOSE_MG_DL, POSEIDON_ALPHA, POSEIDON_FULL_ROUNDS, POSEIDON_PARTIAL_ROUNDS,
    POSEIDON_RATE,
};
use crate::error::ZkError;
use crate::types::{Record, ShardDigest, ShardStats};
use serde::{Deserialize, Serialize};

/// Everything that fixes the constraint system. Keys are only valid for the shape they were made for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitShape {
    pub shard_size: usize,
    pub buckets: BucketTable,
    pub max_glucose: u16,
    pub poseidon: PoseidonShape,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoseidonShape {
    pub rate: usize,
    pub full_rounds: usize,
    pub partial_rounds: usize,
    pub alpha: u64,
}

impl CircuitShape {
    pub fn new(shard_size: usize) -> Self {
        Self {
            shard_size,
            buckets: BucketTable::standard(),
            max_glucose: MAX_GLUCOSE_MG_DL,
            poseidon: PoseidonShape {
                rate: POSEIDON_RATE,
                full_rounds: POSEIDON_FULL_ROUNDS,
                partial_rounds: POSEIDON_PARTIAL_ROUNDS,
                alpha: POSEIDON_ALPHA,
            },
        }
    }

    pub fn max_age(&self) -> u8 {
        self.buckets.max_age()
    }

    /// Build the public side of a shard.
    ///
    /// Fails with `OutOfRangeAge` if any age has no bucket, and with `MeasurementOutOfRange` if a
    /// reading exceeds what the circuit can range-check.
    pub fn build_shard(&self, scheme: &CommitmentScheme, records: &[Record]) -> Result<ShardDigest, ZkError> {
        if records.len() != self.shard_size {
            return Err(ZkError::InvalidShardSize { expected: self.shard_size, got: records.len() });
        }

        let mut stats = ShardStats::zero();
        for (position, r) in records.iter().enumerate() {
            let b = self
                .buckets
                .bucket_for_age(r.age)
                .ok_or(ZkError::OutOfRangeAge { position, age: r.age })?;
            if r.blood_glucose_mg_dl > self.max_glucose {
                return Err(ZkError::MeasurementOutOfRange {
                    position,
                    glucose: r.blood_glucose_mg_dl,
                    bound: self.max_glucose,
                });
            }
            stats.sum_glucose_by_bucket[b] += u64::from(r.blood_glucose_mg_dl);
            stats.count_by_bucket[b] += 1;
        }

        let commitment = scheme.commit_records(records);
        Ok(ShardDigest { commitment, stats })
    }
}

impl Default for CircuitShape {
    fn default() -> Self {
        Self::new(DEFAULT_SHARD_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard_with(bucket0: usize, shard_size: usize) -> Vec<Record> {
        let mut records = Vec::with_capacity(shard_size);
        for i in 0..shard_size {
            if i < bucket0 {
                // 42 * 95 = 3990, topped up below to 4000.
                records.push(Record { age: 10, blood_glucose_mg_dl: 95 });
            } else {
                records.push(Record { age: 40, blood_glucose_mg_dl: 120 });
            }
        }
        records
    }

    #[test]
    fn aggregates_for_a_mixed_shard() {
        let shape = CircuitShape::new(1000);
        let scheme = CommitmentScheme::poseidon();
        let mut records = shard_with(42, 1000);
        records[0].blood_glucose_mg_dl = 105;

        let digest = shape.build_shard(&scheme, &records).unwrap();
        assert_eq!(digest.stats.sum_glucose_by_bucket[0], 4000);
        assert_eq!(digest.stats.count_by_bucket[0], 42);
        assert_eq!(digest.stats.count_by_bucket[3], 958);
        assert_eq!(digest.stats.total_count(), 1000);
        assert_eq!(digest.commitment, scheme.commit_records(&records));
    }

    #[test]
    fn rejects_wrong_length() {
        let shape = CircuitShape::new(4);
        let scheme = CommitmentScheme::poseidon();
        let err = shape.build_shard(&scheme, &shard_with(0, 3)).unwrap_err();
        assert!(matches!(err, ZkError::InvalidShardSize { expected: 4, got: 3 }));
    }

    #[test]
    fn rejects_age_outside_buckets() {
        let shape = CircuitShape::new(4);
        let scheme = CommitmentScheme::poseidon();
        let mut records = shard_with(0, 4);
        records[2].age = 121;
        let err = shape.build_shard(&scheme, &records).unwrap_err();
        assert!(matches!(err, ZkError::OutOfRangeAge { position: 2, age: 121 }));
    }

    #[test]
    fn rejects_glucose_over_bound() {
        let shape = CircuitShape::new(4);
        let scheme = CommitmentScheme::poseidon();
        let mut records = shard_with(0, 4);
        records[1].blood_glucose_mg_dl = MAX_GLUCOSE_MG_DL + 1;
        assert!(matches!(
            shape.build_shard(&scheme, &records),
            Err(ZkError::MeasurementOutOfRange { position: 1, .. })
        ));
    }
}
