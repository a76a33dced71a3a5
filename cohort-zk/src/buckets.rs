//! The cohort bucket table: the only filter a query may use.

use crate::constants::{AGE_BUCKETS, NUM_BUCKETS};
use crate::error::ZkError;
use serde::{Deserialize, Serialize};

/// One inclusive age range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub index: usize,
    pub min_age: u8,
    pub max_age: u8,
}

impl Bucket {
    pub fn contains(&self, age: u8) -> bool {
        age >= self.min_age && age <= self.max_age
    }
}

/// Ordered, contiguous, non-overlapping age buckets starting at 0.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketTable {
    buckets: [Bucket; NUM_BUCKETS],
}

impl BucketTable {
    /// Build a table from (min_age, max_age) pairs, rejecting gaps, overlaps and inverted ranges.
    pub fn new(ranges: [(u8, u8); NUM_BUCKETS]) -> Result<Self, ZkError> {
        let mut expected_min = 0u16;
        for (i, (min, max)) in ranges.iter().enumerate() {
            if *min > *max {
                return Err(ZkError::InvalidBucketTable(format!("bucket {i} has min {min} > max {max}")));
            }
            if u16::from(*min) != expected_min {
                return Err(ZkError::InvalidBucketTable(format!(
                    "bucket {i} starts at {min}, expected {expected_min}"
                )));
            }
            expected_min = u16::from(*max) + 1;
        }

        let buckets = std::array::from_fn(|index| Bucket {
            index,
            min_age: ranges[index].0,
            max_age: ranges[index].1,
        });
        Ok(Self { buckets })
    }

    /// The deployment's fixed table.
    pub fn standard() -> Self {
        Self {
            buckets: std::array::from_fn(|index| Bucket {
                index,
                min_age: AGE_BUCKETS[index].0,
                max_age: AGE_BUCKETS[index].1,
            }),
        }
    }

    pub fn buckets(&self) -> &[Bucket; NUM_BUCKETS] {
        &self.buckets
    }

    pub fn get(&self, index: usize) -> Option<&Bucket> {
        self.buckets.get(index)
    }

    /// Largest age any bucket accepts. The circuit uses it as the age range-check bound.
    pub fn max_age(&self) -> u8 {
        self.buckets[NUM_BUCKETS - 1].max_age
    }

    /// Map an age to its bucket index; `None` if no bucket contains it.
    pub fn bucket_for_age(&self, age: u8) -> Option<usize> {
        self.buckets.iter().position(|b| b.contains(age))
    }

    /// Resolve a query range by exact bound match.
    pub fn bucket_for_range(&self, min_age: u8, max_age: u8) -> Option<usize> {
        self.buckets
            .iter()
            .position(|b| b.min_age == min_age && b.max_age == max_age)
    }
}

impl Default for BucketTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_table_is_valid() {
        let table = BucketTable::new(AGE_BUCKETS).unwrap();
        assert_eq!(table, BucketTable::standard());
        assert_eq!(table.max_age(), 120);
    }

    #[test]
    fn every_age_maps_to_exactly_one_bucket() {
        let table = BucketTable::standard();
        for age in 0..=120u8 {
            let hits = table.buckets().iter().filter(|b| b.contains(age)).count();
            assert_eq!(hits, 1, "age {age}");
        }
        assert_eq!(table.bucket_for_age(17), Some(0));
        assert_eq!(table.bucket_for_age(18), Some(1));
        assert_eq!(table.bucket_for_age(120), Some(5));
        assert_eq!(table.bucket_for_age(121), None);
    }

    #[test]
    fn ranges_must_match_exactly() {
        let table = BucketTable::standard();
        assert_eq!(table.bucket_for_range(30, 39), Some(2));
        assert_eq!(table.bucket_for_range(30, 40), None);
        assert_eq!(table.bucket_for_range(18, 39), None);
    }

    #[test]
    fn rejects_gaps_and_overlaps() {
        let gap = [(0, 17), (19, 29), (30, 39), (40, 49), (50, 64), (65, 120)];
        assert!(matches!(BucketTable::new(gap), Err(ZkError::InvalidBucketTable(_))));

        let overlap = [(0, 17), (17, 29), (30, 39), (40, 49), (50, 64), (65, 120)];
        assert!(BucketTable::new(overlap).is_err());

        let inverted = [(0, 17), (18, 29), (39, 30), (40, 49), (50, 64), (65, 120)];
        assert!(BucketTable::new(inverted).is_err());
    }
}
