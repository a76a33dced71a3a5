//! Where shard records come from.
//!
//! The service never stores raw records; a source regenerates them per shard on demand.

use cohort_zk::Record;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

pub trait RecordSource: Send + Sync + 'static {
    /// The ordered records of one shard.
    fn shard_records(&self, shard_index: u64, shard_size: usize) -> Vec<Record>;
}

/// Deterministic synthetic population: ages uniform in [0, 120], glucose uniform in [70, 180].
#[derive(Clone, Copy, Debug)]
pub struct SyntheticRecords {
    pub seed: u64,
}

impl SyntheticRecords {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Per-shard RNG seed, so shards can be generated independently and in any order.
    fn shard_seed(&self, shard_index: u64) -> [u8; 32] {
        let mut seed = [0u8; 32];
        seed[0..8].copy_from_slice(&self.seed.to_le_bytes());
        seed[8..16].copy_from_slice(&shard_index.to_le_bytes());
        seed[16..].copy_from_slice(&[7u8; 16]);
        seed
    }
}

fn gen_record(rng: &mut ChaCha20Rng) -> Record {
    let age = (rng.next_u32() % 121) as u8;
    let glucose = 70u16 + (rng.next_u32() % 111) as u16;

    Record { age, blood_glucose_mg_dl: glucose }
}

impl RecordSource for SyntheticRecords {
    fn shard_records(&self, shard_index: u64, shard_size: usize) -> Vec<Record> {
        let mut rng = ChaCha20Rng::from_seed(self.shard_seed(shard_index));
        (0..shard_size).map(|_| gen_record(&mut rng)).collect()
    }
}
