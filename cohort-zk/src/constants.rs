//! Crate-wide constants shared by the circuit, the native hasher and the ledger.
//!
//! Everything in this file is part of the circuit shape. Changing any value after a verifying key
//! has been published invalidates every proof issued under that key.

/// Default number of records per shard.
///
/// 1000 lets the canonical 1,000,000 record dataset partition into exactly 1000 shards.
pub const DEFAULT_SHARD_SIZE: usize = 1000;

/// Number of age buckets in the cohort table.
pub const NUM_BUCKETS: usize = 6;

/// Inclusive (min_age, max_age) bounds for each bucket, in bucket-index order.
///
/// Buckets cover [0, 120] without gaps or overlap.
pub const AGE_BUCKETS: [(u8, u8); NUM_BUCKETS] = [
    (0, 17),
    (18, 29),
    (30, 39),
    (40, 49),
    (50, 64),
    (65, 120),
];

/// Upper bound (inclusive) for a blood glucose reading in mg/dL.
///
/// The circuit range-checks every measurement against this bound so bucket sums can never wrap
/// the scalar field.
pub const MAX_GLUCOSE_MG_DL: u16 = 1000;

// Poseidon sponge parameters.
//
// Width-3 sponge (rate=2, capacity=1): one permutation absorbs exactly one (age, glucose) pair.
pub const POSEIDON_RATE: usize = 2;
pub const POSEIDON_CAPACITY: usize = 1;
pub const POSEIDON_FULL_ROUNDS: usize = 8;
pub const POSEIDON_PARTIAL_ROUNDS: usize = 57;

/// Poseidon S-box exponent.
pub const POSEIDON_ALPHA: u64 = 5;

/// Curve label reported alongside serialized verifying keys.
pub const CURVE: &str = "bn254";

/// Proof system label reported alongside serialized verifying keys.
pub const PROOF_SYSTEM: &str = "groth16";
