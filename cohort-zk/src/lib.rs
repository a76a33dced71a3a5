//! ZK layer for the cohort statistics ledger.
//!
//! This crate contains:
//! - The fixed age bucket table.
//! - Poseidon commitments for shards and the dataset chain.
//! - A SNARK circuit proving shard-level aggregates were computed from committed records.
//! - Groth16 key material, prover and verifier, plus serialization helpers.

pub mod buckets;
pub mod circuit;
pub mod commitment;
pub mod constants;
pub mod error;
pub mod groth16;
pub mod shard;
pub mod types;

pub use buckets::{Bucket, BucketTable};
pub use commitment::CommitmentScheme;
pub use error::ZkError;
pub use groth16::ShardKeys;
pub use shard::CircuitShape;
pub use types::{Record, ShardDigest, ShardPublicInputs, ShardStats};
