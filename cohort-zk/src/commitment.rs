//! Poseidon commitments: the per-shard record commitment and the dataset chain over shard commitments.

use crate::constants::{
    POSEIDON_ALPHA, POSEIDON_CAPACITY, POSEIDON_FULL_ROUNDS, POSEIDON_PARTIAL_ROUNDS, POSEIDON_RATE,
};
use crate::types::Record;
use ark_bn254::Fr;
use ark_crypto_primitives::sponge::poseidon::{PoseidonConfig, PoseidonSponge, find_poseidon_ark_and_mds};
use ark_crypto_primitives::sponge::CryptographicSponge;
use ark_ff::PrimeField;
use std::sync::Arc;

/// Deterministically derive Poseidon parameters for BN254::Fr.
///
/// Both the native hasher and the in-circuit gadget read the same constants from this.
pub fn poseidon_config() -> PoseidonConfig<Fr> {
    let prime_bits = Fr::MODULUS_BIT_SIZE as u64;

    let (ark, mds) = find_poseidon_ark_and_mds::<Fr>(
        prime_bits,
        POSEIDON_RATE,
        POSEIDON_FULL_ROUNDS as u64,
        POSEIDON_PARTIAL_ROUNDS as u64,
        0,
    );

    PoseidonConfig::new(
        POSEIDON_FULL_ROUNDS,
        POSEIDON_PARTIAL_ROUNDS,
        POSEIDON_ALPHA,
        mds,
        ark,
        POSEIDON_RATE,
        POSEIDON_CAPACITY,
    )
}

/// The algebraic hash used for every commitment in the system.
///
/// Deriving the round constants is not free, so the config is built once and shared.
#[derive(Clone, Debug)]
pub struct CommitmentScheme {
    config: Arc<PoseidonConfig<Fr>>,
}

impl CommitmentScheme {
    pub fn poseidon() -> Self {
        Self { config: Arc::new(poseidon_config()) }
    }

    pub fn config(&self) -> &PoseidonConfig<Fr> {
        &self.config
    }

    fn sponge(&self) -> PoseidonSponge<Fr> {
        PoseidonSponge::<Fr>::new(&self.config)
    }

    /// Commit to an ordered record sequence. Record order is part of the commitment.
    pub fn commit_records(&self, records: &[Record]) -> Fr {
        let mut sponge = self.sponge();
        for r in records {
            absorb_record(&mut sponge, r);
        }
        sponge.squeeze_field_elements::<Fr>(1)[0]
    }

    /// Fold shard commitments, ordered by shard index, into the dataset commitment.
    pub fn chain_shard_commitments(&self, shard_commitments: &[Fr]) -> Fr {
        let mut sponge = self.sponge();
        for c in shard_commitments {
            sponge.absorb(c);
        }
        sponge.squeeze_field_elements::<Fr>(1)[0]
    }
}

impl Default for CommitmentScheme {
    fn default() -> Self {
        Self::poseidon()
    }
}

/// Absorb order per record: age, then glucose. The circuit mirrors this exactly.
pub(crate) fn absorb_record(sponge: &mut PoseidonSponge<Fr>, r: &Record) {
    sponge.absorb(&Fr::from(u64::from(r.age)));
    sponge.absorb(&Fr::from(u64::from(r.blood_glucose_mg_dl)));
}
