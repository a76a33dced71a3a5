//! Groth16 prover/verifier orchestration for the shard circuit.
//!
//! SECURITY NOTE: Groth16 requires a circuit-specific trusted setup. Keys here come from a single
//! local setup; anyone holding that randomness could forge proofs.

use crate::circuit::HealthShardCircuit;
use crate::commitment::CommitmentScheme;
use crate::error::ZkError;
use crate::shard::CircuitShape;
use crate::types::{Record, ShardDigest};
use ark_bn254::{Bn254, Fr};
use ark_groth16::{Groth16, PreparedVerifyingKey, Proof, ProvingKey, VerifyingKey};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_snark::{CircuitSpecificSetupSNARK, SNARK};
use rand::{CryptoRng, RngCore};

/// Process-wide proving material for one circuit shape.
///
/// Built once at startup and passed by reference to every prove/verify call. Regenerating it
/// invalidates every proof issued under the previous verifying key.
pub struct ShardKeys {
    shape: CircuitShape,
    scheme: CommitmentScheme,
    pk: ProvingKey<Bn254>,
    vk: VerifyingKey<Bn254>,
    pvk: PreparedVerifyingKey<Bn254>,
}

impl ShardKeys {
    /// Run the local trusted setup for `shape`.
    pub fn setup<R: RngCore + CryptoRng>(
        shape: CircuitShape,
        scheme: CommitmentScheme,
        rng: &mut R,
    ) -> Result<Self, ZkError> {
        // Constraints depend only on the shape, so any satisfying-shaped witness will do.
        let dummy_records = vec![Record { age: 0, blood_glucose_mg_dl: 0 }; shape.shard_size];
        let public = shape.build_shard(&scheme, &dummy_records)?;

        let circuit = HealthShardCircuit {
            shape: &shape,
            poseidon: scheme.config(),
            records: dummy_records,
            public,
        };
        let (pk, vk) = Groth16::<Bn254>::circuit_specific_setup(circuit, rng)
            .map_err(|e| ZkError::Ark(format!("{e}")))?;

        Self::from_parts(shape, scheme, pk, vk)
    }

    /// Reassemble keys loaded from storage.
    pub fn from_parts(
        shape: CircuitShape,
        scheme: CommitmentScheme,
        pk: ProvingKey<Bn254>,
        vk: VerifyingKey<Bn254>,
    ) -> Result<Self, ZkError> {
        if pk.vk != vk {
            return Err(ZkError::Serialization("proving key does not embed the verifying key".to_string()));
        }
        let pvk = Groth16::<Bn254>::process_vk(&vk).map_err(|e| ZkError::Ark(format!("{e}")))?;
        Ok(Self { shape, scheme, pk, vk, pvk })
    }

    pub fn shape(&self) -> &CircuitShape {
        &self.shape
    }

    pub fn scheme(&self) -> &CommitmentScheme {
        &self.scheme
    }

    pub fn proving_key(&self) -> &ProvingKey<Bn254> {
        &self.pk
    }

    pub fn verifying_key(&self) -> &VerifyingKey<Bn254> {
        &self.vk
    }

    /// Build the shard's public digest with this key's shape and hash.
    pub fn build_shard(&self, records: &[Record]) -> Result<ShardDigest, ZkError> {
        self.shape.build_shard(&self.scheme, records)
    }

    /// Prove that `claimed` was honestly derived from `records`.
    ///
    /// The witness is re-derived natively first; any disagreement with `claimed` is reported as
    /// `WitnessUnsatisfiable` instead of producing a proof that cannot verify.
    pub fn prove<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
        records: Vec<Record>,
        claimed: &ShardDigest,
    ) -> Result<Proof<Bn254>, ZkError> {
        let derived = self
            .build_shard(&records)
            .map_err(|e| ZkError::WitnessUnsatisfiable(e.to_string()))?;
        if derived.stats != claimed.stats {
            return Err(ZkError::WitnessUnsatisfiable("bucket aggregates do not match records".to_string()));
        }
        if derived.commitment != claimed.commitment {
            return Err(ZkError::WitnessUnsatisfiable("commitment does not match records".to_string()));
        }
        if claimed.stats.total_count() != self.shape.shard_size as u64 {
            return Err(ZkError::WitnessUnsatisfiable("bucket counts do not sum to shard size".to_string()));
        }

        let circuit = HealthShardCircuit {
            shape: &self.shape,
            poseidon: self.scheme.config(),
            records,
            public: claimed.clone(),
        };
        Groth16::<Bn254>::prove(&self.pk, circuit, rng).map_err(|e| ZkError::Ark(format!("{e}")))
    }

    /// Check a proof against its public digest. Deterministic and side-effect free.
    pub fn verify(&self, proof: &Proof<Bn254>, public: &ShardDigest) -> Result<bool, ZkError> {
        Groth16::<Bn254>::verify_with_processed_vk(&self.pvk, &public.public_inputs(), proof)
            .map_err(|e| ZkError::Ark(format!("{e}")))
    }

    /// Like `verify`, but a `false` result becomes `VerificationFailure`.
    pub fn ensure_valid(&self, proof: &Proof<Bn254>, public: &ShardDigest) -> Result<(), ZkError> {
        if !self.verify(proof, public)? {
            return Err(ZkError::VerificationFailure);
        }
        Ok(())
    }
}

/// Verify against an arbitrary verifying key, e.g. one supplied by an external auditor.
pub fn verify_with_vk(vk: &VerifyingKey<Bn254>, proof: &Proof<Bn254>, public: &ShardDigest) -> Result<bool, ZkError> {
    Groth16::<Bn254>::verify(vk, &public.public_inputs(), proof).map_err(|e| ZkError::Ark(format!("{e}")))
}

fn to_bytes<T: CanonicalSerialize>(value: &T) -> Result<Vec<u8>, ZkError> {
    let mut out = Vec::new();
    value
        .serialize_compressed(&mut out)
        .map_err(|e| ZkError::Serialization(format!("{e}")))?;
    Ok(out)
}

fn from_bytes<T: CanonicalDeserialize>(bytes: &[u8]) -> Result<T, ZkError> {
    T::deserialize_compressed(bytes).map_err(|e| ZkError::Serialization(format!("{e}")))
}

pub fn serialize_pk(pk: &ProvingKey<Bn254>) -> Result<Vec<u8>, ZkError> {
    to_bytes(pk)
}

pub fn deserialize_pk(bytes: &[u8]) -> Result<ProvingKey<Bn254>, ZkError> {
    from_bytes(bytes)
}

pub fn serialize_vk(vk: &VerifyingKey<Bn254>) -> Result<Vec<u8>, ZkError> {
    to_bytes(vk)
}

pub fn deserialize_vk(bytes: &[u8]) -> Result<VerifyingKey<Bn254>, ZkError> {
    from_bytes(bytes)
}

pub fn serialize_proof(proof: &Proof<Bn254>) -> Result<Vec<u8>, ZkError> {
    to_bytes(proof)
}

pub fn deserialize_proof(bytes: &[u8]) -> Result<Proof<Bn254>, ZkError> {
    from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_ff::PrimeField;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use std::sync::OnceLock;

    const SHARD: usize = 4;

    fn keys() -> &'static ShardKeys {
        static KEYS: OnceLock<ShardKeys> = OnceLock::new();
        KEYS.get_or_init(|| {
            let mut rng = ChaCha20Rng::seed_from_u64(1);
            ShardKeys::setup(CircuitShape::new(SHARD), CommitmentScheme::poseidon(), &mut rng).unwrap()
        })
    }

    fn records() -> Vec<Record> {
        vec![
            Record { age: 12, blood_glucose_mg_dl: 88 },
            Record { age: 25, blood_glucose_mg_dl: 101 },
            Record { age: 47, blood_glucose_mg_dl: 133 },
            Record { age: 80, blood_glucose_mg_dl: 176 },
        ]
    }

    fn proved() -> (Proof<Bn254>, ShardDigest) {
        let keys = keys();
        let digest = keys.build_shard(&records()).unwrap();
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let proof = keys.prove(&mut rng, records(), &digest).unwrap();
        (proof, digest)
    }

    fn flip_low_bit(x: Fr) -> Fr {
        let mut repr = x.into_bigint();
        repr.0[0] ^= 1;
        Fr::from_bigint(repr).unwrap()
    }

    #[test]
    fn honest_proof_verifies() {
        let (proof, digest) = proved();
        assert!(keys().verify(&proof, &digest).unwrap());
        keys().ensure_valid(&proof, &digest).unwrap();
        assert!(verify_with_vk(keys().verifying_key(), &proof, &digest).unwrap());
    }

    #[test]
    fn flipping_any_public_input_bit_fails() {
        let (proof, digest) = proved();

        let mut tampered = digest.clone();
        tampered.commitment = flip_low_bit(digest.commitment);
        assert!(!keys().verify(&proof, &tampered).unwrap());

        for i in 0..crate::constants::NUM_BUCKETS {
            for bit in [0u32, 5] {
                let mut t = digest.clone();
                t.stats.sum_glucose_by_bucket[i] ^= 1 << bit;
                assert!(!keys().verify(&proof, &t).unwrap(), "sum {i} bit {bit}");

                let mut t = digest.clone();
                t.stats.count_by_bucket[i] ^= 1 << bit;
                assert!(!keys().verify(&proof, &t).unwrap(), "count {i} bit {bit}");
            }
        }
        assert!(matches!(keys().ensure_valid(&proof, &tampered), Err(ZkError::VerificationFailure)));
    }

    #[test]
    fn mismatched_claim_is_unsatisfiable() {
        let keys = keys();
        let mut digest = keys.build_shard(&records()).unwrap();
        digest.stats.sum_glucose_by_bucket[1] += 1;
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        assert!(matches!(
            keys.prove(&mut rng, records(), &digest),
            Err(ZkError::WitnessUnsatisfiable(_))
        ));
    }

    #[test]
    fn out_of_range_witness_is_unsatisfiable() {
        let keys = keys();
        let digest = keys.build_shard(&records()).unwrap();
        let mut bad = records();
        bad[0].age = 200;
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        assert!(matches!(keys.prove(&mut rng, bad, &digest), Err(ZkError::WitnessUnsatisfiable(_))));
    }

    #[test]
    fn keys_and_proofs_survive_serialization() {
        let (proof, digest) = proved();
        let keys = keys();

        let vk = deserialize_vk(&serialize_vk(keys.verifying_key()).unwrap()).unwrap();
        let proof = deserialize_proof(&serialize_proof(&proof).unwrap()).unwrap();
        assert!(verify_with_vk(&vk, &proof, &digest).unwrap());

        let pk = deserialize_pk(&serialize_pk(keys.proving_key()).unwrap()).unwrap();
        let reloaded = ShardKeys::from_parts(keys.shape().clone(), keys.scheme().clone(), pk, vk).unwrap();
        assert!(reloaded.verify(&proof, &digest).unwrap());
    }

    #[test]
    fn garbage_proof_bytes_are_rejected() {
        assert!(matches!(deserialize_proof(&[1, 2, 3]), Err(ZkError::Serialization(_))));
    }
}
