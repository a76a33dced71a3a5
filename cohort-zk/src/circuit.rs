//! R1CS circuit for proving shard-level aggregate correctness.
//!
//! What this circuit proves (for one shard):
//! 1) The prover knows `shard_size` private records (age, glucose), each range-checked.
//! 2) A public commitment `C` equals Poseidon(records) in record order.
//! 3) The public sums/counts for each age bucket equal the aggregates computed from those records,
//!    and the counts add up to `shard_size`.
//!
//! Privacy: the records are witnesses (never public). Only aggregates + commitment are public.

use crate::constants::NUM_BUCKETS;
use crate::shard::CircuitShape;
use crate::types::{Record, ShardDigest};
use ark_bn254::Fr;
use ark_crypto_primitives::sponge::constraints::CryptographicSpongeVar;
use ark_crypto_primitives::sponge::poseidon::PoseidonConfig;
use ark_crypto_primitives::sponge::poseidon::constraints::PoseidonSpongeVar;
use ark_r1cs_std::alloc::AllocVar;
use ark_r1cs_std::boolean::Boolean;
use ark_r1cs_std::eq::EqGadget;
use ark_r1cs_std::fields::fp::FpVar;
use ark_relations::r1cs::{ConstraintSynthesizer, ConstraintSystem, ConstraintSystemRef, SynthesisError};

fn fp_const(v: u64) -> FpVar<Fr> {
    FpVar::Constant(Fr::from(v))
}

/// Number of bits needed to represent `bound`.
fn bit_width(bound: u64) -> usize {
    (u64::BITS - bound.leading_zeros()).max(1) as usize
}

/// Recompose little-endian boolean bits into a field element. Purely linear.
fn bits_le_to_fp(bits_le: &[Boolean<Fr>]) -> FpVar<Fr> {
    let mut acc = fp_const(0);
    let mut coeff = Fr::from(1u64);
    for b in bits_le {
        acc += FpVar::from(b.clone()) * coeff;
        coeff = coeff + coeff;
    }
    acc
}

/// Boolean gadget: `a <= c` for an unsigned value given as little-endian bits.
fn leq_const(a_bits_le: &[Boolean<Fr>], c: u64) -> Result<Boolean<Fr>, SynthesisError> {
    let n = a_bits_le.len();
    if n >= 64 || c >= (1u64 << n) - 1 {
        return Ok(Boolean::constant(true));
    }

    // Lexicographic compare from MSB to LSB.
    let mut less = Boolean::constant(false);
    let mut equal = Boolean::constant(true);
    for i in (0..n).rev() {
        let a_i = a_bits_le[i].clone();
        if (c >> i) & 1 == 1 {
            let less_here = Boolean::kary_and(&[equal.clone(), !a_i.clone()])?;
            less = Boolean::kary_or(&[less, less_here])?;
            equal = Boolean::kary_and(&[equal, a_i])?;
        } else {
            equal = Boolean::kary_and(&[equal, !a_i])?;
        }
    }

    Boolean::kary_or(&[less, equal])
}

/// Boolean gadget: `min <= a <= max`.
fn in_range(a_bits_le: &[Boolean<Fr>], min: u64, max: u64) -> Result<Boolean<Fr>, SynthesisError> {
    let le = leq_const(a_bits_le, max)?;
    if min == 0 {
        return Ok(le);
    }
    // a >= min  <=>  !(a <= min - 1)
    let ge = !leq_const(a_bits_le, min - 1)?;
    Boolean::kary_and(&[ge, le])
}

/// Allocate `value` as exactly `bit_width(bound)` witness bits, enforce `value <= bound`, and
/// return (value, bits).
fn alloc_bounded(
    cs: &ConstraintSystemRef<Fr>,
    value: u64,
    bound: u64,
) -> Result<(FpVar<Fr>, Vec<Boolean<Fr>>), SynthesisError> {
    let bits = (0..bit_width(bound))
        .map(|i| Boolean::new_witness(cs.clone(), || Ok((value >> i) & 1 == 1)))
        .collect::<Result<Vec<_>, _>>()?;
    leq_const(&bits, bound)?.enforce_equal(&Boolean::constant(true))?;
    Ok((bits_le_to_fp(&bits), bits))
}

/// Circuit proving shard commitment binding and bucketed aggregates.
#[derive(Clone, Debug)]
pub struct HealthShardCircuit<'a> {
    pub shape: &'a CircuitShape,
    pub poseidon: &'a PoseidonConfig<Fr>,

    /// Private records.
    pub records: Vec<Record>,

    /// Claimed public values.
    pub public: ShardDigest,
}

impl ConstraintSynthesizer<Fr> for HealthShardCircuit<'_> {
    fn generate_constraints(self, cs: ConstraintSystemRef<Fr>) -> Result<(), SynthesisError> {
        // --- Public inputs ---
        // Allocation order MUST match `ShardDigest::public_inputs`.
        let public_commitment = FpVar::<Fr>::new_input(cs.clone(), || Ok(self.public.commitment))?;

        let public_sums = self
            .public
            .stats
            .sum_glucose_by_bucket
            .iter()
            .map(|s| FpVar::<Fr>::new_input(cs.clone(), || Ok(Fr::from(*s))))
            .collect::<Result<Vec<_>, _>>()?;
        let public_counts = self
            .public
            .stats
            .count_by_bucket
            .iter()
            .map(|c| FpVar::<Fr>::new_input(cs.clone(), || Ok(Fr::from(*c))))
            .collect::<Result<Vec<_>, _>>()?;

        // --- Witness (private) records ---
        if self.records.len() != self.shape.shard_size {
            return Err(SynthesisError::Unsatisfiable);
        }

        let max_age = u64::from(self.shape.max_age());
        let max_glucose = u64::from(self.shape.max_glucose);
        let buckets = self.shape.buckets.buckets();

        let mut sponge = PoseidonSpongeVar::<Fr>::new(cs.clone(), self.poseidon);

        let mut sum_vars = vec![fp_const(0); NUM_BUCKETS];
        let mut count_vars = vec![fp_const(0); NUM_BUCKETS];

        for rec in &self.records {
            let (age, age_bits) = alloc_bounded(&cs, u64::from(rec.age), max_age)?;
            let (glucose, _) = alloc_bounded(&cs, u64::from(rec.blood_glucose_mg_dl), max_glucose)?;

            // Same absorb order as `CommitmentScheme::commit_records`.
            sponge.absorb(&age)?;
            sponge.absorb(&glucose)?;

            // Buckets are disjoint, so a record contributes to at most one; the final check makes
            // it exactly one.
            let mut membership = Vec::with_capacity(NUM_BUCKETS);
            for (b, bucket) in buckets.iter().enumerate() {
                let in_bucket = in_range(&age_bits, u64::from(bucket.min_age), u64::from(bucket.max_age))?;

                sum_vars[b] += in_bucket.select(&glucose, &fp_const(0))?;
                count_vars[b] += FpVar::from(in_bucket.clone());
                membership.push(in_bucket);
            }
            Boolean::kary_or(&membership)?.enforce_equal(&Boolean::constant(true))?;
        }

        let commitment = sponge.squeeze_field_elements(1)?[0].clone();
        commitment.enforce_equal(&public_commitment)?;

        let mut total = fp_const(0);
        for i in 0..NUM_BUCKETS {
            sum_vars[i].enforce_equal(&public_sums[i])?;
            count_vars[i].enforce_equal(&public_counts[i])?;
            total += &count_vars[i];
        }
        total.enforce_equal(&fp_const(self.shape.shard_size as u64))?;

        Ok(())
    }
}

/// Synthesize the circuit and report whether the witness satisfies every constraint.
///
/// This is the slow, authoritative check; the prover relies on the cheaper native re-derivation.
pub fn check_shard_constraints(circuit: HealthShardCircuit<'_>) -> Result<bool, SynthesisError> {
    let cs = ConstraintSystem::<Fr>::new_ref();
    circuit.generate_constraints(cs.clone())?;
    cs.is_satisfied()
}
