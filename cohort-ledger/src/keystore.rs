//! On-disk Groth16 key material.
//!
//! Keys are loaded when present and generated (local trusted setup) otherwise. A stored key whose
//! recorded circuit shape differs from the configured one is refused: regenerating would silently
//! invalidate every proof already in the ledger.

use cohort_zk::groth16::{deserialize_pk, deserialize_vk, serialize_pk, serialize_vk};
use cohort_zk::{CircuitShape, CommitmentScheme, ShardKeys, ZkError};
use rand::rngs::OsRng;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

const PK_FILE: &str = "groth16_pk.bin";
const VK_FILE: &str = "groth16_vk.bin";
const SHAPE_FILE: &str = "shape.json";

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key store io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stored keys were generated for a different circuit shape ({0}); move them aside to run a new setup")]
    ShapeMismatch(String),

    #[error("incomplete key store in {0}: expected {PK_FILE}, {VK_FILE} and {SHAPE_FILE}")]
    Incomplete(PathBuf),

    #[error("invalid shape file: {0}")]
    Shape(#[from] serde_json::Error),

    #[error(transparent)]
    Zk(#[from] ZkError),
}

fn read(path: &Path) -> Result<Vec<u8>, KeyStoreError> {
    std::fs::read(path).map_err(|source| KeyStoreError::Io { path: path.to_path_buf(), source })
}

fn write(path: &Path, bytes: &[u8]) -> Result<(), KeyStoreError> {
    std::fs::write(path, bytes).map_err(|source| KeyStoreError::Io { path: path.to_path_buf(), source })
}

/// Load the keys for `shape` from `keys_dir`, running the setup on first use.
///
/// Blocking and, on first run, slow. Call from `spawn_blocking`.
pub fn load_or_setup(keys_dir: &Path, shape: CircuitShape) -> Result<ShardKeys, KeyStoreError> {
    std::fs::create_dir_all(keys_dir)
        .map_err(|source| KeyStoreError::Io { path: keys_dir.to_path_buf(), source })?;

    let pk_path = keys_dir.join(PK_FILE);
    let vk_path = keys_dir.join(VK_FILE);
    let shape_path = keys_dir.join(SHAPE_FILE);
    let scheme = CommitmentScheme::poseidon();

    let present = [&pk_path, &vk_path, &shape_path].iter().filter(|p| p.exists()).count();
    if present == 3 {
        let stored: CircuitShape = serde_json::from_slice(&read(&shape_path)?)?;
        if stored != shape {
            return Err(KeyStoreError::ShapeMismatch(format!(
                "stored shard_size={}, configured shard_size={}",
                stored.shard_size, shape.shard_size
            )));
        }

        let pk = deserialize_pk(&read(&pk_path)?)?;
        let vk = deserialize_vk(&read(&vk_path)?)?;
        info!(dir = %keys_dir.display(), shard_size = shape.shard_size, "loaded groth16 keys");
        return Ok(ShardKeys::from_parts(shape, scheme, pk, vk)?);
    }
    if present != 0 {
        return Err(KeyStoreError::Incomplete(keys_dir.to_path_buf()));
    }

    warn!(shard_size = shape.shard_size, "no groth16 keys found, running local trusted setup");
    let mut rng = OsRng;
    let keys = ShardKeys::setup(shape, scheme, &mut rng)?;

    write(&pk_path, &serialize_pk(keys.proving_key())?)?;
    write(&vk_path, &serialize_vk(keys.verifying_key())?)?;
    // Shape goes last: its presence marks the store complete.
    write(&shape_path, &serde_json::to_vec_pretty(keys.shape())?)?;

    info!(dir = %keys_dir.display(), "groth16 keys written");
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_then_reload_yields_the_same_vk() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_setup(dir.path(), CircuitShape::new(2)).unwrap();
        let second = load_or_setup(dir.path(), CircuitShape::new(2)).unwrap();
        assert_eq!(first.verifying_key(), second.verifying_key());
    }

    #[test]
    fn refuses_keys_for_another_shape() {
        let dir = tempfile::tempdir().unwrap();
        load_or_setup(dir.path(), CircuitShape::new(2)).unwrap();
        assert!(matches!(
            load_or_setup(dir.path(), CircuitShape::new(3)),
            Err(KeyStoreError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn refuses_partial_store() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(VK_FILE), b"junk").unwrap();
        assert!(matches!(
            load_or_setup(dir.path(), CircuitShape::new(2)),
            Err(KeyStoreError::Incomplete(_))
        ));
    }
}
