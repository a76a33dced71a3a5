use thiserror::Error;

#[derive(Debug, Error)]
pub enum ZkError {
    #[error("invalid shard size: expected {expected}, got {got}")]
    InvalidShardSize { expected: usize, got: usize },

    #[error("record {position}: age {age} falls outside every bucket")]
    OutOfRangeAge { position: usize, age: u8 },

    #[error("record {position}: glucose {glucose} exceeds bound {bound}")]
    MeasurementOutOfRange { position: usize, glucose: u16, bound: u16 },

    #[error("witness does not satisfy the shard circuit: {0}")]
    WitnessUnsatisfiable(String),

    #[error("proof verification failed")]
    VerificationFailure,

    #[error("invalid bucket table: {0}")]
    InvalidBucketTable(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("arkworks error: {0}")]
    Ark(String),
}
