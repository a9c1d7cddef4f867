use thiserror::Error;

/// Errors raised by the QC pipeline
#[derive(Debug, Error)]
pub enum QcError {
    /// Underlying I/O failure
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Failure of the table writer
    #[error("table output failed: {0}")]
    Csv(#[from] csv::Error),

    /// Parameter file could not be parsed
    #[error("invalid parameter file: {0}")]
    Config(#[from] serde_json::Error),

    /// Malformed input record
    #[error("{file}:{line}: {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },

    /// Inputs whose dimensions do not line up
    #[error("dimension mismatch: {0}")]
    DimensionMismatch(String),

    /// Input values outside of their domain (e.g. non-positive size factors)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A sample whose stage has no position in the batch correction order
    #[error(
        "stage '{stage}' of sample '{sample}' is not part of the batch correction order {order:?}"
    )]
    UnorderedStage {
        sample: String,
        stage: String,
        order: Vec<String>,
    },

    /// Nothing to work on
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// Worker pool could not be created
    #[error("failed to build the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// Decomposition failures from faer
    #[error("linear algebra failure: {0}")]
    LinearAlgebra(String),

    /// Failure within one sample of the per-sample stage
    #[error("processing of sample '{sample}' failed: {source}")]
    SampleFailed {
        sample: String,
        #[source]
        source: Box<QcError>,
    },
}

/// Result alias used throughout the crate
pub type QcResult<T> = Result<T, QcError>;
