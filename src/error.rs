//! Error kinds shared by every stage of the exposure pipeline.
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::FacId;

pub type Result<T> = std::result::Result<T, AirqError>;

#[derive(Error, Debug)]
pub enum AirqError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cannot parse artifact name '{0}'")]
    ParseError(String),

    #[error("artifact {} does not exist", .0.display())]
    MissingArtifact(PathBuf),

    #[error("dispersion model did not run, output {} is empty", .0.display())]
    ModelOutputEmpty(PathBuf),

    #[error("dispersion model failed: {0}")]
    ModelFailed(String),

    #[error("dispersion model exceeded its time limit of {0:?}")]
    ModelTimeout(Duration),

    #[error("facility {facid} only had {found} out of {expected} chunks")]
    IncompleteChunks {
        facid: FacId,
        found: usize,
        expected: u32,
    },

    #[error("facility {facid}: chunk {chunk_id} does not match the shape of chunk 1")]
    ShapeMismatch { facid: FacId, chunk_id: u32 },

    #[error("aggregation worker failed: {0}")]
    WorkerFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("polars error: {0}")]
    Polars(#[from] polars::error::PolarsError),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("glob pattern error: {0}")]
    Glob(#[from] glob::PatternError),
}

pub(crate) fn invalid<S: Into<String>>(msg: S) -> AirqError {
    AirqError::InvalidArgument(msg.into())
}
