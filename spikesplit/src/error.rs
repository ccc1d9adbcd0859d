//! Error type for the split / merge engine.

use spikecore::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SortError {
    /// Non-negative labels must cover 0..K without gaps
    #[error("labels are not contiguous: {distinct} distinct ids but max id is {max}")]
    NonContiguousLabels { distinct: usize, max: i64 },

    #[error("event {index} has label {label}, only -1 marks triage")]
    InvalidLabel { index: usize, label: i64 },

    #[error("label array has {labels} entries but the store holds {events} events")]
    LabelLengthMismatch { labels: usize, events: usize },

    #[error("channel index row {row} is not sorted ascending")]
    ChannelIndexNotSorted { row: usize },

    #[error("store has no projections of kind '{kind}'")]
    MissingProjections { kind: String },

    #[error("got {templates} templates for {units} units")]
    TemplateCountMismatch { templates: usize, units: usize },

    /// A split job failed or panicked inside a worker
    #[error("split test '{test}' failed on unit {label} ({n_members} members): {message}")]
    SplitJobFailed { test: String, label: i64, n_members: usize, message: String },

    #[error("worker initialisation failed: {0}")]
    WorkerInit(String),

    #[error("invalid store: {0}")]
    InvalidStore(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, SortError>;
