//! Error types for loading the code tree and talking to the
//! language model.
//!
//! Only dataset and configuration problems are meant to reach the
//! caller of a query. Transport and parsing failures are recovered
//! inside the pipeline (see `ranking` and `tree_search`), and a code
//! that is not in the tree is an empty result, not an error.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IcdError {
    /// The dataset or config file could not be read
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The dataset (or an optimized prompt file) is not valid JSON
    /// of the expected shape
    #[error("malformed json input: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed configuration: {0}")]
    Config(#[from] serde_yaml::Error),

    /// The dataset parsed but does not describe a tree
    #[error("invalid code dataset: {0}")]
    DataLoad(String),

    #[error("language model request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("language model returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unparseable language model response: {0}")]
    Unparseable(String),
}

impl IcdError {
    /// True for failures of the completion call itself (as opposed
    /// to problems with the data the crate was given)
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Status { .. })
    }
}

pub type Result<T> = std::result::Result<T, IcdError>;
