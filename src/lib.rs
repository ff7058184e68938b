//! ICD code hierarchy and language-model code search
//!
//! The ClinicalCodeTree is loaded once from a hierarchy dataset and
//! is read-only afterwards. CodeSearch runs queries against it with
//! a LanguageModel: keyword retrieval and ranking (rank_code), or a
//! model-guided descent of the tree (tree_search).

pub mod clinical_code;
pub mod clinical_code_tree;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod keywords;
pub mod llm;
pub mod pipeline;
pub mod prompts;
pub mod ranking;
pub mod retrieval;
pub mod tree_search;

pub use clinical_code::{ClinicalCode, ClinicalCodeRef, ClinicalCodeStore};
pub use clinical_code_tree::ClinicalCodeTree;
pub use config::Settings;
pub use error::{IcdError, Result};
pub use evaluation::make_rng;
pub use llm::{CachingModel, LanguageModel, OpenAiClient};
pub use pipeline::CodeSearch;
pub use ranking::OptimizedRankingPrompt;
