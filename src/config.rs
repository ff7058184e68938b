//! Settings for the language model and the search passes
//!
//! Settings are read from a YAML file. Every field has a default,
//! so an empty file (or no file) gives a working configuration
//! against the OpenAI API. The location of the code dataset is
//! not a setting: it is passed explicitly when the tree is built.

use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Where and how to reach the chat completion service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// Base of an OpenAI-compatible API, e.g. http://localhost:1234/v1
    /// for a local LM Studio server
    pub base_url: String,
    /// Bearer token. Local servers usually accept anything.
    pub api_key: Option<String>,
    pub model_name: String,
    pub timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: String::from("https://api.openai.com/v1"),
            api_key: None,
            model_name: String::from("gpt-3.5-turbo"),
            timeout_secs: 60,
        }
    }
}

fn default_max_tokens() -> u32 {
    200
}

fn default_extraction() -> GenerationSettings {
    GenerationSettings::new(0.0, 100)
}

fn default_ranking() -> GenerationSettings {
    GenerationSettings::new(0.0, default_max_tokens())
}

/// Sampling parameters for one kind of completion call.
///
/// A section that leaves out a field gets 0.0 (deterministic
/// sampling) or 200 tokens; a section left out entirely gets the
/// per-pass default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl GenerationSettings {
    pub fn new(temperature: f32, max_tokens: u32) -> Self {
        Self {
            temperature,
            max_tokens,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeSearchSettings {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Deepest search depth that is still expanded
    pub max_depth: usize,
}

impl Default for TreeSearchSettings {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            max_tokens: 512,
            max_depth: 7,
        }
    }
}

impl TreeSearchSettings {
    pub fn generation(&self) -> GenerationSettings {
        GenerationSettings::new(self.temperature, self.max_tokens)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub llm: LlmSettings,
    /// Keyword extraction pass
    #[serde(default = "default_extraction")]
    pub extraction: GenerationSettings,
    /// Single best code pass
    #[serde(default = "default_ranking")]
    pub ranking: GenerationSettings,
    pub tree_search: TreeSearchSettings,
    /// Cache deterministic (temperature 0) completions in memory
    pub cache_responses: bool,
    /// JSON file holding a tuned ranking prompt
    pub optimized_prompt: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm: LlmSettings::default(),
            extraction: default_extraction(),
            ranking: default_ranking(),
            tree_search: TreeSearchSettings::default(),
            cache_responses: false,
            optimized_prompt: None,
        }
    }
}

impl Settings {
    /// Read settings from a YAML byte source
    pub fn from_reader<R>(reader: R) -> Result<Self>
    where
        R: Read,
    {
        Ok(serde_yaml::from_reader(reader)?)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(path)?;
        Self::from_reader(f)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let yaml = r#"
        llm:
          base_url: http://localhost:1234/v1
          model_name: medgemma
        tree_search:
          max_depth: 5
        cache_responses: true
        "#;
        let settings = Settings::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(settings.llm.base_url, "http://localhost:1234/v1");
        assert_eq!(settings.llm.model_name, "medgemma");
        assert_eq!(settings.llm.timeout_secs, 60);
        assert_eq!(settings.tree_search.max_depth, 5);
        assert_eq!(settings.tree_search.max_tokens, 512);
        assert_eq!(settings.extraction, GenerationSettings::new(0.0, 100));
        assert!(settings.cache_responses);
        assert_eq!(settings.optimized_prompt, None);
    }

    #[test]
    fn partial_pass_section_fills_missing_fields() {
        let settings = Settings::from_reader("ranking:\n  temperature: 0.2\n".as_bytes()).unwrap();
        assert_eq!(settings.ranking, GenerationSettings::new(0.2, 200));
        assert_eq!(settings.extraction, GenerationSettings::new(0.0, 100));

        let settings = Settings::from_reader("extraction:\n  max_tokens: 50\n".as_bytes()).unwrap();
        assert_eq!(settings.extraction, GenerationSettings::new(0.0, 50));
        assert_eq!(settings.ranking, GenerationSettings::new(0.0, 200));
    }

    #[test]
    fn empty_document_is_default() {
        let settings = Settings::from_reader("{}".as_bytes()).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn wrong_types_are_rejected() {
        let yaml = "tree_search:\n  max_depth: deep\n";
        assert!(Settings::from_reader(yaml.as_bytes()).is_err());
    }
}
