//! First pass of the code search: turn a case note into keywords

use crate::config::GenerationSettings;
use crate::error::Result;
use crate::llm::{ChatMessage, CompletionRequest, LanguageModel};
use crate::prompts;

/// Asks the model for a comma-separated keyword list
pub struct KeywordExtractor<'a, M> {
    model: &'a M,
    model_name: &'a str,
    generation: GenerationSettings,
}

impl<'a, M: LanguageModel> KeywordExtractor<'a, M> {
    pub fn new(model: &'a M, model_name: &'a str, generation: GenerationSettings) -> Self {
        Self {
            model,
            model_name,
            generation,
        }
    }

    /// Extract keywords with a single completion call (no retry).
    ///
    /// The list can contain empty strings when the reply is empty
    /// or has stray commas; consumers skip those.
    pub fn extract(&self, note: &str) -> Result<Vec<String>> {
        let request = CompletionRequest::new(
            self.model_name,
            vec![
                ChatMessage::system(prompts::KEYWORD_SYSTEM),
                ChatMessage::user(prompts::keyword_extraction(note)),
            ],
            self.generation,
        );
        let reply = self.model.complete(&request)?;
        let keywords = parse_keywords(&reply);
        tracing::debug!(?keywords, "extracted keywords");
        Ok(keywords)
    }
}

/// Split a comma-separated reply into lower-case, trimmed keywords
/// with double quotes removed
pub fn parse_keywords(reply: &str) -> Vec<String> {
    reply
        .replace('"', "")
        .split(',')
        .map(|keyword| keyword.trim().to_lowercase())
        .collect()
}
