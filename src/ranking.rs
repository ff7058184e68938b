//! Last pass of the code search: pick one code from the candidates
//!
//! The ranker never fails. With no candidates it returns None,
//! with one it returns it without asking the model, and with
//! several it asks the model and checks the answer against the
//! candidate list. Whatever goes wrong after that (transport
//! error, a reply naming no candidate) ends in the first
//! candidate of the list, so results are reproducible.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::clinical_code_tree::ClinicalCodeTree;
use crate::config::GenerationSettings;
use crate::error::Result;
use crate::llm::{ChatMessage, CompletionRequest, LanguageModel};
use crate::prompts;

/// A worked example shown to the model in the optimized prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingDemo {
    pub clinical_note: String,
    /// The candidate listing, as it would appear in the prompt
    pub candidate_codes: String,
    pub best_code: String,
}

/// A tuned ranking prompt: instructions plus few-shot demos.
///
/// These are produced by an external prompt tuning run and saved
/// as JSON; this crate only loads and renders them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptimizedRankingPrompt {
    pub instructions: String,
    #[serde(default)]
    pub demos: Vec<RankingDemo>,
}

impl OptimizedRankingPrompt {
    pub fn from_reader<R: std::io::Read>(reader: R) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let f = std::fs::File::open(path)?;
        Self::from_reader(f)
    }

    /// Render as a field-structured prompt ending in "Best Code:"
    pub fn render(&self, note: &str, code_descriptions: &str) -> String {
        let mut prompt = format!("{}\n\n---\n\n", self.instructions.trim());
        for demo in &self.demos {
            prompt.push_str(&format!(
                "Clinical Note: {}\nCandidate Codes:\n{}\nBest Code: {}\n\n---\n\n",
                demo.clinical_note, demo.candidate_codes, demo.best_code
            ));
        }
        prompt.push_str(&format!(
            "Clinical Note: {note}\nCandidate Codes:\n{code_descriptions}\nBest Code:"
        ));
        prompt
    }
}

const BEST_CODE_LABEL: &str = "best code:";

/// The text after the last "Best Code:" label, or the whole
/// reply when there is no label
fn best_code_field(reply: &str) -> &str {
    // ASCII lower-casing keeps byte offsets valid for reply
    match reply.to_ascii_lowercase().rfind(BEST_CODE_LABEL) {
        Some(at) => &reply[at + BEST_CODE_LABEL.len()..],
        None => reply,
    }
}

fn is_code_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '-'
}

/// Find which candidate a model reply names. Comparisons ignore
/// ASCII case, so "v05.2" names "V05.2".
///
/// In order of preference:
/// 1. the whole (trimmed) reply is a candidate;
/// 2. the first code-like token of the reply that is a candidate,
///    in reply order ("Not 002.0, it is 001.0" names 002.0);
/// 3. the longest candidate that occurs anywhere in the reply
///    (earliest in the list on ties), so "001" does not win
///    over "001.0".
pub fn identify_candidate<'c>(reply: &str, candidates: &'c [String]) -> Option<&'c String> {
    let trimmed = reply.trim();
    if let Some(exact) = candidates.iter().find(|c| c.eq_ignore_ascii_case(trimmed)) {
        return Some(exact);
    }

    for token in reply.split(|c: char| !is_code_char(c)) {
        let token = token.trim_matches(|c| c == '.' || c == '-');
        if token.is_empty() {
            continue;
        }
        if let Some(found) = candidates.iter().find(|c| c.eq_ignore_ascii_case(token)) {
            return Some(found);
        }
    }

    let reply = reply.to_ascii_lowercase();
    candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| !c.is_empty() && reply.contains(&c.to_ascii_lowercase()))
        .max_by(|(i, a), (j, b)| a.len().cmp(&b.len()).then(j.cmp(i)))
        .map(|(_, c)| c)
}

pub struct CodeRanker<'a, M> {
    model: &'a M,
    tree: &'a ClinicalCodeTree,
    model_name: &'a str,
    generation: GenerationSettings,
    optimized: Option<&'a OptimizedRankingPrompt>,
}

impl<'a, M: LanguageModel> CodeRanker<'a, M> {
    pub fn new(
        model: &'a M,
        tree: &'a ClinicalCodeTree,
        model_name: &'a str,
        generation: GenerationSettings,
    ) -> Self {
        Self {
            model,
            tree,
            model_name,
            generation,
            optimized: None,
        }
    }

    /// Try the tuned prompt first, and the manual prompt if the
    /// tuned one fails
    pub fn with_optimized_prompt(mut self, optimized: Option<&'a OptimizedRankingPrompt>) -> Self {
        self.optimized = optimized;
        self
    }

    /// Pick the single best code for the note out of candidates
    pub fn rank(&self, note: &str, candidates: &[String]) -> Option<String> {
        match candidates {
            [] => return None,
            [only] => return Some(only.clone()),
            _ => (),
        }

        let code_descriptions = prompts::describe_codes(self.tree, candidates);

        if let Some(optimized) = self.optimized {
            let prompt = optimized.render(note, &code_descriptions);
            match self.ask(prompt) {
                Ok(reply) => match identify_candidate(best_code_field(&reply), candidates) {
                    Some(code) => return Some(code.clone()),
                    None => tracing::warn!(
                        reply = %reply.trim(),
                        "optimized ranking reply names no candidate; retrying with manual prompt"
                    ),
                },
                Err(error) => tracing::warn!(
                    %error,
                    transport = error.is_transport(),
                    "optimized ranking call failed; retrying with manual prompt"
                ),
            }
        }

        let prompt = prompts::manual_ranking(note, &code_descriptions);
        match self.ask(prompt) {
            Ok(reply) => match identify_candidate(&reply, candidates) {
                Some(code) => return Some(code.clone()),
                None => tracing::warn!(
                    reply = %reply.trim(),
                    "ranking reply names no candidate"
                ),
            },
            Err(error) => tracing::warn!(%error, "ranking call failed"),
        }

        tracing::warn!(fallback = %candidates[0], "falling back to the first candidate");
        Some(candidates[0].clone())
    }

    fn ask(&self, prompt: String) -> Result<String> {
        let request = CompletionRequest::new(
            self.model_name,
            vec![ChatMessage::system(prompts::RANKING_SYSTEM), ChatMessage::user(prompt)],
            self.generation,
        );
        self.model.complete(&request)
    }
}

/// Tests for the ranker
///
/// Things to check:
/// * short-circuits for zero and one candidate
/// * valid replies are mapped onto candidates
/// * every failure falls back to the first candidate, reproducibly
/// * the optimized prompt degrades to the manual prompt
#[cfg(test)]
mod tests {

    use super::*;
    use crate::llm::testing::{unavailable, ScriptedModel};

    fn example_tree() -> ClinicalCodeTree {
        let json = r#"[
            [null, {"code": "001", "descr": "Cholera"},
             {"code": "001.0", "descr": "Cholera due to vibrio cholerae"}],
            [null, {"code": "002", "descr": "Typhoid and paratyphoid fevers"},
             {"code": "002.0", "descr": "Typhoid fever"}]
        ]"#;
        ClinicalCodeTree::from_reader(json.as_bytes()).unwrap()
    }

    fn candidates(codes: &[&str]) -> Vec<String> {
        codes.iter().map(|c| c.to_string()).collect()
    }

    fn generation() -> GenerationSettings {
        GenerationSettings::new(0.0, 200)
    }

    #[test]
    fn no_candidates_gives_none() {
        let tree = example_tree();
        let model = ScriptedModel::replying(&["001.0"]);
        let ranker = CodeRanker::new(&model, &tree, "gpt-3.5-turbo", generation());
        assert_eq!(ranker.rank("note", &[]), None);
        assert_eq!(model.calls(), 0);
    }

    #[test]
    fn single_candidate_skips_the_model() {
        let tree = example_tree();
        let model = ScriptedModel::replying(&["002.0"]);
        let ranker = CodeRanker::new(&model, &tree, "gpt-3.5-turbo", generation());
        assert_eq!(ranker.rank("note", &candidates(&["001.0"])), Some(String::from("001.0")));
        assert_eq!(model.calls(), 0);
    }

    #[test]
    fn reply_naming_a_candidate_is_used() {
        let tree = example_tree();
        let model = ScriptedModel::replying(&["001.0 is correct"]);
        let ranker = CodeRanker::new(&model, &tree, "gpt-3.5-turbo", generation());
        let ranked = ranker.rank("Patient with cholera", &candidates(&["001.0", "002.0"]));
        assert_eq!(ranked, Some(String::from("001.0")));

        let prompt = model.prompt(0);
        assert!(prompt.contains("001.0: Cholera due to vibrio cholerae"));
        assert!(prompt.contains("002.0: Typhoid fever"));
    }

    #[test]
    fn unusable_reply_falls_back_to_first_candidate() {
        let tree = example_tree();
        for _ in 0..3 {
            let model = ScriptedModel::replying(&["I am not sure"]);
            let ranker = CodeRanker::new(&model, &tree, "gpt-3.5-turbo", generation());
            let ranked = ranker.rank("note", &candidates(&["002.0", "001.0"]));
            assert_eq!(ranked, Some(String::from("002.0")));
            assert_eq!(model.calls(), 1);
        }
    }

    #[test]
    fn transport_failure_falls_back_to_first_candidate() {
        let tree = example_tree();
        let model = ScriptedModel::new(vec![Err(unavailable())]);
        let ranker = CodeRanker::new(&model, &tree, "gpt-3.5-turbo", generation());
        assert_eq!(ranker.rank("note", &candidates(&["002.0", "001.0"])), Some(String::from("002.0")));
    }

    #[test]
    fn unknown_candidate_gets_placeholder_description() {
        let tree = example_tree();
        let model = ScriptedModel::replying(&["999.9"]);
        let ranker = CodeRanker::new(&model, &tree, "gpt-3.5-turbo", generation());
        assert_eq!(ranker.rank("note", &candidates(&["001.0", "999.9"])), Some(String::from("999.9")));
        assert!(model.prompt(0).contains("999.9: Unknown description"));
    }

    fn optimized_prompt() -> OptimizedRankingPrompt {
        let json = r#"{
            "instructions": "Rank ICD-9 codes based on clinical note relevance.",
            "demos": [{
                "clinical_note": "Diagnosis: Typhoid fever.",
                "candidate_codes": "001.0: Cholera due to vibrio cholerae\n002.0: Typhoid fever",
                "best_code": "002.0"
            }]
        }"#;
        OptimizedRankingPrompt::from_reader(json.as_bytes()).unwrap()
    }

    #[test]
    fn optimized_prompt_is_used_first() {
        let tree = example_tree();
        let optimized = optimized_prompt();
        let model = ScriptedModel::replying(&["Best Code: 001.0"]);
        let ranker = CodeRanker::new(&model, &tree, "medgemma", generation())
            .with_optimized_prompt(Some(&optimized));
        let ranked = ranker.rank("Cholera case", &candidates(&["002.0", "001.0"]));
        assert_eq!(ranked, Some(String::from("001.0")));
        assert_eq!(model.calls(), 1);
        let prompt = model.prompt(0);
        assert!(prompt.starts_with("Rank ICD-9 codes"));
        assert!(prompt.contains("Best Code: 002.0"));
        assert!(prompt.ends_with("Best Code:"));
    }

    #[test]
    fn optimized_failure_retries_with_manual_prompt() {
        let tree = example_tree();
        let optimized = optimized_prompt();
        let model = ScriptedModel::new(vec![Err(unavailable()), Ok(String::from("001.0"))]);
        let ranker = CodeRanker::new(&model, &tree, "medgemma", generation())
            .with_optimized_prompt(Some(&optimized));
        let ranked = ranker.rank("Cholera case", &candidates(&["002.0", "001.0"]));
        assert_eq!(ranked, Some(String::from("001.0")));
        assert_eq!(model.calls(), 2);
        assert!(model.prompt(1).starts_with("[Case note]:"));
    }

    #[test]
    fn both_paths_failing_gives_first_candidate() {
        let tree = example_tree();
        let optimized = optimized_prompt();
        let model = ScriptedModel::new(vec![Ok(String::from("Best Code: unknown")), Err(unavailable())]);
        let ranker = CodeRanker::new(&model, &tree, "medgemma", generation())
            .with_optimized_prompt(Some(&optimized));
        let ranked = ranker.rank("note", &candidates(&["002.0", "001.0"]));
        assert_eq!(ranked, Some(String::from("002.0")));
        assert_eq!(model.calls(), 2);
    }

    #[test]
    fn identify_prefers_exact_then_token_then_longest() {
        let codes = candidates(&["001", "001.0", "002.0"]);
        assert_eq!(identify_candidate(" 001 ", &codes), Some(&codes[0]));
        assert_eq!(identify_candidate("The answer is 001.0.", &codes), Some(&codes[1]));
        assert_eq!(identify_candidate("**002.0**", &codes), Some(&codes[2]));
        assert_eq!(identify_candidate("code001.0x", &codes), Some(&codes[1]));
        assert_eq!(identify_candidate("none of them", &codes), None);
    }

    #[test]
    fn identify_ignores_case_and_takes_the_first_named_code() {
        let codes = candidates(&["001.0", "002.0", "V05.2"]);
        assert_eq!(identify_candidate("v05.2", &codes), Some(&codes[2]));
        assert_eq!(identify_candidate("Best match: v05.2.", &codes), Some(&codes[2]));
        assert_eq!(identify_candidate("codev05.2", &codes), Some(&codes[2]));
        assert_eq!(
            identify_candidate("Not 002.0; the best code is 001.0", &codes),
            Some(&codes[1])
        );
    }

    #[test]
    fn best_code_label_is_stripped() {
        assert_eq!(best_code_field("Reasoning...\nBest Code: 001.0").trim(), "001.0");
        assert_eq!(best_code_field("001.0").trim(), "001.0");
    }
}
