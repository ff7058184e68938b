//! The public query entry points
//!
//! A CodeSearch holds the (shared, read-only) code tree, a
//! language model and the settings, and runs one of the passes
//! per query:
//! * find_candidates: keywords, then leaf description matching;
//! * rank_code: find_candidates, then pick the single best code;
//! * tree_search: depth-bounded, model-pruned descent from the root.
//!
//! No query fails. Model failures are logged and degrade to an
//! empty or fallback result.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::clinical_code_tree::ClinicalCodeTree;
use crate::config::Settings;
use crate::keywords::KeywordExtractor;
use crate::llm::LanguageModel;
use crate::ranking::{CodeRanker, OptimizedRankingPrompt};
use crate::retrieval::CandidateRetriever;
use crate::tree_search::{TreeSearchDecider, TreeSearchOutcome};

pub struct CodeSearch<M> {
    tree: Arc<ClinicalCodeTree>,
    retriever: CandidateRetriever,
    model: M,
    settings: Settings,
    optimized: Option<OptimizedRankingPrompt>,
}

impl<M: LanguageModel> CodeSearch<M> {
    pub fn new(tree: Arc<ClinicalCodeTree>, model: M, settings: Settings) -> Self {
        let retriever = CandidateRetriever::new(&tree);
        Self {
            tree,
            retriever,
            model,
            settings,
            optimized: None,
        }
    }

    /// Rank with a tuned prompt, falling back to the manual one
    pub fn with_optimized_prompt(mut self, optimized: OptimizedRankingPrompt) -> Self {
        self.optimized = Some(optimized);
        self
    }

    pub fn tree(&self) -> &ClinicalCodeTree {
        &self.tree
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn retriever(&self) -> &CandidateRetriever {
        &self.retriever
    }

    /// Keywords for the note; empty if the model call fails
    pub fn extract_keywords(&self, note: &str) -> Vec<String> {
        let extractor = KeywordExtractor::new(
            &self.model,
            &self.settings.llm.model_name,
            self.settings.extraction,
        );
        extractor.extract(note).unwrap_or_else(|error| {
            tracing::warn!(%error, "keyword extraction failed; no candidates for this note");
            Vec::new()
        })
    }

    /// Leaf codes whose description mentions a keyword of the note
    pub fn find_candidates(&self, note: &str) -> BTreeSet<String> {
        let keywords = self.extract_keywords(note);
        self.retriever.retrieve(&keywords)
    }

    /// Pick the best code out of an explicit, ordered candidate
    /// list. The first candidate is the fallback.
    pub fn rank_candidates(&self, note: &str, candidates: &[String]) -> Option<String> {
        CodeRanker::new(
            &self.model,
            &self.tree,
            &self.settings.llm.model_name,
            self.settings.ranking,
        )
        .with_optimized_prompt(self.optimized.as_ref())
        .rank(note, candidates)
    }

    /// The single most relevant code for the note, or None when no
    /// leaf description matches any keyword
    pub fn rank_code(&self, note: &str) -> Option<String> {
        let candidates: Vec<String> = self.find_candidates(note).into_iter().collect();
        tracing::info!(candidates = candidates.len(), "ranking candidates");
        let ranked = self.rank_candidates(note, &candidates);
        tracing::info!(code = ?ranked, "ranked code");
        ranked
    }

    /// Run the tree search and keep the full outcome
    pub fn tree_search_outcome(&self, note: &str, max_depth: usize) -> TreeSearchOutcome {
        TreeSearchDecider::new(
            &self.model,
            &self.tree,
            &self.settings.llm.model_name,
            self.settings.tree_search.generation(),
        )
        .run(note, max_depth)
    }

    /// Every code accepted by the tree search
    pub fn tree_search(&self, note: &str, max_depth: usize) -> BTreeSet<String> {
        self.tree_search_outcome(note, max_depth).codes(&self.tree)
    }

    /// Tree search, then rank what it accepted. Accepted leaves are
    /// ranked if there are any, otherwise every accepted code.
    pub fn rank_with_tree_search(&self, note: &str, max_depth: usize) -> Option<String> {
        let outcome = self.tree_search_outcome(note, max_depth);
        self.rank_accepted(note, &outcome)
    }

    /// Rank the codes accepted by an earlier tree search
    pub fn rank_accepted(&self, note: &str, outcome: &TreeSearchOutcome) -> Option<String> {
        let mut candidates = outcome.leaf_codes(&self.tree);
        if candidates.is_empty() {
            candidates = outcome.ordered_codes(&self.tree);
        }
        self.rank_candidates(note, &candidates)
    }
}
