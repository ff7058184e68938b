//! Second pass of the code search: find the leaf codes whose
//! description mentions one of the keywords
//!
//! Matching is a literal, case-insensitive substring test, so
//! descriptions containing characters like "(" or "+" need no
//! escaping. The scan is leaves x keywords, which is fine for a
//! taxonomy with a few thousand leaves.

use std::collections::BTreeSet;

use crate::clinical_code_tree::ClinicalCodeTree;

/// A leaf code with its description lower-cased once up front
#[derive(Debug, Clone)]
struct LeafText {
    code: String,
    description: String,
    lowered: String,
}

#[derive(Debug, Clone)]
pub struct CandidateRetriever {
    leaves: Vec<LeafText>,
}

impl CandidateRetriever {
    pub fn new(tree: &ClinicalCodeTree) -> Self {
        let leaves = tree
            .all_leaves()
            .iter()
            .filter(|leaf| **leaf != tree.root())
            .map(|leaf| {
                let node = tree.node(*leaf);
                LeafText {
                    code: node.code().to_string(),
                    description: node.description().to_string(),
                    lowered: node.description().to_lowercase(),
                }
            })
            .collect();
        Self { leaves }
    }

    /// Codes of every leaf whose description contains at least one
    /// of the keywords. Empty keywords are ignored. The result does
    /// not depend on the order of keywords or leaves.
    pub fn retrieve<S: AsRef<str>>(&self, keywords: &[S]) -> BTreeSet<String> {
        let keywords: Vec<String> = keywords
            .iter()
            .map(|keyword| keyword.as_ref().trim().to_lowercase())
            .filter(|keyword| !keyword.is_empty())
            .collect();

        let found: BTreeSet<String> = self
            .leaves
            .iter()
            .filter(|leaf| keywords.iter().any(|keyword| leaf.lowered.contains(keyword.as_str())))
            .map(|leaf| leaf.code.clone())
            .collect();
        tracing::debug!(keywords = keywords.len(), candidates = found.len(), "retrieved candidates");
        found
    }

    /// The reverse match: leaves whose whole description appears
    /// in the note. Returns (code, description) sorted by code.
    pub fn codes_mentioned_in(&self, note: &str) -> Vec<(String, String)> {
        let note = note.to_lowercase();
        let mut mentioned: Vec<(String, String)> = self
            .leaves
            .iter()
            .filter(|leaf| !leaf.lowered.is_empty() && note.contains(leaf.lowered.as_str()))
            .map(|leaf| (leaf.code.clone(), leaf.description.clone()))
            .collect();
        mentioned.sort();
        mentioned
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }
}
