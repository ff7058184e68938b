//! Reproducible accuracy checks for the ranking passes
//!
//! Examples are synthesised from the leaves of the tree: a short
//! clinical note built around one leaf description, that leaf's
//! code as the expected answer, and a shuffled candidate list of
//! the expected code plus distractor leaves. All randomness comes
//! from make_rng, so a seed fixes the whole example set.

use blake2::{Blake2b512, Digest};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::clinical_code_tree::ClinicalCodeTree;
use crate::llm::LanguageModel;
use crate::pipeline::CodeSearch;

/// Make a random number generator from a global seed
/// and a string id.
///
/// The global seed controls all randomness in a run; the id
/// separates independent streams (e.g. one for picking the
/// expected codes, another for the distractors), so that changing
/// how one stream is used does not shift the others.
///
/// The id is concatenated with the global seed, the result is
/// hashed, and the first 32 bytes of the hash seed the generator.
pub fn make_rng(global_seed: u64, id: &str) -> ChaCha8Rng {
    let message = format!("{id}{global_seed}");
    let mut hasher = Blake2b512::new();
    hasher.update(message);
    let digest = hasher.finalize();
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&digest[..32]);
    ChaCha8Rng::from_seed(seed)
}

const NOTE_TEMPLATES: [&str; 5] = [
    "Patient presents with {}.",
    "Patient diagnosed with {} after assessment.",
    "Clinical findings consistent with {}.",
    "History reveals {}.",
    "Diagnosis: {}.",
];

/// One labelled ranking problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationExample {
    pub clinical_note: String,
    pub candidate_codes: Vec<String>,
    pub best_code: String,
}

/// Generate n examples with num_candidates candidates each
/// (fewer if the tree has fewer leaves).
///
/// Leaves are sorted by code before sampling, so the same tree
/// and seed always give the same examples.
pub fn generate_examples(
    tree: &ClinicalCodeTree,
    n: usize,
    num_candidates: usize,
    seed: u64,
) -> Vec<EvaluationExample> {
    let mut leaves: Vec<(String, String)> = tree
        .all_leaves()
        .iter()
        .filter(|leaf| **leaf != tree.root())
        .map(|leaf| {
            let node = tree.node(*leaf);
            (node.code().to_string(), node.description().to_string())
        })
        .collect();
    leaves.sort();
    if leaves.is_empty() || n == 0 {
        return Vec::new();
    }

    let mut pick_rng = make_rng(seed, "expected_code");
    let mut distractor_rng = make_rng(seed, "distractors");
    let mut note_rng = make_rng(seed, "note_template");
    let num_candidates = num_candidates.clamp(1, leaves.len());

    let mut examples = Vec::with_capacity(n);
    for _ in 0..n {
        let expected = pick_rng.gen_range(0..leaves.len());
        let (best_code, description) = &leaves[expected];

        let others: Vec<usize> = (0..leaves.len()).filter(|i| *i != expected).collect();
        let mut candidate_codes: Vec<String> = others
            .choose_multiple(&mut distractor_rng, num_candidates - 1)
            .map(|i| leaves[*i].0.clone())
            .collect();
        candidate_codes.push(best_code.clone());
        candidate_codes.shuffle(&mut distractor_rng);

        let template = NOTE_TEMPLATES[note_rng.gen_range(0..NOTE_TEMPLATES.len())];
        let clinical_note = template.replacen("{}", &description.to_lowercase(), 1);

        examples.push(EvaluationExample {
            clinical_note,
            candidate_codes,
            best_code: best_code.clone(),
        });
    }
    examples
}

/// Lenient comparison of a predicted code with the expected one:
/// equal, one containing the other, or the expected code among
/// the whitespace-separated tokens of the prediction
pub fn is_match(expected: &str, predicted: &str) -> bool {
    let expected = expected.trim().to_lowercase();
    let predicted = predicted.trim().to_lowercase();
    if expected.is_empty() || predicted.is_empty() {
        return false;
    }
    expected == predicted
        || predicted.contains(&expected)
        || expected.contains(&predicted)
        || predicted.split_whitespace().any(|token| token == expected)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvaluationReport {
    pub total: usize,
    pub correct: usize,
}

impl EvaluationReport {
    fn record(&mut self, expected: &str, predicted: Option<&str>) {
        self.total += 1;
        if predicted.is_some_and(|predicted| is_match(expected, predicted)) {
            self.correct += 1;
        }
    }

    /// Fraction correct; 0.0 for an empty report
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }
}

/// Rank the given candidates of each example
pub fn evaluate_ranking<M: LanguageModel>(
    search: &CodeSearch<M>,
    examples: &[EvaluationExample],
) -> EvaluationReport {
    let mut report = EvaluationReport::default();
    for example in examples {
        let predicted = search.rank_candidates(&example.clinical_note, &example.candidate_codes);
        tracing::debug!(expected = %example.best_code, ?predicted, "ranking example");
        report.record(&example.best_code, predicted.as_deref());
    }
    tracing::info!(total = report.total, correct = report.correct, "ranking evaluation");
    report
}

/// Run the whole keyword, retrieval and ranking pipeline from
/// each note, ignoring the example's candidates
pub fn evaluate_end_to_end<M: LanguageModel>(
    search: &CodeSearch<M>,
    examples: &[EvaluationExample],
) -> EvaluationReport {
    let mut report = EvaluationReport::default();
    for example in examples {
        let predicted = search.rank_code(&example.clinical_note);
        tracing::debug!(expected = %example.best_code, ?predicted, "end-to-end example");
        report.record(&example.best_code, predicted.as_deref());
    }
    tracing::info!(total = report.total, correct = report.correct, "end-to-end evaluation");
    report
}
