//! Depth-bounded search down the code tree
//!
//! Starting at the root, the model is shown all children of a
//! node at once and asked for a yes/no verdict on each. Accepted
//! children are expanded in turn, rejected ones are pruned with
//! their whole subtree. The frontier is a LIFO stack of
//! (node, depth) pairs, so the search runs depth-first, most
//! recently accepted child first.
//!
//! Parsing the verdicts is a pure function of the reply text
//! (parse_verdicts), separate from the model call.

use std::collections::{BTreeSet, HashSet};

use regex::Regex;

use crate::clinical_code::ClinicalCodeRef;
use crate::clinical_code_tree::ClinicalCodeTree;
use crate::config::GenerationSettings;
use crate::error::Result;
use crate::llm::{ChatMessage, CompletionRequest, LanguageModel};
use crate::prompts::{self, DecisionTemplate};

/// Verdict for each code, in the order given.
///
/// A code is accepted when some line of the reply starts with
/// the code (after optional indentation, bullets or emphasis),
/// the code is not the prefix of a longer code on that line, and
/// the word "yes" appears later on the same line. Matching is
/// case-insensitive; any other commentary is ignored. A code
/// with no such line is rejected.
pub fn parse_verdicts<S: AsRef<str>>(reply: &str, codes: &[S]) -> Vec<bool> {
    codes
        .iter()
        .map(|code| {
            let pattern = format!(
                r"(?im)^[ \t*>#•-]*{}(?:[^\w.\-\n][^\n]*)?\byes\b",
                regex::escape(code.as_ref())
            );
            match Regex::new(&pattern) {
                Ok(regex) => regex.is_match(reply),
                Err(error) => {
                    tracing::warn!(code = code.as_ref(), %error, "could not build verdict pattern");
                    false
                }
            }
        })
        .collect()
}

/// What happened to a node during the search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Unvisited,
    Rejected,
    Accepted,
}

/// The raw model reply for the children of one explored node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionReply {
    pub code: String,
    pub depth: usize,
    pub reply: String,
}

/// Result of one tree search
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeSearchOutcome {
    /// Accepted nodes in the order they were accepted, each once
    accepted: Vec<ClinicalCodeRef>,
    rejected: HashSet<ClinicalCodeRef>,
    /// Number of decision calls made
    decisions: usize,
    /// Replies of the successful decision calls, in call order
    replies: Vec<DecisionReply>,
}

impl TreeSearchOutcome {
    fn accept(&mut self, code_ref: ClinicalCodeRef) {
        if !self.accepted.contains(&code_ref) {
            self.accepted.push(code_ref);
        }
    }

    pub fn accepted(&self) -> &[ClinicalCodeRef] {
        &self.accepted
    }

    pub fn decisions(&self) -> usize {
        self.decisions
    }

    pub fn replies(&self) -> &[DecisionReply] {
        &self.replies
    }

    /// State of a node after the search. A node that was accepted
    /// under one depth and rejected under another counts as accepted.
    pub fn visit(&self, code_ref: ClinicalCodeRef) -> Visit {
        if self.accepted.contains(&code_ref) {
            Visit::Accepted
        } else if self.rejected.contains(&code_ref) {
            Visit::Rejected
        } else {
            Visit::Unvisited
        }
    }

    /// Every accepted code
    pub fn codes(&self, tree: &ClinicalCodeTree) -> BTreeSet<String> {
        self.ordered_codes(tree).into_iter().collect()
    }

    /// Accepted codes in acceptance order
    pub fn ordered_codes(&self, tree: &ClinicalCodeTree) -> Vec<String> {
        self.accepted
            .iter()
            .map(|code_ref| tree.node(*code_ref).code().to_string())
            .collect()
    }

    /// Accepted codes that are leaves of the tree, in acceptance order
    pub fn leaf_codes(&self, tree: &ClinicalCodeTree) -> Vec<String> {
        self.accepted
            .iter()
            .map(|code_ref| tree.node(*code_ref))
            .filter(|node| node.is_leaf())
            .map(|node| node.code().to_string())
            .collect()
    }
}

pub struct TreeSearchDecider<'a, M> {
    model: &'a M,
    tree: &'a ClinicalCodeTree,
    model_name: &'a str,
    generation: GenerationSettings,
    template: DecisionTemplate,
}

impl<'a, M: LanguageModel> TreeSearchDecider<'a, M> {
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
            template: DecisionTemplate::for_model(model_name),
        }
    }

    /// Ask for a verdict on every child in one call. Returns the
    /// raw reply alongside the verdicts.
    pub fn decide(&self, note: &str, children: &[ClinicalCodeRef]) -> Result<(String, Vec<bool>)> {
        let codes: Vec<&str> = children
            .iter()
            .map(|child| self.tree.node(*child).code())
            .collect();
        let code_descriptions = codes
            .iter()
            .zip(children)
            .map(|(code, child)| format!("{code}: {}", self.tree.node(*child).description()))
            .collect::<Vec<_>>()
            .join("\n");
        let request = CompletionRequest::new(
            self.model_name,
            vec![
                ChatMessage::system(prompts::DECISION_SYSTEM),
                ChatMessage::user(self.template.render(note, &code_descriptions)),
            ],
            self.generation,
        );
        let reply = self.model.complete(&request)?;
        let verdicts = parse_verdicts(&reply, codes.as_slice());
        Ok((reply, verdicts))
    }

    /// Run the search from the root, expanding nodes whose search
    /// depth is at most max_depth. Decision failures reject every
    /// child of the node concerned; the search itself never fails.
    pub fn run(&self, note: &str, max_depth: usize) -> TreeSearchOutcome {
        let mut outcome = TreeSearchOutcome::default();
        let mut visited: HashSet<(ClinicalCodeRef, usize)> = HashSet::new();
        let mut stack = vec![(self.tree.root(), 0usize)];

        while let Some((node, depth)) = stack.pop() {
            if depth > max_depth || !visited.insert((node, depth)) {
                continue;
            }
            let children = self.tree.children(node);
            if children.is_empty() {
                continue;
            }

            outcome.decisions += 1;
            let code = self.tree.node(node).code();
            let verdicts = match self.decide(note, children) {
                Ok((reply, verdicts)) => {
                    tracing::debug!(node = code, depth, %reply, "decision reply");
                    outcome.replies.push(DecisionReply {
                        code: code.to_string(),
                        depth,
                        reply,
                    });
                    verdicts
                }
                Err(error) => {
                    tracing::warn!(
                        node = code,
                        %error,
                        "decision call failed; rejecting all children"
                    );
                    vec![false; children.len()]
                }
            };

            for (child, accepted) in children.iter().zip(verdicts) {
                tracing::debug!(
                    depth,
                    code = self.tree.node(*child).code(),
                    accepted,
                    "tree search verdict"
                );
                if accepted {
                    outcome.accept(*child);
                    stack.push((*child, depth + 1));
                } else {
                    outcome.rejected.insert(*child);
                }
            }
        }

        tracing::info!(
            accepted = outcome.accepted.len(),
            decisions = outcome.decisions,
            "tree search finished"
        );
        outcome
    }
}
