use std::collections::{BTreeMap, HashMap};

use crate::clinical_code::ClinicalCodeRef;

/// Index used to deduplicate codes while the tree is built.
///
/// The same code can appear in many rows of the hierarchy
/// dataset (every leaf row repeats its chapter, block and
/// category). Within one depth a code is a singleton: the
/// index maps (depth, code) to the one node that represents
/// it, so that repeated rows extend the existing node instead
/// of creating a copy.
///
/// Depths are kept ordered so that walking the index goes
/// from the top of the tree downwards.
#[derive(Debug, Default, Clone)]
pub struct DepthIndex {
    depths: BTreeMap<i32, HashMap<String, ClinicalCodeRef>>,
}

impl DepthIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the node for code at depth
    pub fn get(&self, depth: i32, code: &str) -> Option<ClinicalCodeRef> {
        self.depths
            .get(&depth)
            .and_then(|codes| codes.get(code))
            .copied()
    }

    /// Register the node for code at depth. If the code is already
    /// present, the existing reference is kept and returned.
    pub fn insert(&mut self, depth: i32, code: &str, code_ref: ClinicalCodeRef) -> ClinicalCodeRef {
        *self
            .depths
            .entry(depth)
            .or_default()
            .entry(code.to_string())
            .or_insert(code_ref)
    }

    /// Number of distinct codes registered at depth
    pub fn count_at_depth(&self, depth: i32) -> usize {
        self.depths.get(&depth).map_or(0, HashMap::len)
    }

    /// The deepest depth with at least one code, or None if empty
    pub fn max_depth(&self) -> Option<i32> {
        self.depths.keys().next_back().copied()
    }
}
