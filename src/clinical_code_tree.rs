//! Data structures for managing a tree of clinical codes
//!
//! The tree is built once from a hierarchy dataset (for example
//! the ICD-9-CM chapter/block/category/code listing) and is read
//! only afterwards. All the queries used by the code search
//! pipeline (exact lookup, leaves, ancestors, siblings) live here.
//!

use std::collections::BTreeSet;
use std::io::Read;

pub use hierarchy::{rows_from_flat_codes, FlatCode, HierarchyLink, HierarchyRow};
use index::DepthIndex;

use crate::clinical_code::{ClinicalCode, ClinicalCodeRef, ClinicalCodeStore};
use crate::error::Result;

mod hierarchy;
mod index;

/// Code given to the synthetic node at the top of every tree
pub const ROOT_CODE: &str = "ROOT";

/// The clinical code tree
///
/// Holds the arena of codes, a reference to the synthetic root
/// (code ROOT, depth -1), and the depth index used to make a
/// code at a given depth a singleton. The leaves of the whole
/// tree are computed once at construction, because every
/// candidate search scans all of them.
#[derive(Debug, Clone)]
pub struct ClinicalCodeTree {
    store: ClinicalCodeStore,
    root: ClinicalCodeRef,
    index: DepthIndex,
    /// Leaves under the root, ordered by reference
    all_leaves: Vec<ClinicalCodeRef>,
}

impl ClinicalCodeTree {
    /// Build the tree from hierarchy rows.
    ///
    /// Each row is a chain from the shallowest code to the
    /// deepest. Placeholder entries (no code) are skipped and do
    /// not use up a depth, so a row may produce a chain shorter
    /// than the row. A code already present at the same depth
    /// is reused, so rows sharing a prefix merge their children.
    ///
    /// Malformed rows never fail the build.
    pub fn from_hierarchy(rows: &[HierarchyRow]) -> Self {
        let mut store = ClinicalCodeStore::new();
        let root = store.insert(ClinicalCode::new(ROOT_CODE.to_string(), None, -1, None));
        let mut tree = Self {
            store,
            root,
            index: DepthIndex::new(),
            all_leaves: Vec::new(),
        };
        for row in rows {
            tree.add_row(row);
        }
        tree.all_leaves = tree.leaves(tree.root).into_iter().collect();
        tracing::info!(
            codes = tree.store.len() - 1,
            leaves = tree.all_leaves.len(),
            top_level = tree.index.count_at_depth(0),
            max_depth = tree.index.max_depth(),
            "built clinical code tree"
        );
        tree
    }

    /// Read a clinical code tree from a byte source holding a JSON
    /// array of hierarchy rows.
    ///
    /// You can pass the result of std::fs::File::open() on
    /// a codes.json file to this function.
    pub fn from_reader<R>(reader: R) -> Result<Self>
    where
        R: Read,
    {
        let rows: Vec<HierarchyRow> = serde_json::from_reader(reader)?;
        Ok(Self::from_hierarchy(&rows))
    }

    /// Build the tree from a flat table of codes with parent links
    pub fn from_flat_codes(flat_codes: &[FlatCode]) -> Result<Self> {
        let rows = rows_from_flat_codes(flat_codes)?;
        Ok(Self::from_hierarchy(&rows))
    }

    /// Read a flat code table (JSON array of {code, desc, parent})
    pub fn from_flat_reader<R>(reader: R) -> Result<Self>
    where
        R: Read,
    {
        let flat_codes: Vec<FlatCode> = serde_json::from_reader(reader)?;
        Self::from_flat_codes(&flat_codes)
    }

    fn add_row(&mut self, row: &[HierarchyLink]) {
        let mut previous = self.root;
        for link in row {
            let Some(code) = link.present_code() else {
                continue;
            };
            let depth = self.node(previous).depth() + 1;
            let node = match self.index.get(depth, code) {
                Some(existing) => {
                    if self.node(existing).parent() != Some(previous) {
                        tracing::warn!(
                            code,
                            depth,
                            kept_parent = self.parent(existing).map(|p| self.node(p).code()),
                            ignored_parent = self.node(previous).code(),
                            "code appears under two parents; keeping the first"
                        );
                    }
                    existing
                }
                None => {
                    let clinical_code =
                        ClinicalCode::new(code.to_string(), link.descr.clone(), depth, Some(previous));
                    let new_ref = self.store.insert(clinical_code);
                    self.index.insert(depth, code, new_ref);
                    self.store.attach(previous, new_ref);
                    new_ref
                }
            };
            previous = node;
        }
    }

    /// The synthetic root
    pub fn root(&self) -> ClinicalCodeRef {
        self.root
    }

    /// Get the code behind a reference.
    ///
    /// Panics if the reference was not produced by this tree.
    pub fn node(&self, code_ref: ClinicalCodeRef) -> &ClinicalCode {
        self.store
            .clinical_code_from(&code_ref)
            .expect("clinical code reference belongs to a different tree")
    }

    pub fn store(&self) -> &ClinicalCodeStore {
        &self.store
    }

    /// Number of codes in the tree, not counting the root
    pub fn len(&self) -> usize {
        self.store.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn children(&self, code_ref: ClinicalCodeRef) -> &[ClinicalCodeRef] {
        self.node(code_ref).children()
    }

    pub fn parent(&self, code_ref: ClinicalCodeRef) -> Option<ClinicalCodeRef> {
        self.node(code_ref).parent()
    }

    /// Every node under (and including) from whose code equals
    /// code exactly, in depth-first order
    pub fn search_from(&self, from: ClinicalCodeRef, code: &str) -> Vec<ClinicalCodeRef> {
        self.depth_first(from, |node| node.code() == code)
    }

    /// Every node in the tree whose code equals code exactly
    pub fn search(&self, code: &str) -> Vec<ClinicalCodeRef> {
        self.search_from(self.root, code)
    }

    /// The first node (depth-first) whose code equals code exactly
    pub fn find(&self, code: &str) -> Option<ClinicalCodeRef> {
        self.search(code).into_iter().next()
    }

    /// Look a code up at a known depth using the index
    pub fn find_at_depth(&self, depth: i32, code: &str) -> Option<ClinicalCodeRef> {
        self.index.get(depth, code)
    }

    /// Every node whose code contains fragment as a substring.
    ///
    /// This is the loose lookup (e.g. "001" also matches "001.0"
    /// and "001-009"); find and search only ever match exactly.
    pub fn search_containing(&self, fragment: &str) -> Vec<ClinicalCodeRef> {
        self.depth_first(self.root, |node| node.code().contains(fragment))
    }

    /// The first node whose code contains fragment
    pub fn find_containing(&self, fragment: &str) -> Option<ClinicalCodeRef> {
        self.search_containing(fragment).into_iter().next()
    }

    /// Pre-order traversal collecting the nodes matching a predicate
    fn depth_first<F>(&self, from: ClinicalCodeRef, matches: F) -> Vec<ClinicalCodeRef>
    where
        F: Fn(&ClinicalCode) -> bool,
    {
        let mut found = Vec::new();
        let mut stack = vec![from];
        while let Some(code_ref) = stack.pop() {
            let node = self.node(code_ref);
            if matches(node) {
                found.push(code_ref);
            }
            stack.extend(node.children().iter().rev());
        }
        found
    }

    /// The leaves under a node. A node with no children is its
    /// own only leaf. The set has no meaningful order.
    pub fn leaves(&self, code_ref: ClinicalCodeRef) -> BTreeSet<ClinicalCodeRef> {
        let mut leaves = BTreeSet::new();
        let mut stack = vec![code_ref];
        while let Some(current) = stack.pop() {
            let node = self.node(current);
            if node.is_leaf() {
                leaves.insert(current);
            } else {
                stack.extend(node.children());
            }
        }
        leaves
    }

    /// The leaves of the whole tree (computed at construction)
    pub fn all_leaves(&self) -> &[ClinicalCodeRef] {
        &self.all_leaves
    }

    /// Leaves under a node that sit at exactly depth
    pub fn leaves_at_depth(&self, code_ref: ClinicalCodeRef, depth: i32) -> Vec<ClinicalCodeRef> {
        self.leaves(code_ref)
            .into_iter()
            .filter(|leaf| self.node(*leaf).depth() == depth)
            .collect()
    }

    /// The codes of the leaves under a node
    pub fn codes(&self, code_ref: ClinicalCodeRef) -> Vec<&str> {
        self.leaves(code_ref)
            .into_iter()
            .map(|leaf| self.node(leaf).code())
            .collect()
    }

    /// The path from the root down to the node (both included)
    pub fn parents(&self, code_ref: ClinicalCodeRef) -> Vec<ClinicalCodeRef> {
        let mut path = vec![code_ref];
        let mut current = code_ref;
        while let Some(parent) = self.parent(current) {
            path.push(parent);
            current = parent;
        }
        path.reverse();
        path
    }

    /// The children of the node's parent, including the node
    /// itself. Empty for the root.
    pub fn siblings(&self, code_ref: ClinicalCodeRef) -> &[ClinicalCodeRef] {
        match self.parent(code_ref) {
            Some(parent) => self.children(parent),
            None => &[],
        }
    }

    /// Description of the first node with this exact code
    pub fn description_of(&self, code: &str) -> Option<&str> {
        self.find(code).map(|code_ref| self.node(code_ref).description())
    }
}
