//! Storage for the nodes of a clinical code tree
//!
//! Nodes are kept in a flat arena (the ClinicalCodeStore) and refer
//! to each other by ClinicalCodeRef, which is an index into the
//! arena. The parent link is therefore just a back-reference and
//! never owns anything, and a built tree can be shared between
//! readers without any locking.

/// Stable reference to a clinical code inside a ClinicalCodeStore.
///
/// A reference is only meaningful for the store (and so the tree)
/// that handed it out.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ClinicalCodeRef(usize);

impl ClinicalCodeRef {
    /// Position of the code in its store
    pub fn index(&self) -> usize {
        self.0
    }
}

/// One node of the code tree; e.g. 001.0 (Cholera due to vibrio cholerae)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClinicalCode {
    /// The taxonomy identifier; e.g. 001-139, 001, 001.0
    code: String,
    /// The code description. Falls back to the code itself
    /// when the dataset does not provide one.
    description: String,
    /// Depth below the root. The root is -1, the top-level
    /// chapters are 0.
    depth: i32,
    /// None only for the root
    parent: Option<ClinicalCodeRef>,
    /// Sub-codes in the order they were first seen
    children: Vec<ClinicalCodeRef>,
}

impl ClinicalCode {
    pub fn new(
        code: String,
        description: Option<String>,
        depth: i32,
        parent: Option<ClinicalCodeRef>,
    ) -> Self {
        let description = match description {
            Some(description) if !description.is_empty() => description,
            _ => code.clone(),
        };
        Self {
            code,
            description,
            depth,
            parent,
            children: Vec::new(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn depth(&self) -> i32 {
        self.depth
    }

    pub fn parent(&self) -> Option<ClinicalCodeRef> {
        self.parent
    }

    pub fn children(&self) -> &[ClinicalCodeRef] {
        &self.children
    }

    /// A code is a leaf (the finest classification unit) when it
    /// has no sub-codes
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Append a child unless it is already present. Returns
    /// whether the child was added.
    fn add_child(&mut self, child: ClinicalCodeRef) -> bool {
        if self.children.contains(&child) {
            false
        } else {
            self.children.push(child);
            true
        }
    }
}

/// Arena owning every clinical code of one tree
#[derive(Debug, Default, Clone)]
pub struct ClinicalCodeStore {
    codes: Vec<ClinicalCode>,
}

impl ClinicalCodeStore {
    pub fn new() -> Self {
        Self { codes: Vec::new() }
    }

    /// Move a code into the store and return its reference
    pub fn insert(&mut self, clinical_code: ClinicalCode) -> ClinicalCodeRef {
        self.codes.push(clinical_code);
        ClinicalCodeRef(self.codes.len() - 1)
    }

    /// Get the code behind a reference, or None if the reference
    /// did not come from this store
    pub fn clinical_code_from(&self, code_ref: &ClinicalCodeRef) -> Option<&ClinicalCode> {
        self.codes.get(code_ref.0)
    }

    /// Link child under parent. Both references must come from
    /// this store.
    pub(crate) fn attach(&mut self, parent: ClinicalCodeRef, child: ClinicalCodeRef) -> bool {
        self.codes[parent.0].add_child(child)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// All references in insertion order
    pub fn refs(&self) -> impl Iterator<Item = ClinicalCodeRef> {
        (0..self.codes.len()).map(ClinicalCodeRef)
    }
}
