//! Input formats for building a code tree
//!
//! The main format is a list of hierarchy rows. Each row is the
//! path from a top-level chapter down to one code, shallowest
//! first. An entry in a row can be written as
//! * null, meaning "no node at this level" (skipped);
//! * a bare code string, e.g. "001.0";
//! * an object {code, descr}, where code may be null and
//!   descr may be missing (the description then defaults to
//!   the code).
//!
//! The second format is a flat table of codes with parent links
//! (as used for ICD-10-CM extracts), which is converted into
//! hierarchy rows.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{IcdError, Result};

/// One entry in a hierarchy row
#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Clone)]
#[serde(from = "RawLink")]
pub struct HierarchyLink {
    /// The code at this level, or None for a placeholder
    pub code: Option<String>,
    /// The code description, if the dataset has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descr: Option<String>,
}

impl HierarchyLink {
    pub fn new(code: &str, descr: Option<&str>) -> Self {
        Self {
            code: Some(code.to_string()),
            descr: descr.map(String::from),
        }
    }

    /// A "no node at this level" placeholder
    pub fn placeholder() -> Self {
        Self {
            code: None,
            descr: None,
        }
    }

    /// The code, unless this entry should be skipped
    pub fn present_code(&self) -> Option<&str> {
        self.code.as_deref().filter(|code| !code.is_empty())
    }
}

/// The encodings accepted for one entry of a row
#[derive(Deserialize)]
#[serde(untagged)]
enum RawLink {
    Bare(Option<String>),
    Entry {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        descr: Option<String>,
    },
}

impl From<RawLink> for HierarchyLink {
    fn from(raw: RawLink) -> Self {
        match raw {
            RawLink::Bare(code) => Self { code, descr: None },
            RawLink::Entry { code, descr } => Self { code, descr },
        }
    }
}

/// A path from the top of the tree to one code
pub type HierarchyRow = Vec<HierarchyLink>;

/// A row of a flat code table; e.g.
/// {"code": "A00.0", "desc": "Cholera due to ...", "parent": "A00"}
#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Clone)]
pub struct FlatCode {
    pub code: String,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
}

/// Convert a flat code table into hierarchy rows, one per code.
///
/// Each row runs from the code's top-most ancestor down to the
/// code. A parent that is not itself in the table ends the walk
/// (the code below it becomes top-level). Parent links that loop
/// back on themselves are rejected.
pub fn rows_from_flat_codes(flat_codes: &[FlatCode]) -> Result<Vec<HierarchyRow>> {
    let by_code: HashMap<&str, &FlatCode> = flat_codes
        .iter()
        .map(|flat_code| (flat_code.code.as_str(), flat_code))
        .collect();

    let mut rows = Vec::with_capacity(flat_codes.len());
    for flat_code in flat_codes {
        let mut chain = vec![flat_code];
        let mut seen = HashSet::from([flat_code.code.as_str()]);
        let mut current = flat_code;
        while let Some(parent) = current.parent.as_deref().filter(|p| !p.is_empty()) {
            let Some(&parent_code) = by_code.get(parent) else {
                tracing::warn!(
                    code = %current.code,
                    missing_parent = parent,
                    "parent is not in the code table; treating code as top-level"
                );
                break;
            };
            if !seen.insert(parent) {
                return Err(IcdError::DataLoad(format!(
                    "parent links of {} form a cycle through {}",
                    flat_code.code, parent
                )));
            }
            chain.push(parent_code);
            current = parent_code;
        }
        rows.push(
            chain
                .into_iter()
                .rev()
                .map(|c| HierarchyLink::new(&c.code, c.desc.as_deref()))
                .collect(),
        );
    }
    Ok(rows)
}

/// Tests for the dataset formats
///
/// Things to check:
/// * all three entry encodings deserialize
/// * flat tables turn into root-first chains
/// * cycles in flat tables are an error
#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn deserialize_mixed_entry_encodings() {
        let json = r#"[[null, "001-139", {"code": "001", "descr": "Cholera"}, {"code": null}, {"code": "001.0"}]]"#;
        let rows: Vec<HierarchyRow> = serde_json::from_str(json).unwrap();
        assert_eq!(
            rows,
            vec![vec![
                HierarchyLink::placeholder(),
                HierarchyLink::new("001-139", None),
                HierarchyLink::new("001", Some("Cholera")),
                HierarchyLink::placeholder(),
                HierarchyLink::new("001.0", None),
            ]]
        );
    }

    #[test]
    fn empty_code_is_skipped() {
        let link = HierarchyLink::new("", Some("nothing"));
        assert_eq!(link.present_code(), None);
        assert_eq!(HierarchyLink::new("001", None).present_code(), Some("001"));
    }

    fn flat_example() -> Vec<FlatCode> {
        let json = r#"[
            {"code": "A00", "desc": "Cholera"},
            {"code": "A00.0", "desc": "Cholera due to Vibrio cholerae 01, biovar cholerae", "parent": "A00"},
            {"code": "A00.1", "desc": "Cholera due to Vibrio cholerae 01, biovar eltor", "parent": "A00"},
            {"code": "A01", "desc": "Typhoid and paratyphoid fevers"},
            {"code": "A01.0", "desc": "Typhoid fever", "parent": "A01"}
        ]"#;
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn flat_codes_become_root_first_chains() {
        let rows = rows_from_flat_codes(&flat_example()).unwrap();
        assert_eq!(rows.len(), 5);
        let codes: Vec<_> = rows[1].iter().map(|l| l.present_code().unwrap()).collect();
        assert_eq!(codes, vec!["A00", "A00.0"]);
        assert_eq!(rows[0].len(), 1);
    }

    #[test]
    fn unknown_parent_makes_code_top_level() {
        let flat = vec![FlatCode {
            code: String::from("B00.1"),
            desc: None,
            parent: Some(String::from("B00")),
        }];
        let rows = rows_from_flat_codes(&flat).unwrap();
        assert_eq!(rows, vec![vec![HierarchyLink::new("B00.1", None)]]);
    }

    #[test]
    fn cyclic_parents_are_rejected() {
        let flat = vec![
            FlatCode {
                code: String::from("X1"),
                desc: None,
                parent: Some(String::from("X2")),
            },
            FlatCode {
                code: String::from("X2"),
                desc: None,
                parent: Some(String::from("X1")),
            },
        ];
        assert!(matches!(
            rows_from_flat_codes(&flat),
            Err(IcdError::DataLoad(_))
        ));
    }
}
