//! Prompt templates for the three kinds of model call
//!
//! * keyword extraction from a case note;
//! * picking the single best code from a candidate listing;
//! * per-child yes/no decisions during tree search.

use crate::clinical_code_tree::ClinicalCodeTree;

pub const KEYWORD_SYSTEM: &str = "You are a medical coding assistant that extracts keywords.";

pub const RANKING_SYSTEM: &str =
    "You are a medical coding assistant that assigns the single most relevant ICD-9 code.";

pub const DECISION_SYSTEM: &str =
    "You are a medical coding assistant that judges which ICD-9 codes are relevant to a case note.";

/// Description used in listings for codes that are not in the tree
pub const UNKNOWN_DESCRIPTION: &str = "Unknown description";

pub fn keyword_extraction(note: &str) -> String {
    format!(
        r#"[Case note]:
{note}

[Task]:
From the case note above, extract the most important medical keywords. Break down compound terms into individual words. List the single keywords separated by commas. For example, for "tuberculous fibrosis of lung", you should extract "tuberculosis, fibrosis, lung".
"#
    )
}

pub fn manual_ranking(note: &str, code_descriptions: &str) -> String {
    format!(
        r#"[Case note]:
{note}

[Task]:
Below is a list of candidate ICD-9 codes with their descriptions. Choose the single code that best matches the case note. Respond with the code only, exactly as written in the list.

{code_descriptions}
"#
    )
}

/// Template used for the per-child decisions of the tree search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionTemplate {
    /// Asks for Yes/No and a short justification per code
    Justified,
    /// Asks for Yes/No only; suits smaller local models
    Terse,
}

impl DecisionTemplate {
    /// Pick the template that works best with the named model
    pub fn for_model(model_name: &str) -> Self {
        if model_name.to_lowercase().contains("llama") {
            Self::Terse
        } else {
            Self::Justified
        }
    }

    pub fn render(&self, note: &str, code_descriptions: &str) -> String {
        match self {
            Self::Justified => format!(
                r#"[Case note]:
{note}

[Task]:
Consider each of the following ICD-9 code descriptions and evaluate if there are any related mentions in the case note.
For each, respond with Yes or No, and a brief justification if Yes.
Start each line with the code exactly as written below.

{code_descriptions}
"#
            ),
            Self::Terse => format!(
                r#"[Case note]:
{note}

[Task]:
For each ICD-9 code description below, state if it is relevant to the case note (Yes/No).
Answer one code per line, starting with the code.

{code_descriptions}
"#
            ),
        }
    }
}

/// Newline-joined "code: description" listing. Codes that are not
/// in the tree get a placeholder description.
pub fn describe_codes<S: AsRef<str>>(tree: &ClinicalCodeTree, codes: &[S]) -> String {
    codes
        .iter()
        .map(|code| {
            let code = code.as_ref();
            let description = tree.description_of(code).unwrap_or(UNKNOWN_DESCRIPTION);
            format!("{code}: {description}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
