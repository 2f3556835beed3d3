//! Knowledge Object Model.
//!
//! The four knowledge object kinds share one representation: a kind tag, the
//! owning project, and a map of section key to value. Every kind has a fixed
//! schema; all sections are optional and absent sections are rendered with a
//! placeholder by the formatter, never filled in here.

use crate::core::error::GovernanceError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum KnowledgeKind {
    /// Canonical Knowledge Object, anchors INTENT.
    Cko,
    /// Workflow Knowledge Object, anchors ROUTE.
    Wko,
    /// Transfer Knowledge Object, a handoff record.
    Tko,
    /// Policy Knowledge Object.
    Pko,
}

impl KnowledgeKind {
    pub const ALL: [KnowledgeKind; 4] = [
        KnowledgeKind::Cko,
        KnowledgeKind::Wko,
        KnowledgeKind::Tko,
        KnowledgeKind::Pko,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeKind::Cko => "CKO",
            KnowledgeKind::Wko => "WKO",
            KnowledgeKind::Tko => "TKO",
            KnowledgeKind::Pko => "PKO",
        }
    }

    pub fn schema(&self) -> &'static KindSchema {
        match self {
            KnowledgeKind::Cko => &CKO_SCHEMA,
            KnowledgeKind::Wko => &WKO_SCHEMA,
            KnowledgeKind::Tko => &TKO_SCHEMA,
            KnowledgeKind::Pko => &PKO_SCHEMA,
        }
    }
}

impl fmt::Display for KnowledgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{PREFIX}-PROJECT-{NNNNNN}`, project scoped and zero padded.
pub fn identifier(prefix: &str, project_id: u64) -> String {
    format!("{}-PROJECT-{:06}", prefix, project_id)
}

/// One stored field of a section.
#[derive(Debug)]
pub struct FieldSpec {
    pub key: &'static str,
    /// Sub-label inside a composite section; `None` renders the body bare.
    pub label: Option<&'static str>,
}

#[derive(Debug)]
pub struct SectionSpec {
    pub title: &'static str,
    pub fields: &'static [FieldSpec],
}

#[derive(Debug)]
pub struct KindSchema {
    pub kind: KnowledgeKind,
    /// Rendered directly under the identifier header.
    pub summary_key: &'static str,
    /// Whether the summary is subject to the advisory word ceiling.
    pub summary_word_capped: bool,
    pub sections: &'static [SectionSpec],
}

impl KindSchema {
    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        std::iter::once(self.summary_key)
            .chain(self.sections.iter().flat_map(|s| s.fields.iter().map(|f| f.key)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys().any(|k| k == key)
    }
}

const fn plain(key: &'static str) -> FieldSpec {
    FieldSpec { key, label: None }
}

const fn labelled(key: &'static str, label: &'static str) -> FieldSpec {
    FieldSpec {
        key,
        label: Some(label),
    }
}

static CKO_SCHEMA: KindSchema = KindSchema {
    kind: KnowledgeKind::Cko,
    summary_key: "canonical_summary",
    summary_word_capped: true,
    sections: &[
        SectionSpec {
            title: "SCOPE",
            fields: &[
                labelled("scope_in_scope", "In-Scope"),
                labelled("scope_out_of_scope", "Out-of-Scope"),
                labelled("scope_hard_constraints", "Hard Constraints"),
            ],
        },
        SectionSpec {
            title: "STATEMENT",
            fields: &[plain("statement")],
        },
        SectionSpec {
            title: "SUPPORTING BASIS",
            fields: &[plain("supporting_basis")],
        },
        SectionSpec {
            title: "ASSUMPTIONS",
            fields: &[plain("assumptions")],
        },
        SectionSpec {
            title: "ALTERNATIVES CONSIDERED",
            fields: &[plain("alternatives_considered")],
        },
        SectionSpec {
            title: "UNCERTAINTIES / LIMITS",
            fields: &[plain("uncertainties_limits")],
        },
        SectionSpec {
            title: "PROVENANCE",
            fields: &[plain("provenance")],
        },
    ],
};

static WKO_SCHEMA: KindSchema = KindSchema {
    kind: KnowledgeKind::Wko,
    summary_key: "purpose",
    summary_word_capped: false,
    sections: &[
        SectionSpec {
            title: "CURRENT STATE",
            fields: &[plain("current_state")],
        },
        SectionSpec {
            title: "OPEN QUESTIONS",
            fields: &[plain("open_questions")],
        },
        SectionSpec {
            title: "OPTIONS / CANDIDATE APPROACHES",
            fields: &[plain("options_candidate_approaches")],
        },
        SectionSpec {
            title: "RISKS / DEPENDENCIES",
            fields: &[plain("risks_dependencies")],
        },
        SectionSpec {
            title: "NEXT ACTIONS",
            fields: &[plain("next_actions")],
        },
        SectionSpec {
            title: "PROVENANCE",
            fields: &[plain("provenance")],
        },
    ],
};

static TKO_SCHEMA: KindSchema = KindSchema {
    kind: KnowledgeKind::Tko,
    summary_key: "canonical_summary",
    summary_word_capped: true,
    sections: &[
        SectionSpec {
            title: "WORKING PREFERENCES",
            fields: &[plain("working_preferences")],
        },
        SectionSpec {
            title: "CONTEXT / WHY THIS EXISTS",
            fields: &[plain("context")],
        },
        SectionSpec {
            title: "CURRENT STATE",
            fields: &[plain("current_state")],
        },
        SectionSpec {
            title: "DECISIONS MADE (AND WHY)",
            fields: &[plain("decisions_made")],
        },
        SectionSpec {
            title: "IN SCOPE NEXT",
            fields: &[plain("in_scope_next")],
        },
        SectionSpec {
            title: "OUT OF SCOPE",
            fields: &[plain("out_of_scope")],
        },
        SectionSpec {
            title: "KNOWN RISKS / GOTCHAS",
            fields: &[plain("known_risks")],
        },
        SectionSpec {
            title: "FILES / MODULES / COMMANDS",
            fields: &[plain("files_modules_commands")],
        },
        SectionSpec {
            title: "NEXT STEP",
            fields: &[plain("next_step")],
        },
    ],
};

static PKO_SCHEMA: KindSchema = KindSchema {
    kind: KnowledgeKind::Pko,
    summary_key: "policy_summary",
    summary_word_capped: true,
    sections: &[
        SectionSpec {
            title: "POLICY STATEMENT",
            fields: &[plain("policy_statement")],
        },
        SectionSpec {
            title: "RATIONALE",
            fields: &[plain("rationale")],
        },
        SectionSpec {
            title: "APPLIES TO",
            fields: &[plain("applies_to")],
        },
        SectionSpec {
            title: "DOES NOT APPLY TO",
            fields: &[plain("does_not_apply_to")],
        },
        SectionSpec {
            title: "ENFORCEMENT",
            fields: &[plain("enforcement")],
        },
        SectionSpec {
            title: "EXCEPTIONS",
            fields: &[plain("exceptions")],
        },
        SectionSpec {
            title: "VERSIONING / PROVENANCE",
            fields: &[plain("versioning_provenance")],
        },
    ],
};

/// A section body: free text, a bullet list, or an ordered list.
///
/// In JSON: `"text"`, `["a", "b"]`, or `{"steps": ["first", "second"]}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SectionValue {
    Text(String),
    Bullets(Vec<String>),
    Steps { steps: Vec<String> },
}

impl SectionValue {
    pub fn text(value: impl Into<String>) -> Self {
        SectionValue::Text(value.into())
    }

    pub fn bullets<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SectionValue::Bullets(items.into_iter().map(Into::into).collect())
    }

    pub fn steps<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SectionValue::Steps {
            steps: items.into_iter().map(Into::into).collect(),
        }
    }

    /// Trimmed copy with empty items dropped; `None` when nothing remains.
    pub fn normalised(self) -> Option<Self> {
        fn clean(items: Vec<String>) -> Vec<String> {
            items
                .into_iter()
                .map(|i| i.trim().to_string())
                .filter(|i| !i.is_empty())
                .collect()
        }
        let out = match self {
            SectionValue::Text(t) => SectionValue::Text(t.trim().to_string()),
            SectionValue::Bullets(items) => SectionValue::Bullets(clean(items)),
            SectionValue::Steps { steps } => SectionValue::Steps {
                steps: clean(steps),
            },
        };
        if out.is_empty() { None } else { Some(out) }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            SectionValue::Text(t) => t.trim().is_empty(),
            SectionValue::Bullets(items) | SectionValue::Steps { steps: items } => {
                items.iter().all(|i| i.trim().is_empty())
            }
        }
    }

    pub fn is_ordered(&self) -> bool {
        matches!(self, SectionValue::Steps { .. })
    }

    pub fn word_count(&self) -> usize {
        match self {
            SectionValue::Text(t) => t.split_whitespace().count(),
            SectionValue::Bullets(items) | SectionValue::Steps { steps: items } => {
                items.iter().map(|i| i.split_whitespace().count()).sum()
            }
        }
    }

    /// Number of distinct entries: list items, or non-empty text lines.
    pub fn entry_count(&self) -> usize {
        match self {
            SectionValue::Text(t) => t.lines().filter(|l| !l.trim().is_empty()).count(),
            SectionValue::Bullets(items) | SectionValue::Steps { steps: items } => items.len(),
        }
    }
}

/// Proposed section values; `None` clears a section.
pub type FieldMap = BTreeMap<String, Option<SectionValue>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaWarning {
    pub section: String,
    pub message: String,
}

/// Lower case, with space, `-`, `/` and `.` folded to `_`.
pub fn normalise_key(raw: &str) -> String {
    raw.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| match c {
            ' ' | '-' | '/' | '.' => '_',
            other => other,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnowledgeObject {
    pub kind: KnowledgeKind,
    pub project_id: u64,
    #[serde(default)]
    pub sections: BTreeMap<String, SectionValue>,
}

impl KnowledgeObject {
    pub fn new(kind: KnowledgeKind, project_id: u64) -> Self {
        Self {
            kind,
            project_id,
            sections: BTreeMap::new(),
        }
    }

    /// Build and validate an object from raw submitted fields.
    pub fn from_fields(
        kind: KnowledgeKind,
        project_id: u64,
        fields: FieldMap,
        word_limit: usize,
    ) -> Result<(Self, Vec<SchemaWarning>), GovernanceError> {
        let mut object = Self::new(kind, project_id);
        object.apply_fields(fields, word_limit)?;
        let warnings = object.validate(word_limit)?;
        Ok((object, warnings))
    }

    pub fn identifier(&self) -> String {
        identifier(self.kind.as_str(), self.project_id)
    }

    pub fn get(&self, key: &str) -> Option<&SectionValue> {
        self.sections.get(key)
    }

    /// Replace sections wholesale. All keys are checked before anything is
    /// applied. Returns the keys whose value actually changed.
    pub fn apply_fields(
        &mut self,
        fields: FieldMap,
        word_limit: usize,
    ) -> Result<Vec<String>, GovernanceError> {
        let schema = self.kind.schema();
        let mut staged: BTreeMap<String, Option<SectionValue>> = BTreeMap::new();
        for (raw_key, value) in fields {
            let key = normalise_key(&raw_key);
            if !schema.contains(&key) {
                return Err(GovernanceError::SchemaViolation(format!(
                    "unknown section '{}' for {}",
                    raw_key, self.kind
                )));
            }
            if staged.contains_key(&key) {
                return Err(GovernanceError::SchemaViolation(format!(
                    "section '{}' given more than once for {}",
                    key, self.kind
                )));
            }
            staged.insert(key, value.and_then(SectionValue::normalised));
        }

        let mut candidate = self.sections.clone();
        let mut changed = Vec::new();
        for (key, value) in staged {
            let before = candidate.get(&key).cloned();
            match value {
                Some(v) => {
                    candidate.insert(key.clone(), v);
                }
                None => {
                    candidate.remove(&key);
                }
            }
            if candidate.get(&key) != before.as_ref() {
                changed.push(key);
            }
        }

        let staged = KnowledgeObject {
            kind: self.kind,
            project_id: self.project_id,
            sections: candidate,
        };
        staged.validate(word_limit)?;
        self.sections = staged.sections;
        Ok(changed)
    }

    /// Structural checks plus advisory warnings.
    pub fn validate(&self, word_limit: usize) -> Result<Vec<SchemaWarning>, GovernanceError> {
        let schema = self.kind.schema();
        if let Some(key) = self.sections.keys().find(|k| !schema.contains(k)) {
            return Err(GovernanceError::SchemaViolation(format!(
                "unknown section '{}' for {}",
                key, self.kind
            )));
        }

        if self.kind == KnowledgeKind::Tko
            && let Some(step) = self.sections.get("next_step")
            && step.entry_count() > 1
        {
            return Err(GovernanceError::SchemaViolation(format!(
                "next_step must hold exactly one step, found {}",
                step.entry_count()
            )));
        }

        let mut warnings = Vec::new();
        if schema.summary_word_capped
            && let Some(summary) = self.sections.get(schema.summary_key)
        {
            let words = summary.word_count();
            if words > word_limit {
                warnings.push(SchemaWarning {
                    section: schema.summary_key.to_string(),
                    message: format!(
                        "summary has {} words; keep it to {} or fewer",
                        words, word_limit
                    ),
                });
            }
        }
        Ok(warnings)
    }
}
