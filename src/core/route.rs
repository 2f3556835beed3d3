//! ROUTE plans: the workflow object plus the ordered stages an EXECUTE
//! ledger is derived from.

use crate::core::error::GovernanceError;
use crate::core::knowledge::{KnowledgeKind, KnowledgeObject};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteWorkItem {
    /// Empty means "not given"; normalisation assigns `W{stage_id}-{n}`.
    #[serde(default)]
    pub wi_id: String,
    #[serde(default)]
    pub title: String,
}

impl RouteWorkItem {
    pub fn new(wi_id: &str, title: &str) -> Self {
        Self {
            wi_id: wi_id.to_string(),
            title: title.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteStage {
    #[serde(default)]
    pub stage_id: String,
    /// 0 means "not given"; normalisation assigns the 1-based position.
    #[serde(default)]
    pub stage_number: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub description: String,
    /// Free text; one deliverable per line or a `1. 2. 3.` run.
    #[serde(default)]
    pub outputs: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub work_items: Vec<RouteWorkItem>,
}

impl RouteStage {
    pub fn new(stage_id: &str, stage_number: u32, title: &str) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            stage_number,
            title: title.to_string(),
            ..Self::default()
        }
    }

    pub fn with_work_items(mut self, titles: &[&str]) -> Self {
        self.work_items = titles.iter().map(|t| RouteWorkItem::new("", t)).collect();
        self
    }

    fn completeness(&self) -> usize {
        [&self.title, &self.purpose, &self.description, &self.outputs]
            .iter()
            .filter(|v| !v.trim().is_empty())
            .count()
            + self.work_items.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutePlan {
    pub workflow: KnowledgeObject,
    #[serde(default)]
    pub stages: Vec<RouteStage>,
}

pub fn validate_stage_id(stage_id: &str) -> Result<(), GovernanceError> {
    if stage_id.is_empty() {
        return Err(GovernanceError::SchemaViolation(
            "stage_id cannot be empty".to_string(),
        ));
    }
    if stage_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        Ok(())
    } else {
        Err(GovernanceError::SchemaViolation(format!(
            "invalid stage_id '{}': allowed characters are [A-Za-z0-9_-]",
            stage_id
        )))
    }
}

/// Trim titles, drop untitled rows and fill missing ids; a `wi_id` may
/// appear once per stage.
fn normalise_work_items(stage_id: &str, items: Vec<RouteWorkItem>) -> Result<Vec<RouteWorkItem>, GovernanceError> {
    let mut out: Vec<RouteWorkItem> = Vec::with_capacity(items.len());
    for (idx, item) in items.into_iter().enumerate() {
        let title = item.title.trim().to_string();
        let wi_id = match item.wi_id.trim() {
            "" => format!("W{}-{}", stage_id, idx + 1),
            id => id.to_string(),
        };
        if title.is_empty() && item.wi_id.trim().is_empty() {
            continue;
        }
        if out.iter().any(|w| w.wi_id == wi_id) {
            return Err(GovernanceError::SchemaViolation(format!(
                "stage '{}' lists work item '{}' twice",
                stage_id, wi_id
            )));
        }
        out.push(RouteWorkItem { wi_id, title });
    }
    Ok(out)
}

/// Fill missing ids and numbers, trim text, collapse duplicate stage keys
/// (keeping the more complete row at the first position) and order by
/// stage number.
pub fn normalise_stages(stages: Vec<RouteStage>) -> Result<Vec<RouteStage>, GovernanceError> {
    let mut rows: Vec<RouteStage> = Vec::with_capacity(stages.len());
    for (idx, raw) in stages.into_iter().enumerate() {
        let stage_number = if raw.stage_number == 0 {
            idx as u32 + 1
        } else {
            raw.stage_number
        };
        let stage_id = match raw.stage_id.trim() {
            "" => format!("S{}", stage_number),
            id => id.to_string(),
        };
        validate_stage_id(&stage_id)?;
        let row = RouteStage {
            stage_number,
            title: raw.title.trim().to_string(),
            purpose: raw.purpose.trim().to_string(),
            description: raw.description.trim().to_string(),
            outputs: raw.outputs.trim().to_string(),
            work_items: normalise_work_items(&stage_id, raw.work_items)?,
            stage_id,
        };
        match rows.iter_mut().find(|r| r.stage_id == row.stage_id) {
            Some(existing) => {
                if row.completeness() >= existing.completeness() {
                    *existing = row;
                }
            }
            None => rows.push(row),
        }
    }

    rows.sort_by_key(|r| r.stage_number);
    if let Some(pair) = rows
        .windows(2)
        .find(|pair| pair[0].stage_number == pair[1].stage_number)
    {
        return Err(GovernanceError::SchemaViolation(format!(
            "stages '{}' and '{}' share stage_number {}",
            pair[0].stage_id, pair[1].stage_id, pair[0].stage_number
        )));
    }
    Ok(rows)
}

impl RoutePlan {
    pub fn new(workflow: KnowledgeObject, stages: Vec<RouteStage>) -> Result<Self, GovernanceError> {
        if workflow.kind != KnowledgeKind::Wko {
            return Err(GovernanceError::SchemaViolation(format!(
                "ROUTE plans carry a WKO, not a {}",
                workflow.kind
            )));
        }
        Ok(Self {
            workflow,
            stages: normalise_stages(stages)?,
        })
    }

    pub fn project_id(&self) -> u64 {
        self.workflow.project_id
    }

    pub fn stage(&self, stage_id: &str) -> Option<&RouteStage> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }

    pub fn stage_ids(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.stage_id.as_str()).collect()
    }

    /// SHA-256 over the canonical JSON of the stage list.
    pub fn plan_hash(&self) -> Result<String, GovernanceError> {
        let bytes = serde_json::to_vec(&self.stages)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("{:x}", hasher.finalize()))
    }
}
