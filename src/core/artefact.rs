//! The artefact an anchor owns: a knowledge object, a route plan, or the
//! execute ledger.

use crate::core::error::GovernanceError;
use crate::core::formatter::{self, FormatOptions};
use crate::core::knowledge::{self, KnowledgeKind, KnowledgeObject};
use crate::core::ledger::ExecuteLedger;
use crate::core::route::RoutePlan;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtefactKind {
    Cko,
    Wko,
    Tko,
    Pko,
    ExecutionState,
}

impl ArtefactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtefactKind::Cko => "CKO",
            ArtefactKind::Wko => "WKO",
            ArtefactKind::Tko => "TKO",
            ArtefactKind::Pko => "PKO",
            ArtefactKind::ExecutionState => "EXECUTION_STATE",
        }
    }

    /// Identifier prefix.
    pub fn prefix(&self) -> &'static str {
        match self {
            ArtefactKind::ExecutionState => "EXE",
            other => other.as_str(),
        }
    }

    pub fn knowledge_kind(&self) -> Option<KnowledgeKind> {
        match self {
            ArtefactKind::Cko => Some(KnowledgeKind::Cko),
            ArtefactKind::Wko => Some(KnowledgeKind::Wko),
            ArtefactKind::Tko => Some(KnowledgeKind::Tko),
            ArtefactKind::Pko => Some(KnowledgeKind::Pko),
            ArtefactKind::ExecutionState => None,
        }
    }

    pub fn identifier(&self, project_id: u64) -> String {
        knowledge::identifier(self.prefix(), project_id)
    }
}

impl From<KnowledgeKind> for ArtefactKind {
    fn from(kind: KnowledgeKind) -> Self {
        match kind {
            KnowledgeKind::Cko => ArtefactKind::Cko,
            KnowledgeKind::Wko => ArtefactKind::Wko,
            KnowledgeKind::Tko => ArtefactKind::Tko,
            KnowledgeKind::Pko => ArtefactKind::Pko,
        }
    }
}

impl fmt::Display for ArtefactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtefactKind {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CKO" => Ok(ArtefactKind::Cko),
            "WKO" => Ok(ArtefactKind::Wko),
            "TKO" => Ok(ArtefactKind::Tko),
            "PKO" => Ok(ArtefactKind::Pko),
            "EXECUTION_STATE" | "EXE" => Ok(ArtefactKind::ExecutionState),
            other => Err(GovernanceError::ValidationError(format!(
                "unknown artefact kind '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Artefact {
    Knowledge(KnowledgeObject),
    Route(RoutePlan),
    Ledger(ExecuteLedger),
}

impl Artefact {
    pub fn kind(&self) -> ArtefactKind {
        match self {
            Artefact::Knowledge(obj) => obj.kind.into(),
            Artefact::Route(_) => ArtefactKind::Wko,
            Artefact::Ledger(_) => ArtefactKind::ExecutionState,
        }
    }

    pub fn project_id(&self) -> u64 {
        match self {
            Artefact::Knowledge(obj) => obj.project_id,
            Artefact::Route(plan) => plan.project_id(),
            Artefact::Ledger(ledger) => ledger.project_id,
        }
    }

    pub fn identifier(&self) -> String {
        self.kind().identifier(self.project_id())
    }

    pub fn as_ledger(&self) -> Option<&ExecuteLedger> {
        match self {
            Artefact::Ledger(ledger) => Some(ledger),
            _ => None,
        }
    }

    pub fn as_route(&self) -> Option<&RoutePlan> {
        match self {
            Artefact::Route(plan) => Some(plan),
            _ => None,
        }
    }

    /// Canonical document: text for knowledge objects and route plans, one
    /// `json` block for the ledger.
    pub fn render(&self, opts: &FormatOptions) -> Result<String, GovernanceError> {
        match self {
            Artefact::Knowledge(obj) => formatter::render_knowledge(obj, opts),
            Artefact::Route(plan) => formatter::render_route_plan(plan, opts),
            Artefact::Ledger(ledger) => formatter::render_ledger_block(ledger, opts),
        }
    }
}
