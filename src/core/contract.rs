//! Contract Validator.
//!
//! Each Review Conference runs under one contract, a tagged set of rules.
//! Validation happens before anything is applied: a failing rule yields a
//! rejection naming the rule, and the caller keeps the prior artefact.

use crate::core::artefact::ArtefactKind;
use crate::core::error::GovernanceError;
use crate::core::formatter::normalise_sections;
use crate::core::knowledge::normalise_key;
use crate::core::ledger::{self, ExecuteLedger, LedgerMutation, Stage};
use crate::core::marker::Marker;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContractRule {
    AnchorKindMatchesMarker,
    BodyMatchesMarker,
    SectionsWithinSchema,
    SingleStageScope,
    StageIdentityPreserved,
    NoInventedStages,
    NoRemovedStages,
    StageOrderPreserved,
    NoInventedWorkItems,
    NoRemovedWorkItems,
    AppendOnlyHistory,
    LedgerShape,
    LedgerIdentityPreserved,
    SingleJsonBlock,
    RouteRevisionCurrent,
}

impl ContractRule {
    pub fn code(&self) -> &'static str {
        match self {
            ContractRule::AnchorKindMatchesMarker => "ANCHOR_KIND_MATCHES_MARKER",
            ContractRule::BodyMatchesMarker => "BODY_MATCHES_MARKER",
            ContractRule::SectionsWithinSchema => "SECTIONS_WITHIN_SCHEMA",
            ContractRule::SingleStageScope => "SINGLE_STAGE_SCOPE",
            ContractRule::StageIdentityPreserved => "STAGE_IDENTITY_PRESERVED",
            ContractRule::NoInventedStages => "NO_INVENTED_STAGES",
            ContractRule::NoRemovedStages => "NO_REMOVED_STAGES",
            ContractRule::StageOrderPreserved => "STAGE_ORDER_PRESERVED",
            ContractRule::NoInventedWorkItems => "NO_INVENTED_WORK_ITEMS",
            ContractRule::NoRemovedWorkItems => "NO_REMOVED_WORK_ITEMS",
            ContractRule::AppendOnlyHistory => "APPEND_ONLY_HISTORY",
            ContractRule::LedgerShape => "LEDGER_SHAPE",
            ContractRule::LedgerIdentityPreserved => "LEDGER_IDENTITY_PRESERVED",
            ContractRule::SingleJsonBlock => "SINGLE_JSON_BLOCK",
            ContractRule::RouteRevisionCurrent => "ROUTE_REVISION_CURRENT",
        }
    }

    /// The line handed to a conference participant.
    pub fn instruction(&self) -> &'static str {
        match self {
            ContractRule::AnchorKindMatchesMarker => {
                "The artefact must be the anchor kind for this marker."
            }
            ContractRule::BodyMatchesMarker => {
                "Send section fields for INTENT, ROUTE and COMPLETE; send ledger changes for EXECUTE."
            }
            ContractRule::SectionsWithinSchema => {
                "Replace sections wholesale; use only sections of this artefact's schema."
            }
            ContractRule::SingleStageScope => "Change only the stage under review.",
            ContractRule::StageIdentityPreserved => "Do not change stage_id or stage_number.",
            ContractRule::NoInventedStages => "Do not invent stages.",
            ContractRule::NoRemovedStages => "Do not drop stages that ROUTE defines.",
            ContractRule::StageOrderPreserved => "Keep stages in ROUTE order.",
            ContractRule::NoInventedWorkItems => "Do not invent work items.",
            ContractRule::NoRemovedWorkItems => "Do not drop work items that ROUTE defines.",
            ContractRule::AppendOnlyHistory => {
                "Do not delete decisions, evidence, or history fields. Append only."
            }
            ContractRule::LedgerShape => "Keep artefact_type EXECUTION_STATE and marker EXECUTE.",
            ContractRule::LedgerIdentityPreserved => {
                "Do not change project_id, version or source_route."
            }
            ContractRule::SingleJsonBlock => {
                "When the user says ready, return JSON only in one json block."
            }
            ContractRule::RouteRevisionCurrent => {
                "Regenerate only from the current ROUTE anchor version."
            }
        }
    }

    /// Violations of this rule can only be resolved by revising ROUTE.
    pub fn requires_route_revision(&self) -> bool {
        matches!(
            self,
            ContractRule::NoInventedStages
                | ContractRule::NoRemovedStages
                | ContractRule::StageOrderPreserved
                | ContractRule::NoInventedWorkItems
                | ContractRule::NoRemovedWorkItems
        )
    }
}

impl fmt::Display for ContractRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Contract {
    /// INTENT, ROUTE and COMPLETE: wholesale section replacement.
    General,
    /// One EXECUTE stage.
    StageReview,
    /// The whole EXECUTE ledger.
    ExecuteReview,
    /// A new ledger generation from a ROUTE revision.
    Regeneration,
}

const GENERAL_RULES: &[ContractRule] = &[
    ContractRule::AnchorKindMatchesMarker,
    ContractRule::BodyMatchesMarker,
    ContractRule::SectionsWithinSchema,
];

const STAGE_REVIEW_RULES: &[ContractRule] = &[
    ContractRule::AnchorKindMatchesMarker,
    ContractRule::SingleStageScope,
    ContractRule::StageIdentityPreserved,
    ContractRule::NoInventedStages,
    ContractRule::NoInventedWorkItems,
    ContractRule::NoRemovedWorkItems,
    ContractRule::AppendOnlyHistory,
    ContractRule::SingleJsonBlock,
];

const EXECUTE_REVIEW_RULES: &[ContractRule] = &[
    ContractRule::AnchorKindMatchesMarker,
    ContractRule::LedgerShape,
    ContractRule::LedgerIdentityPreserved,
    ContractRule::NoInventedStages,
    ContractRule::NoRemovedStages,
    ContractRule::StageOrderPreserved,
    ContractRule::StageIdentityPreserved,
    ContractRule::NoInventedWorkItems,
    ContractRule::NoRemovedWorkItems,
    ContractRule::AppendOnlyHistory,
    ContractRule::SingleJsonBlock,
];

const REGENERATION_RULES: &[ContractRule] = &[
    ContractRule::AnchorKindMatchesMarker,
    ContractRule::RouteRevisionCurrent,
];

impl Contract {
    pub fn as_str(&self) -> &'static str {
        match self {
            Contract::General => "general",
            Contract::StageReview => "stage_review",
            Contract::ExecuteReview => "execute_review",
            Contract::Regeneration => "regeneration",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Contract::General => "REVIEW CONFERENCE CONTRACT",
            Contract::StageReview => "STAGE REVIEW CONFERENCE CONTRACT",
            Contract::ExecuteReview => "EXECUTE REVIEW CONFERENCE CONTRACT",
            Contract::Regeneration => "LEDGER REGENERATION CONTRACT",
        }
    }

    pub fn rules(&self) -> &'static [ContractRule] {
        match self {
            Contract::General => GENERAL_RULES,
            Contract::StageReview => STAGE_REVIEW_RULES,
            Contract::ExecuteReview => EXECUTE_REVIEW_RULES,
            Contract::Regeneration => REGENERATION_RULES,
        }
    }

    /// Seed text for a conference running under this contract.
    pub fn brief(&self, marker: Marker) -> String {
        let mut out = format!("# {}\n\nMarker: {}\n\n", self.title(), marker);
        for rule in self.rules() {
            out.push_str(&format!("- {} [{}]\n", rule.instruction(), rule.code()));
        }
        if self.rules().iter().any(ContractRule::requires_route_revision) {
            out.push_str("\nIf the plan needs change, propose a ROUTE revision.\n");
        }
        normalise_sections(&out)
    }
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a request proposes, reduced to what the rules need.
#[derive(Debug, Clone, Copy)]
pub enum Proposal<'a> {
    /// Section keys to replace; `stages` marks a ROUTE stage list.
    Fields { keys: &'a [String], stages: bool },
    Status,
    Ledger(&'a LedgerMutation),
}

/// Accepted mutation: the contract applied and what it may change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub contract: Contract,
    pub changeable: Vec<String>,
}

fn missing_ledger() -> GovernanceError {
    GovernanceError::MarkerViolation("EXECUTE has no ledger yet; regenerate from ROUTE first".to_string())
}

fn find_stage<'a>(ledger: &'a ExecuteLedger, stage_id: &str) -> Result<&'a Stage, GovernanceError> {
    ledger.stage(stage_id).ok_or_else(|| {
        GovernanceError::contract(
            ContractRule::NoInventedStages,
            format!("stage '{}' is not in the ledger", stage_id),
        )
    })
}

/// Pull the reviewed stage out of a full proposed ledger, refusing any
/// change to the other stages.
pub fn single_stage_from_ledger(
    current: &ExecuteLedger,
    proposed: &ExecuteLedger,
    target: &str,
) -> Result<Stage, GovernanceError> {
    proposed.check_shape()?;
    current.check_identity(proposed)?;
    ledger::check_stage_set(current, proposed)?;
    if let Some(other) = current
        .stages
        .iter()
        .zip(proposed.stages.iter())
        .find(|(old, new)| old.stage_id != target && old != new)
        .map(|(old, _)| old)
    {
        return Err(GovernanceError::contract(
            ContractRule::SingleStageScope,
            format!(
                "stage '{}' changed but only '{}' is under review",
                other.stage_id, target
            ),
        ));
    }
    find_stage(proposed, target).cloned()
}

/// Contract a request runs under.
pub fn contract_for(proposal: &Proposal<'_>) -> Contract {
    match proposal {
        Proposal::Fields { .. } | Proposal::Status => Contract::General,
        Proposal::Ledger(LedgerMutation::Append { .. }) | Proposal::Ledger(LedgerMutation::PatchStage { .. }) => {
            Contract::StageReview
        }
        Proposal::Ledger(LedgerMutation::Replace { .. }) => Contract::ExecuteReview,
        Proposal::Ledger(LedgerMutation::Regenerate { .. }) => Contract::Regeneration,
    }
}

/// Evaluate every rule of the applicable contract.
///
/// `ledger` is the current EXECUTE ledger, `route_version` the current
/// ROUTE anchor version; both are only consulted for EXECUTE.
pub fn validate(
    marker: Marker,
    kind: ArtefactKind,
    proposal: &Proposal<'_>,
    ledger: Option<&ExecuteLedger>,
    route_version: Option<u64>,
) -> Result<Verdict, GovernanceError> {
    let contract = contract_for(proposal);

    if !marker.accepts(kind) {
        return Err(GovernanceError::contract(
            ContractRule::AnchorKindMatchesMarker,
            format!("{} cannot anchor {}", kind, marker),
        ));
    }

    let changeable = match proposal {
        Proposal::Status => vec!["status".to_string()],
        Proposal::Fields { keys, stages } => {
            if marker == Marker::Execute {
                return Err(GovernanceError::contract(
                    ContractRule::BodyMatchesMarker,
                    "EXECUTE takes ledger changes, not section fields",
                ));
            }
            if *stages && marker != Marker::Route {
                return Err(GovernanceError::contract(
                    ContractRule::BodyMatchesMarker,
                    format!("stages belong to ROUTE, not {}", marker),
                ));
            }
            let Some(schema) = kind.knowledge_kind().map(|k| k.schema()) else {
                return Err(GovernanceError::contract(
                    ContractRule::BodyMatchesMarker,
                    format!("{} has no section schema", kind),
                ));
            };
            let mut changeable = Vec::with_capacity(keys.len() + 1);
            for raw in keys.iter() {
                let key = normalise_key(raw);
                if !schema.contains(&key) {
                    return Err(GovernanceError::SchemaViolation(format!(
                        "unknown section '{}' for {}",
                        raw, kind
                    )));
                }
                changeable.push(key);
            }
            if *stages {
                changeable.push("stages".to_string());
            }
            changeable
        }
        Proposal::Ledger(mutation) => {
            if marker != Marker::Execute {
                return Err(GovernanceError::contract(
                    ContractRule::BodyMatchesMarker,
                    format!("{} takes section fields, not ledger changes", marker),
                ));
            }
            validate_ledger(mutation, ledger, route_version)?
        }
    };

    Ok(Verdict {
        contract,
        changeable,
    })
}

fn validate_ledger(
    mutation: &LedgerMutation,
    ledger: Option<&ExecuteLedger>,
    route_version: Option<u64>,
) -> Result<Vec<String>, GovernanceError> {
    match mutation {
        LedgerMutation::Append {
            stage_id,
            stage_number,
            ..
        } => {
            let current = find_stage(ledger.ok_or_else(missing_ledger)?, stage_id)?;
            if current.stage_number != *stage_number {
                return Err(GovernanceError::contract(
                    ContractRule::StageIdentityPreserved,
                    format!(
                        "stage '{}' is stage_number {}, not {}",
                        stage_id, current.stage_number, stage_number
                    ),
                ));
            }
            Ok(vec![stage_id.clone()])
        }
        LedgerMutation::PatchStage { stage } => {
            let current = find_stage(ledger.ok_or_else(missing_ledger)?, &stage.stage_id)?;
            ledger::check_stage_identity(current, stage)?;
            ledger::check_work_items(current, stage)?;
            ledger::check_append_only(current, stage)?;
            Ok(vec![stage.stage_id.clone()])
        }
        LedgerMutation::Replace { ledger: proposed } => {
            let current = ledger.ok_or_else(missing_ledger)?;
            proposed.check_shape()?;
            current.check_identity(proposed)?;
            ledger::check_stage_set(current, proposed)?;
            let mut changed = Vec::new();
            for (old, new) in current.stages.iter().zip(proposed.stages.iter()) {
                ledger::check_work_items(old, new)?;
                ledger::check_append_only(old, new)?;
                if old != new {
                    changed.push(old.stage_id.clone());
                }
            }
            Ok(changed)
        }
        LedgerMutation::Regenerate { route_version: claimed } => {
            let Some(actual) = route_version else {
                return Err(GovernanceError::DeviationRequired(
                    "regeneration requires a ROUTE anchor".to_string(),
                ));
            };
            if *claimed != actual {
                return Err(GovernanceError::DeviationRequired(format!(
                    "[{}] regeneration names ROUTE version {} but ROUTE is at version {}",
                    ContractRule::RouteRevisionCurrent,
                    claimed,
                    actual
                )));
            }
            if let Some(current) = ledger
                && current.source_route.route_version >= *claimed
            {
                return Err(GovernanceError::DeviationRequired(format!(
                    "[{}] ledger already derives from ROUTE version {}",
                    ContractRule::RouteRevisionCurrent,
                    current.source_route.route_version
                )));
            }
            Ok(vec!["stages".to_string()])
        }
    }
}
