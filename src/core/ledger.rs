//! Execute Ledger Manager.
//!
//! The EXECUTE artefact is an ordered list of stages derived from the ROUTE
//! plan. Stage identity (`stage_id`, `stage_number`) is fixed once created
//! and the decision/evidence/history logs only ever grow. Every operation
//! here takes `&self` and returns a new ledger, so a rejected mutation can
//! never leave a half-applied ledger behind.

use crate::core::contract::ContractRule;
use crate::core::error::GovernanceError;
use crate::core::marker::Marker;
use crate::core::route::{RoutePlan, RouteStage};
use crate::core::time;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

pub const LEDGER_ARTEFACT_TYPE: &str = "EXECUTION_STATE";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    NotStarted,
    InProgress,
    Blocked,
    Done,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::NotStarted => "not_started",
            StageStatus::InProgress => "in_progress",
            StageStatus::Blocked => "blocked",
            StageStatus::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Decisions,
    Evidence,
    History,
}

impl LogKind {
    pub const ALL: [LogKind; 3] = [LogKind::Decisions, LogKind::Evidence, LogKind::History];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Decisions => "decisions",
            LogKind::Evidence => "evidence",
            LogKind::History => "history",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub entry_id: String,
    pub recorded_at: String,
    pub text: String,
}

impl LogEntry {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            entry_id: time::new_event_id(),
            recorded_at: time::now_epoch_z(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageOutput {
    pub output_id: String,
    pub title: String,
    #[serde(default)]
    pub status: StageStatus,
}

/// A unit of work a ROUTE stage names; its `wi_id` is fixed by ROUTE.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItem {
    pub wi_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: StageStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stage {
    pub stage_id: String,
    pub stage_number: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: StageStatus,
    #[serde(default)]
    pub outputs_due: Vec<StageOutput>,
    #[serde(default)]
    pub work_items: Vec<WorkItem>,
    #[serde(default)]
    pub decisions: Vec<LogEntry>,
    #[serde(default)]
    pub evidence: Vec<LogEntry>,
    #[serde(default)]
    pub history: Vec<LogEntry>,
}

impl Stage {
    fn from_route(route: &RouteStage) -> Self {
        let description = match (route.purpose.is_empty(), route.description.is_empty()) {
            (false, false) => format!("{}\n{}", route.purpose, route.description),
            (false, true) => route.purpose.clone(),
            _ => route.description.clone(),
        };
        Self {
            stage_id: route.stage_id.clone(),
            stage_number: route.stage_number,
            title: route.title.clone(),
            description,
            status: StageStatus::NotStarted,
            outputs_due: outputs_for(&route.stage_id, &route.outputs),
            work_items: route
                .work_items
                .iter()
                .map(|w| WorkItem {
                    wi_id: w.wi_id.clone(),
                    title: w.title.clone(),
                    status: StageStatus::NotStarted,
                })
                .collect(),
            decisions: Vec::new(),
            evidence: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn log(&self, kind: LogKind) -> &[LogEntry] {
        match kind {
            LogKind::Decisions => &self.decisions,
            LogKind::Evidence => &self.evidence,
            LogKind::History => &self.history,
        }
    }

    fn log_mut(&mut self, kind: LogKind) -> &mut Vec<LogEntry> {
        match kind {
            LogKind::Decisions => &mut self.decisions,
            LogKind::Evidence => &mut self.evidence,
            LogKind::History => &mut self.history,
        }
    }

    pub fn log_lengths(&self) -> [usize; 3] {
        [self.decisions.len(), self.evidence.len(), self.history.len()]
    }

    pub fn work_item(&self, wi_id: &str) -> Option<&WorkItem> {
        self.work_items.iter().find(|w| w.wi_id == wi_id)
    }

    /// Append a history entry for every status that differs from `before`.
    fn record_status_changes(&mut self, before: &Stage) {
        if self.status != before.status {
            self.history.push(LogEntry::new(format!(
                "status {} -> {}",
                before.status.as_str(),
                self.status.as_str()
            )));
        }
        let moved: Vec<String> = self
            .work_items
            .iter()
            .filter_map(|item| {
                let old = before.work_item(&item.wi_id)?;
                (old.status != item.status).then(|| {
                    format!(
                        "work item {} status {} -> {}",
                        item.wi_id,
                        old.status.as_str(),
                        item.status.as_str()
                    )
                })
            })
            .collect();
        self.history.extend(moved.into_iter().map(LogEntry::new));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceRoute {
    pub route_version: u64,
    pub route_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecuteLedger {
    pub artefact_type: String,
    pub marker: Marker,
    pub project_id: u64,
    /// Ledger generation; bumps only when regenerated from a ROUTE revision.
    pub version: u64,
    pub source_route: SourceRoute,
    #[serde(default)]
    pub current_stage_id: String,
    #[serde(default = "default_overall_status")]
    pub overall_status: String,
    pub stages: Vec<Stage>,
    /// Stages dropped by a ROUTE revision, kept with their logs.
    #[serde(default)]
    pub retired_stages: Vec<Stage>,
}

fn default_overall_status() -> String {
    "active".to_string()
}

/// A proposed change to the EXECUTE ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LedgerMutation {
    /// Append one entry to a stage log.
    Append {
        stage_id: String,
        stage_number: u32,
        log: LogKind,
        text: String,
    },
    /// Replace one stage (Stage Review Conference).
    PatchStage { stage: Stage },
    /// Replace the whole ledger (EXECUTE Review Conference).
    Replace { ledger: ExecuteLedger },
    /// Adopt the stage list of a newer ROUTE anchor version.
    Regenerate { route_version: u64 },
}

static NUMBERED_ITEM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?:^|\s)\d+\.\s+").unwrap());
static ITEM_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(?:\d+\.|[-*])\s*").unwrap());

/// Split a stage's free-text outputs into deliverables with stable ids.
pub fn outputs_for(stage_id: &str, text: &str) -> Vec<StageOutput> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    let parts: Vec<&str> = if NUMBERED_ITEM.is_match(text) {
        NUMBERED_ITEM.split(text).collect()
    } else {
        text.lines().collect()
    };
    let mut seen = BTreeSet::new();
    parts
        .into_iter()
        .map(|p| ITEM_PREFIX.replace(p.trim(), "").trim().to_string())
        .filter(|p| !p.is_empty())
        .enumerate()
        .map(|(idx, title)| {
            let base = format!("O{}-{}", stage_id, idx + 1);
            let mut output_id = base.clone();
            let mut suffix = 2;
            while !seen.insert(output_id.clone()) {
                output_id = format!("{}-{}", base, suffix);
                suffix += 1;
            }
            StageOutput {
                output_id,
                title,
                status: StageStatus::NotStarted,
            }
        })
        .collect()
}

/// `stage_id` and `stage_number` of `proposed` must equal `current`'s.
pub fn check_stage_identity(current: &Stage, proposed: &Stage) -> Result<(), GovernanceError> {
    if current.stage_id != proposed.stage_id {
        return Err(GovernanceError::contract(
            ContractRule::StageIdentityPreserved,
            format!(
                "stage_id '{}' cannot change to '{}'",
                current.stage_id, proposed.stage_id
            ),
        ));
    }
    if current.stage_number != proposed.stage_number {
        return Err(GovernanceError::contract(
            ContractRule::StageIdentityPreserved,
            format!(
                "stage '{}' stage_number {} cannot change to {}",
                current.stage_id, current.stage_number, proposed.stage_number
            ),
        ));
    }
    Ok(())
}

/// `proposed` must start with every entry of `current`, unchanged.
pub fn check_log_extends(
    stage_id: &str,
    kind: LogKind,
    current: &[LogEntry],
    proposed: &[LogEntry],
) -> Result<(), GovernanceError> {
    if proposed.len() < current.len() {
        return Err(GovernanceError::ImmutableHistoryViolation(format!(
            "stage '{}' {} would shrink from {} to {} entries",
            stage_id,
            kind,
            current.len(),
            proposed.len()
        )));
    }
    if let Some((old, _)) = current
        .iter()
        .zip(proposed.iter())
        .find(|(old, new)| old != new)
    {
        return Err(GovernanceError::ImmutableHistoryViolation(format!(
            "stage '{}' {} entry '{}' cannot be edited",
            stage_id, kind, old.entry_id
        )));
    }
    Ok(())
}

/// The stage's `wi_id` set is fixed by ROUTE.
pub fn check_work_items(current: &Stage, proposed: &Stage) -> Result<(), GovernanceError> {
    let current_ids: BTreeSet<&str> = current.work_items.iter().map(|w| w.wi_id.as_str()).collect();
    let proposed_ids: BTreeSet<&str> = proposed.work_items.iter().map(|w| w.wi_id.as_str()).collect();

    if let Some(invented) = proposed_ids.difference(&current_ids).next() {
        return Err(GovernanceError::contract(
            ContractRule::NoInventedWorkItems,
            format!(
                "work item '{}' is not part of stage '{}' in the ROUTE plan",
                invented, current.stage_id
            ),
        ));
    }
    if let Some(removed) = current_ids.difference(&proposed_ids).next() {
        return Err(GovernanceError::contract(
            ContractRule::NoRemovedWorkItems,
            format!(
                "work item '{}' of stage '{}' cannot be dropped without a ROUTE revision",
                removed, current.stage_id
            ),
        ));
    }
    if proposed.work_items.len() != current.work_items.len() {
        return Err(GovernanceError::contract(
            ContractRule::NoInventedWorkItems,
            format!("stage '{}' lists a work item more than once", current.stage_id),
        ));
    }
    Ok(())
}

pub fn check_append_only(current: &Stage, proposed: &Stage) -> Result<(), GovernanceError> {
    for kind in LogKind::ALL {
        check_log_extends(&current.stage_id, kind, current.log(kind), proposed.log(kind))?;
    }
    Ok(())
}

/// Same stage ids, in the same order, with the same numbers.
pub fn check_stage_set(current: &ExecuteLedger, proposed: &ExecuteLedger) -> Result<(), GovernanceError> {
    let current_ids: BTreeSet<&str> = current.stages.iter().map(|s| s.stage_id.as_str()).collect();
    let proposed_ids: BTreeSet<&str> = proposed.stages.iter().map(|s| s.stage_id.as_str()).collect();

    if let Some(invented) = proposed_ids.difference(&current_ids).next() {
        return Err(GovernanceError::contract(
            ContractRule::NoInventedStages,
            format!("stage '{}' is not part of the ROUTE plan", invented),
        ));
    }
    if let Some(removed) = current_ids.difference(&proposed_ids).next() {
        return Err(GovernanceError::contract(
            ContractRule::NoRemovedStages,
            format!("stage '{}' cannot be dropped without a ROUTE revision", removed),
        ));
    }
    if proposed.stages.len() != current.stages.len() {
        return Err(GovernanceError::contract(
            ContractRule::NoInventedStages,
            "a stage_id appears more than once",
        ));
    }
    for (old, new) in current.stages.iter().zip(proposed.stages.iter()) {
        if old.stage_id != new.stage_id {
            return Err(GovernanceError::contract(
                ContractRule::StageOrderPreserved,
                format!(
                    "stage '{}' moved; order must follow the ROUTE plan",
                    new.stage_id
                ),
            ));
        }
        check_stage_identity(old, new)?;
    }
    Ok(())
}

impl ExecuteLedger {
    /// First ledger generation for a ROUTE plan.
    pub fn seed_from_route(plan: &RoutePlan, route_version: u64) -> Result<Self, GovernanceError> {
        let stages: Vec<Stage> = plan.stages.iter().map(Stage::from_route).collect();
        Ok(Self {
            artefact_type: LEDGER_ARTEFACT_TYPE.to_string(),
            marker: Marker::Execute,
            project_id: plan.project_id(),
            version: 1,
            source_route: SourceRoute {
                route_version,
                route_hash: plan.plan_hash()?,
            },
            current_stage_id: stages.first().map(|s| s.stage_id.clone()).unwrap_or_default(),
            overall_status: default_overall_status(),
            stages,
            retired_stages: Vec::new(),
        })
    }

    pub fn stage(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }

    pub fn stage_ids(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.stage_id.as_str()).collect()
    }

    /// `artefact_type` and `marker` must name an EXECUTE ledger.
    pub fn check_shape(&self) -> Result<(), GovernanceError> {
        if self.artefact_type != LEDGER_ARTEFACT_TYPE {
            return Err(GovernanceError::contract(
                ContractRule::LedgerShape,
                format!(
                    "artefact_type must be {}, got '{}'",
                    LEDGER_ARTEFACT_TYPE, self.artefact_type
                ),
            ));
        }
        if self.marker != Marker::Execute {
            return Err(GovernanceError::contract(
                ContractRule::LedgerShape,
                format!("marker must be EXECUTE, got {}", self.marker),
            ));
        }
        Ok(())
    }

    /// Ledger-level identity: project, generation and ROUTE source.
    pub fn check_identity(&self, proposed: &ExecuteLedger) -> Result<(), GovernanceError> {
        if proposed.project_id != self.project_id
            || proposed.version != self.version
            || proposed.source_route != self.source_route
        {
            return Err(GovernanceError::contract(
                ContractRule::LedgerIdentityPreserved,
                "project_id, version and source_route are fixed for a ledger generation",
            ));
        }
        if proposed.retired_stages != self.retired_stages {
            return Err(GovernanceError::ImmutableHistoryViolation(
                "retired stages cannot be edited".to_string(),
            ));
        }
        Ok(())
    }

    pub fn apply(
        &self,
        mutation: &LedgerMutation,
        route: Option<(&RoutePlan, u64)>,
    ) -> Result<ExecuteLedger, GovernanceError> {
        match mutation {
            LedgerMutation::Append {
                stage_id,
                stage_number,
                log,
                text,
            } => self.append(stage_id, *stage_number, *log, text),
            LedgerMutation::PatchStage { stage } => self.patch_stage(stage.clone()),
            LedgerMutation::Replace { ledger } => self.replace(ledger.clone()),
            LedgerMutation::Regenerate { route_version } => match route {
                Some((plan, current_route_version)) if current_route_version == *route_version => {
                    self.regenerate(plan, *route_version)
                }
                Some((_, current_route_version)) => Err(GovernanceError::DeviationRequired(format!(
                    "regeneration names ROUTE version {} but the ROUTE anchor is at version {}",
                    route_version, current_route_version
                ))),
                None => Err(GovernanceError::DeviationRequired(
                    "regeneration requires a ROUTE anchor".to_string(),
                )),
            },
        }
    }

    /// Pure append to one stage log.
    pub fn append(
        &self,
        stage_id: &str,
        stage_number: u32,
        log: LogKind,
        text: &str,
    ) -> Result<ExecuteLedger, GovernanceError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(GovernanceError::SchemaViolation(format!(
                "{} entry text cannot be empty",
                log
            )));
        }
        let mut next = self.clone();
        let stage = next
            .stages
            .iter_mut()
            .find(|s| s.stage_id == stage_id)
            .ok_or_else(|| {
                GovernanceError::contract(
                    ContractRule::NoInventedStages,
                    format!("stage '{}' is not in the ledger", stage_id),
                )
            })?;
        if stage.stage_number != stage_number {
            return Err(GovernanceError::contract(
                ContractRule::StageIdentityPreserved,
                format!(
                    "stage '{}' is stage_number {}, not {}",
                    stage_id, stage.stage_number, stage_number
                ),
            ));
        }
        stage.log_mut(log).push(LogEntry::new(text));
        Ok(next)
    }

    /// Replace one stage. Identity and logs are checked against the
    /// current stage; a status change is recorded in its history.
    pub fn patch_stage(&self, proposed: Stage) -> Result<ExecuteLedger, GovernanceError> {
        let index = self
            .stages
            .iter()
            .position(|s| s.stage_id == proposed.stage_id)
            .ok_or_else(|| {
                GovernanceError::contract(
                    ContractRule::NoInventedStages,
                    format!("stage '{}' is not in the ledger", proposed.stage_id),
                )
            })?;
        let current = &self.stages[index];
        check_stage_identity(current, &proposed)?;
        check_work_items(current, &proposed)?;
        check_append_only(current, &proposed)?;

        let mut next = self.clone();
        let mut stage = proposed;
        stage.record_status_changes(current);
        if stage.status != current.status && stage.status == StageStatus::InProgress {
            next.current_stage_id = stage.stage_id.clone();
        }
        next.stages[index] = stage;
        Ok(next)
    }

    /// Replace the whole ledger without structural change. Status changes
    /// are recorded in history as `patch_stage` records them.
    pub fn replace(&self, mut proposed: ExecuteLedger) -> Result<ExecuteLedger, GovernanceError> {
        proposed.check_shape()?;
        self.check_identity(&proposed)?;
        check_stage_set(self, &proposed)?;
        for (old, new) in self.stages.iter().zip(proposed.stages.iter()) {
            check_work_items(old, new)?;
            check_append_only(old, new)?;
        }
        for (old, new) in self.stages.iter().zip(proposed.stages.iter_mut()) {
            new.record_status_changes(old);
        }
        if !proposed.current_stage_id.is_empty() && proposed.stage(&proposed.current_stage_id).is_none() {
            return Err(GovernanceError::contract(
                ContractRule::NoInventedStages,
                format!(
                    "current_stage_id '{}' is not in the ledger",
                    proposed.current_stage_id
                ),
            ));
        }
        Ok(proposed)
    }

    /// Derive the next ledger generation from a revised ROUTE plan.
    ///
    /// Logs are attached to the stage id: a surviving id keeps its logs
    /// wherever it lands in the new order. Stages absent from the plan are
    /// retired with their logs; a retired id that returns is revived.
    pub fn regenerate(&self, plan: &RoutePlan, route_version: u64) -> Result<ExecuteLedger, GovernanceError> {
        if route_version <= self.source_route.route_version {
            return Err(GovernanceError::DeviationRequired(format!(
                "ROUTE version {} is not newer than the ledger source version {}",
                route_version, self.source_route.route_version
            )));
        }

        let mut previous: Vec<Stage> = self
            .stages
            .iter()
            .chain(self.retired_stages.iter())
            .cloned()
            .collect();
        let mut stages = Vec::with_capacity(plan.stages.len());
        for route_stage in &plan.stages {
            let stage = match previous.iter().position(|s| s.stage_id == route_stage.stage_id) {
                Some(pos) => migrate_stage(previous.remove(pos), route_stage, route_version),
                None => Stage::from_route(route_stage),
            };
            stages.push(stage);
        }

        let live: BTreeSet<&str> = self.stages.iter().map(|s| s.stage_id.as_str()).collect();
        let retired_stages = previous
            .into_iter()
            .map(|mut s| {
                if live.contains(s.stage_id.as_str()) {
                    s.history.push(LogEntry::new(format!(
                        "retired by ROUTE version {}",
                        route_version
                    )));
                }
                s
            })
            .collect();

        let current_stage_id = if stages.iter().any(|s| s.stage_id == self.current_stage_id) {
            self.current_stage_id.clone()
        } else {
            stages.first().map(|s| s.stage_id.clone()).unwrap_or_default()
        };

        Ok(ExecuteLedger {
            artefact_type: LEDGER_ARTEFACT_TYPE.to_string(),
            marker: Marker::Execute,
            project_id: self.project_id,
            version: self.version + 1,
            source_route: SourceRoute {
                route_version,
                route_hash: plan.plan_hash()?,
            },
            current_stage_id,
            overall_status: self.overall_status.clone(),
            stages,
            retired_stages,
        })
    }
}

fn migrate_stage(mut stage: Stage, route: &RouteStage, route_version: u64) -> Stage {
    if stage.stage_number != route.stage_number {
        stage.history.push(LogEntry::new(format!(
            "stage_number {} -> {} by ROUTE version {}",
            stage.stage_number, route.stage_number, route_version
        )));
        stage.stage_number = route.stage_number;
    }
    let fresh = Stage::from_route(route);
    stage.title = fresh.title;
    stage.description = fresh.description;
    stage.outputs_due = fresh
        .outputs_due
        .into_iter()
        .map(|mut output| {
            if let Some(old) = stage.outputs_due.iter().find(|o| o.output_id == output.output_id) {
                output.status = old.status;
            }
            output
        })
        .collect();
    stage.work_items = fresh
        .work_items
        .into_iter()
        .map(|mut item| {
            if let Some(old) = stage.work_item(&item.wi_id) {
                item.status = old.status;
            }
            item
        })
        .collect();
    stage
}
