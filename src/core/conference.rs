//! Review Conference Session.
//!
//! One request, one conference: the engine loads the anchor for the
//! request's (project, marker), runs the marker guard and the contract,
//! applies the change to a copy of the artefact, renders it and commits
//! the new version (plus a regenerated EXECUTE ledger when a ROUTE
//! deviation changes the plan) in one batch. A rejected request returns
//! the untouched prior anchor.

use crate::core::artefact::{Artefact, ArtefactKind};
use crate::core::broker::append_event;
use crate::core::config::GovernanceConfig;
use crate::core::contract::{self, Contract, ContractRule, Proposal};
use crate::core::error::GovernanceError;
use crate::core::formatter::{self, EncodingStrictness, FormatOptions};
use crate::core::knowledge::{FieldMap, KnowledgeObject, SchemaWarning};
use crate::core::ledger::{ExecuteLedger, LedgerMutation};
use crate::core::marker::{self, AnchorStatus, Deviation, Lifecycle, Marker};
use crate::core::registry::{Anchor, AnchorKey, AnchorStore, CommitBatch};
use crate::core::route::{RoutePlan, RouteStage};
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

fn default_actor() -> String {
    "anonymous".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MutationBody {
    /// Wholesale section replacement; `stages` replaces the ROUTE stage list.
    Fields {
        fields: FieldMap,
        #[serde(default)]
        stages: Option<Vec<RouteStage>>,
    },
    /// A structured EXECUTE ledger change.
    StagePatch { patch: LedgerMutation },
    /// A conference response carrying the full ledger in one `json` block.
    /// With `target_stage` it is a Stage Review; without, an EXECUTE Review.
    LedgerText {
        text: String,
        #[serde(default)]
        target_stage: Option<String>,
    },
    Status { status: AnchorStatus },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviationRequest {
    /// Provenance note explaining the departure.
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationRequest {
    pub project_id: u64,
    pub chat_id: String,
    pub marker: Marker,
    pub artefact_kind: ArtefactKind,
    /// Version the caller read; 0 when no anchor exists yet.
    #[serde(default)]
    pub base_version: u64,
    #[serde(default = "default_actor")]
    pub actor: String,
    pub body: MutationBody,
    #[serde(default)]
    pub deviation: Option<DeviationRequest>,
}

impl MutationRequest {
    pub fn new(project_id: u64, chat_id: &str, marker: Marker, artefact_kind: ArtefactKind, body: MutationBody) -> Self {
        Self {
            project_id,
            chat_id: chat_id.to_string(),
            marker,
            artefact_kind,
            base_version: 0,
            actor: default_actor(),
            body,
            deviation: None,
        }
    }

    pub fn base(mut self, version: u64) -> Self {
        self.base_version = version;
        self
    }

    pub fn by(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }

    pub fn deviating(mut self, reason: &str) -> Self {
        self.deviation = Some(DeviationRequest {
            reason: reason.to_string(),
        });
        self
    }

    pub fn key(&self) -> AnchorKey {
        AnchorKey::new(self.project_id, self.marker)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Committed {
    pub conference_id: String,
    pub contract: Contract,
    /// Sections or stages the contract let this request change.
    pub changed: Vec<String>,
    pub anchor: Anchor,
    /// Canonical text, or one `json` block for EXECUTE.
    pub document: String,
    pub warnings: Vec<SchemaWarning>,
    /// EXECUTE anchor rewritten in the same batch by a ROUTE deviation.
    pub regenerated: Option<Anchor>,
}

#[derive(Debug, Error)]
#[error("conference {conference_id} rejected: {error}")]
pub struct Rejected {
    pub conference_id: String,
    #[source]
    pub error: GovernanceError,
    /// The anchor as it stood before the request; still authoritative.
    pub prior: Option<Anchor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConferenceEvent {
    pub ts: String,
    pub event_id: String,
    pub conference_id: String,
    pub project_id: u64,
    pub chat_id: String,
    pub marker: Marker,
    pub actor: String,
    pub status: String,
    pub code: Option<String>,
    pub version: Option<u64>,
    pub detail: String,
}

/// The body after encoding checks and JSON-block extraction.
enum Resolved {
    Fields {
        fields: FieldMap,
        stages: Option<Vec<RouteStage>>,
    },
    Ledger(LedgerMutation),
    Status(AnchorStatus),
}

/// Seed text for a conference: the contract brief plus the current
/// canonical document, if any.
pub fn conference_brief(contract: Contract, marker: Marker, anchor: Option<&Anchor>) -> String {
    let mut out = contract.brief(marker);
    match anchor {
        Some(anchor) => {
            out.push_str(&format!(
                "\n# CURRENT ANCHOR\n\n{} version {} ({})\n\n{}",
                anchor.identifier, anchor.version, anchor.status, anchor.document
            ));
        }
        None => out.push_str("\n# CURRENT ANCHOR\n\n(none)\n"),
    }
    formatter::normalise_sections(&out)
}

pub struct Engine<S: AnchorStore> {
    store: S,
    config: GovernanceConfig,
    audit_log: Option<PathBuf>,
}

impl<S: AnchorStore> Engine<S> {
    pub fn new(store: S, config: GovernanceConfig) -> Self {
        Self {
            store,
            config,
            audit_log: None,
        }
    }

    /// Append conference outcomes to `path` when `audit` is enabled.
    pub fn with_audit_log(mut self, path: PathBuf) -> Self {
        self.audit_log = Some(path);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    pub fn into_store(self) -> S {
        self.store
    }

    fn format_options(&self) -> FormatOptions {
        self.config.format_options()
    }

    /// Run one Review Conference.
    ///
    /// The whole request, metadata included, is made ASCII under the
    /// configured strictness before anything else runs.
    pub fn submit(&mut self, req: MutationRequest) -> Result<Committed, Rejected> {
        let conference_id = time::new_event_id();
        let outcome = formatter::ascii_clean(&req, self.config.encoding)
            .and_then(|clean| self.conduct(&conference_id, &clean));
        let req = formatter::ascii_clean(&req, EncodingStrictness::Transliterate).unwrap_or(req);
        match outcome {
            Ok(committed) => {
                self.record(
                    &req,
                    &conference_id,
                    "committed",
                    None,
                    Some(committed.anchor.version),
                    &format!("{} {}", committed.contract, committed.changed.join(",")),
                );
                Ok(committed)
            }
            Err(error) => {
                let prior = self.store.load(req.key()).ok().flatten();
                let status = if error.is_rejection() { "rejected" } else { "error" };
                self.record(
                    &req,
                    &conference_id,
                    status,
                    Some(error.code()),
                    prior.as_ref().map(|a| a.version),
                    &error.to_string(),
                );
                Err(Rejected {
                    conference_id,
                    error,
                    prior,
                })
            }
        }
    }

    fn record(
        &self,
        req: &MutationRequest,
        conference_id: &str,
        status: &str,
        code: Option<&str>,
        version: Option<u64>,
        detail: &str,
    ) {
        if !self.config.audit {
            return;
        }
        let Some(path) = &self.audit_log else {
            return;
        };
        let event = ConferenceEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            conference_id: conference_id.to_string(),
            project_id: req.project_id,
            chat_id: req.chat_id.clone(),
            marker: req.marker,
            actor: req.actor.clone(),
            status: status.to_string(),
            code: code.map(str::to_string),
            version,
            detail: formatter::enforce_ascii(detail, EncodingStrictness::Transliterate)
                .unwrap_or_else(|_| detail.to_string()),
        };
        // Audit failures never undo or mask a conference outcome.
        let _ = append_event(path, &event);
    }

    fn resolve(&self, body: &MutationBody, current: Option<&Anchor>) -> Result<Resolved, GovernanceError> {
        Ok(match body.clone() {
            MutationBody::Fields { fields, stages } => Resolved::Fields { fields, stages },
            MutationBody::StagePatch { patch } => Resolved::Ledger(patch),
            MutationBody::Status { status } => Resolved::Status(status),
            MutationBody::LedgerText { text, target_stage } => {
                let proposed: ExecuteLedger = formatter::parse_json_block(&text)?;
                let current = current
                    .and_then(|a| a.artefact.as_ledger())
                    .ok_or_else(|| {
                        GovernanceError::MarkerViolation(
                            "EXECUTE has no ledger yet; regenerate from ROUTE first".to_string(),
                        )
                    })?;
                match target_stage {
                    Some(target) => Resolved::Ledger(LedgerMutation::PatchStage {
                        stage: contract::single_stage_from_ledger(current, &proposed, &target)?,
                    }),
                    None => Resolved::Ledger(LedgerMutation::Replace { ledger: proposed }),
                }
            }
        })
    }

    fn conduct(&mut self, conference_id: &str, req: &MutationRequest) -> Result<Committed, GovernanceError> {
        if req.chat_id.trim().is_empty() {
            return Err(GovernanceError::ValidationError("chat_id cannot be empty".to_string()));
        }
        let key = req.key();
        let current = self.store.load(key)?;
        let current_version = current.as_ref().map(|a| a.version).unwrap_or(0);
        if req.base_version != current_version {
            return Err(GovernanceError::ConcurrencyConflict {
                expected: req.base_version,
                actual: current_version,
            });
        }
        if let Some(anchor) = &current
            && anchor.kind() != req.artefact_kind
        {
            return Err(GovernanceError::contract(
                ContractRule::AnchorKindMatchesMarker,
                format!(
                    "{} is anchored by a {}, not a {}",
                    req.marker,
                    anchor.kind(),
                    req.artefact_kind
                ),
            ));
        }

        let resolved = self.resolve(&req.body, current.as_ref())?;

        let route_anchor = match req.marker {
            Marker::Execute => self.store.load(AnchorKey::new(req.project_id, Marker::Route))?,
            _ => None,
        };
        let current_ledger = current.as_ref().and_then(|a| a.artefact.as_ledger());
        let keys: Vec<String> = match &resolved {
            Resolved::Fields { fields, .. } => fields.keys().cloned().collect(),
            _ => Vec::new(),
        };
        let proposal = match &resolved {
            Resolved::Fields { stages, .. } => Proposal::Fields {
                keys: &keys,
                stages: stages.is_some(),
            },
            Resolved::Ledger(mutation) => Proposal::Ledger(mutation),
            Resolved::Status(_) => Proposal::Status,
        };
        let verdict = contract::validate(
            req.marker,
            req.artefact_kind,
            &proposal,
            current_ledger,
            route_anchor.as_ref().map(|a| a.version),
        )?;

        if matches!(resolved, Resolved::Status(_)) && current.is_none() {
            return Err(GovernanceError::NotFound(format!("no anchor for {}", key)));
        }
        let status = match &resolved {
            Resolved::Status(status) => *status,
            _ => current.as_ref().map(|a| a.status).unwrap_or_default(),
        };

        let complete = match req.marker {
            Marker::Complete => current.clone(),
            _ => self.store.load(AnchorKey::new(req.project_id, Marker::Complete))?,
        };
        let lifecycle = self
            .store
            .load_lifecycle(req.project_id, &req.chat_id)?
            .unwrap_or_else(|| Lifecycle::new(req.project_id, &req.chat_id));
        let lifecycle = align_lifecycle(lifecycle, current.as_ref(), complete.as_ref());
        let snapshot = self.store.snapshot(req.project_id)?;
        let reason = req.deviation.as_ref().map(|d| d.reason.as_str());
        let transition = marker::check_transition(&snapshot, &lifecycle, req.marker, status, reason)?;

        let word_limit = self.config.summary_word_limit;
        let mut warnings = Vec::new();
        let artefact = match resolved {
            Resolved::Fields { fields, stages } => {
                let (artefact, w) = self.apply_fields(req, current.as_ref(), fields, stages, word_limit)?;
                warnings = w;
                artefact
            }
            Resolved::Ledger(mutation) => {
                let route = route_anchor
                    .as_ref()
                    .and_then(|a| a.artefact.as_route().map(|plan| (plan, a.version)));
                let ledger = match current_ledger {
                    Some(ledger) => ledger.apply(&mutation, route)?,
                    None => match (&mutation, route) {
                        (LedgerMutation::Regenerate { .. }, Some((plan, version))) => {
                            ExecuteLedger::seed_from_route(plan, version)?
                        }
                        _ => {
                            return Err(GovernanceError::MarkerViolation(
                                "EXECUTE has no ledger yet; regenerate from ROUTE first".to_string(),
                            ));
                        }
                    },
                };
                Artefact::Ledger(ledger)
            }
            Resolved::Status(_) => match &current {
                Some(anchor) => anchor.artefact.clone(),
                None => return Err(GovernanceError::NotFound(format!("no anchor for {}", key))),
            },
        };

        let mut lifecycle = match (transition.reopen, reason) {
            (true, Some(reason)) => lifecycle.reopen(reason, &req.actor),
            _ => lifecycle,
        };
        let closes = req.marker == Marker::Complete && status.is_stable() && !transition.reopen;
        if closes {
            lifecycle.closed = true;
        }

        let opts = self.format_options();
        let document = artefact.render(&opts)?;
        let mut anchor = next_anchor(current.as_ref(), req, artefact, document, status, lifecycle.cycle);
        anchor.closes_cycle = closes;

        let regenerated = match (&anchor.artefact, req.marker) {
            (Artefact::Route(plan), Marker::Route) => {
                self.regenerate_execute(req, plan, anchor.version, lifecycle.cycle, &opts)?
            }
            _ => None,
        };

        let mut batch = CommitBatch::new(&req.actor, conference_id).write(anchor.clone(), current_version);
        if let Some((exe, expected)) = &regenerated {
            batch = batch.write(exe.clone(), *expected);
        }
        batch.lifecycle = Some(lifecycle);
        self.store.commit(batch)?;

        Ok(Committed {
            conference_id: conference_id.to_string(),
            contract: verdict.contract,
            changed: verdict.changeable,
            document: anchor.document.clone(),
            anchor,
            warnings,
            regenerated: regenerated.map(|(exe, _)| exe),
        })
    }

    fn apply_fields(
        &self,
        req: &MutationRequest,
        current: Option<&Anchor>,
        fields: FieldMap,
        stages: Option<Vec<RouteStage>>,
        word_limit: usize,
    ) -> Result<(Artefact, Vec<SchemaWarning>), GovernanceError> {
        let kind = req.artefact_kind.knowledge_kind().ok_or_else(|| {
            GovernanceError::contract(
                ContractRule::BodyMatchesMarker,
                format!("{} has no section schema", req.artefact_kind),
            )
        })?;
        let (mut object, current_stages) = match current.map(|a| &a.artefact) {
            Some(Artefact::Knowledge(obj)) => (obj.clone(), None),
            Some(Artefact::Route(plan)) => (plan.workflow.clone(), Some(plan.stages.clone())),
            _ => (KnowledgeObject::new(kind, req.project_id), None),
        };
        object.apply_fields(fields, word_limit)?;
        let warnings = object.validate(word_limit)?;

        let artefact = if req.marker == Marker::Route {
            let stages = stages.or(current_stages).unwrap_or_default();
            Artefact::Route(RoutePlan::new(object, stages)?)
        } else {
            Artefact::Knowledge(object)
        };
        Ok((artefact, warnings))
    }

    /// When ROUTE changes under an existing ledger, derive the next ledger
    /// generation for the same batch.
    fn regenerate_execute(
        &self,
        req: &MutationRequest,
        plan: &RoutePlan,
        route_version: u64,
        cycle: u32,
        opts: &FormatOptions,
    ) -> Result<Option<(Anchor, u64)>, GovernanceError> {
        let Some(exe) = self.store.load(AnchorKey::new(req.project_id, Marker::Execute))? else {
            return Ok(None);
        };
        let Some(ledger) = exe.artefact.as_ledger() else {
            return Ok(None);
        };
        if ledger.source_route.route_hash == plan.plan_hash()? {
            return Ok(None);
        }
        let reason = req
            .deviation
            .as_ref()
            .map(|d| d.reason.trim().to_string())
            .unwrap_or_default();
        let next = Artefact::Ledger(ledger.regenerate(plan, route_version)?);
        let document = next.render(opts)?;

        let mut anchor = exe.clone();
        anchor.version = exe.version + 1;
        anchor.revision = exe.revision + 1;
        anchor.deviations.push(Deviation::new(
            anchor.revision,
            &format!("regenerated from ROUTE version {}: {}", route_version, reason),
            &req.actor,
        ));
        anchor.artefact = next;
        anchor.document = document;
        anchor.cycle = cycle;
        anchor.updated_at = time::now_epoch_z();
        anchor.updated_by = req.actor.clone();
        Ok(Some((anchor, exe.version)))
    }
}

/// A chat joins the latest cycle any of the project's anchors was
/// committed in, and sees that cycle closed once a COMPLETE version
/// closed it, whichever chat did so.
fn align_lifecycle(mut lifecycle: Lifecycle, current: Option<&Anchor>, complete: Option<&Anchor>) -> Lifecycle {
    let latest = current.into_iter().chain(complete).map(|a| a.cycle).max().unwrap_or(0);
    if latest > lifecycle.cycle {
        lifecycle.cycle = latest;
        lifecycle.closed = false;
    }
    if let Some(complete) = complete
        && complete.closes_cycle
        && complete.cycle == lifecycle.cycle
    {
        lifecycle.closed = true;
    }
    lifecycle
}

fn next_anchor(
    current: Option<&Anchor>,
    req: &MutationRequest,
    artefact: Artefact,
    document: String,
    status: AnchorStatus,
    cycle: u32,
) -> Anchor {
    let (version, mut revision, mut deviations) = match current {
        Some(a) => (a.version + 1, a.revision, a.deviations.clone()),
        None => (1, 0, Vec::new()),
    };
    if let Some(deviation) = &req.deviation {
        revision += 1;
        deviations.push(Deviation::new(revision, &deviation.reason, &req.actor));
    }
    Anchor {
        project_id: req.project_id,
        marker: req.marker,
        identifier: artefact.identifier(),
        version,
        revision,
        cycle,
        status,
        artefact,
        document,
        deviations,
        closes_cycle: false,
        updated_at: time::now_epoch_z(),
        updated_by: req.actor.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::knowledge::SectionValue;
    use crate::core::registry::MemoryAnchorStore;

    fn engine() -> Engine<MemoryAnchorStore> {
        Engine::new(MemoryAnchorStore::new(), GovernanceConfig::default())
    }

    fn cko_fields(summary: &str) -> MutationBody {
        let mut fields = FieldMap::new();
        fields.insert("canonical_summary".into(), Some(SectionValue::text(summary)));
        MutationBody::Fields { fields, stages: None }
    }

    #[test]
    fn first_intent_commit_is_version_one() {
        let mut engine = engine();
        let req = MutationRequest::new(7, "c1", Marker::Intent, ArtefactKind::Cko, cko_fields("Reduce onboarding time"));
        let committed = engine.submit(req).unwrap();
        assert_eq!(committed.anchor.version, 1);
        assert_eq!(committed.anchor.status, AnchorStatus::Draft);
        assert_eq!(committed.contract, Contract::General);
        assert!(committed.document.starts_with("# CKO-PROJECT-000007\n\nReduce onboarding time\n\n"));
    }

    #[test]
    fn rejection_returns_prior() {
        let mut engine = engine();
        engine
            .submit(MutationRequest::new(7, "c1", Marker::Intent, ArtefactKind::Cko, cko_fields("One")))
            .unwrap();
        let rejected = engine
            .submit(MutationRequest::new(7, "c1", Marker::Intent, ArtefactKind::Cko, cko_fields("Two")))
            .unwrap_err();
        assert!(matches!(rejected.error, GovernanceError::ConcurrencyConflict { expected: 0, actual: 1 }));
        assert_eq!(rejected.prior.unwrap().version, 1);
    }

    #[test]
    fn status_on_missing_anchor_is_not_found() {
        let mut engine = engine();
        let req = MutationRequest::new(
            7,
            "c1",
            Marker::Intent,
            ArtefactKind::Cko,
            MutationBody::Status {
                status: AnchorStatus::Proposed,
            },
        );
        let rejected = engine.submit(req).unwrap_err();
        assert_eq!(rejected.error.code(), "NOT_FOUND");
        assert!(rejected.prior.is_none());
    }

    #[test]
    fn strict_encoding_rejects_before_commit() {
        let config = GovernanceConfig {
            encoding: formatter::EncodingStrictness::Strict,
            ..GovernanceConfig::default()
        };
        let mut engine = Engine::new(MemoryAnchorStore::new(), config);
        let req = MutationRequest::new(7, "c1", Marker::Intent, ArtefactKind::Cko, cko_fields("caf\u{e9}"));
        let rejected = engine.submit(req).unwrap_err();
        assert_eq!(rejected.error.code(), "ENCODING_VIOLATION");
        assert!(engine.store().load(AnchorKey::new(7, Marker::Intent)).unwrap().is_none());
    }

    #[test]
    fn brief_carries_current_document() {
        let text = conference_brief(Contract::General, Marker::Intent, None);
        assert!(text.contains("# CURRENT ANCHOR\n\n(none)\n"));
        assert!(text.ends_with('\n'));
    }
}
