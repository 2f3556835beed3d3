//! Marker State Machine.
//!
//! INTENT -> ROUTE -> EXECUTE -> COMPLETE, per project and chat. The guard
//! here is pure: it looks at a snapshot of anchor statuses and the
//! lifecycle record and decides whether a request may proceed, and whether
//! it needs a deviation to do so.

use crate::core::artefact::ArtefactKind;
use crate::core::error::GovernanceError;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Marker {
    Intent,
    Route,
    Execute,
    Complete,
}

impl Marker {
    pub const ALL: [Marker; 4] = [Marker::Intent, Marker::Route, Marker::Execute, Marker::Complete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Marker::Intent => "INTENT",
            Marker::Route => "ROUTE",
            Marker::Execute => "EXECUTE",
            Marker::Complete => "COMPLETE",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn next(&self) -> Option<Marker> {
        Marker::ALL.get(self.index() + 1).copied()
    }

    pub fn previous(&self) -> Option<Marker> {
        self.index().checked_sub(1).map(|i| Marker::ALL[i])
    }

    /// Artefact kinds that may anchor this marker.
    pub fn anchor_kinds(&self) -> &'static [ArtefactKind] {
        match self {
            Marker::Intent => &[ArtefactKind::Cko],
            Marker::Route => &[ArtefactKind::Wko],
            Marker::Execute => &[ArtefactKind::ExecutionState],
            Marker::Complete => &[ArtefactKind::Pko, ArtefactKind::Tko],
        }
    }

    pub fn accepts(&self, kind: ArtefactKind) -> bool {
        self.anchor_kinds().contains(&kind)
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Marker {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INTENT" => Ok(Marker::Intent),
            "ROUTE" => Ok(Marker::Route),
            "EXECUTE" => Ok(Marker::Execute),
            "COMPLETE" => Ok(Marker::Complete),
            other => Err(GovernanceError::ValidationError(format!(
                "unknown marker '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum AnchorStatus {
    #[default]
    Draft,
    Proposed,
    Locked,
}

impl AnchorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorStatus::Draft => "DRAFT",
            AnchorStatus::Proposed => "PROPOSED",
            AnchorStatus::Locked => "LOCKED",
        }
    }

    /// Stable anchors may gate the next marker.
    pub fn is_stable(&self) -> bool {
        !matches!(self, AnchorStatus::Draft)
    }
}

impl fmt::Display for AnchorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnchorStatus {
    type Err = GovernanceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DRAFT" => Ok(AnchorStatus::Draft),
            "PROPOSED" => Ok(AnchorStatus::Proposed),
            "LOCKED" | "PASS_LOCKED" => Ok(AnchorStatus::Locked),
            other => Err(GovernanceError::ValidationError(format!(
                "unknown anchor status '{}'",
                other
            ))),
        }
    }
}

/// A recorded, versioned departure from linear progression.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Deviation {
    pub revision: u64,
    pub reason: String,
    pub actor: String,
    pub recorded_at: String,
}

impl Deviation {
    pub fn new(revision: u64, reason: &str, actor: &str) -> Self {
        Self {
            revision,
            reason: reason.trim().to_string(),
            actor: actor.to_string(),
            recorded_at: time::now_epoch_z(),
        }
    }
}

/// Review Conference sequence for one project and chat.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lifecycle {
    pub project_id: u64,
    pub chat_id: String,
    pub cycle: u32,
    /// Set once COMPLETE is anchored with a stable status.
    pub closed: bool,
    /// Reopen deviations, one per cycle after the first.
    #[serde(default)]
    pub deviations: Vec<Deviation>,
}

impl Lifecycle {
    pub fn new(project_id: u64, chat_id: &str) -> Self {
        Self {
            project_id,
            chat_id: chat_id.to_string(),
            cycle: 1,
            closed: false,
            deviations: Vec::new(),
        }
    }

    /// Start the next cycle. The closed one is not touched beyond the
    /// counter and the recorded deviation.
    pub fn reopen(&self, reason: &str, actor: &str) -> Lifecycle {
        let mut next = self.clone();
        next.cycle += 1;
        next.closed = false;
        next.deviations
            .push(Deviation::new(next.cycle as u64, reason, actor));
        next
    }
}

/// Status of each marker's anchor for one project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkerSnapshot {
    statuses: [Option<AnchorStatus>; 4],
}

impl MarkerSnapshot {
    pub fn with(mut self, marker: Marker, status: AnchorStatus) -> Self {
        self.statuses[marker.index()] = Some(status);
        self
    }

    pub fn status(&self, marker: Marker) -> Option<AnchorStatus> {
        self.statuses[marker.index()]
    }

    /// Furthest marker holding an anchor.
    pub fn latest(&self) -> Option<Marker> {
        Marker::ALL
            .iter()
            .rev()
            .find(|m| self.statuses[m.index()].is_some())
            .copied()
    }

    pub fn has_later_anchor(&self, marker: Marker) -> bool {
        Marker::ALL[marker.index() + 1..]
            .iter()
            .any(|m| self.statuses[m.index()].is_some())
    }
}

/// What the guard decided about a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// First anchor at this marker.
    pub opening: bool,
    /// The request goes backward and is only allowed as a deviation.
    pub backward: bool,
    /// The lifecycle was closed; the request starts a new cycle.
    pub reopen: bool,
}

/// Decide whether a request touching `marker` and leaving it at
/// `status` may proceed. `deviation` is the provenance note, if any.
pub fn check_transition(
    snapshot: &MarkerSnapshot,
    lifecycle: &Lifecycle,
    marker: Marker,
    status: AnchorStatus,
    deviation: Option<&str>,
) -> Result<Transition, GovernanceError> {
    let deviation = match deviation.map(str::trim) {
        Some("") => {
            return Err(GovernanceError::DeviationRequired(
                "a deviation needs a provenance note explaining why".to_string(),
            ));
        }
        other => other,
    };

    let reopen = lifecycle.closed;
    if reopen && deviation.is_none() {
        return Err(GovernanceError::DeviationRequired(format!(
            "cycle {} closed at COMPLETE; reopening needs a deviation",
            lifecycle.cycle
        )));
    }

    let current = snapshot.status(marker);
    let opening = current.is_none();
    if opening
        && let Some(prev) = marker.previous()
    {
        match snapshot.status(prev) {
            Some(s) if s.is_stable() => {}
            Some(s) => {
                return Err(GovernanceError::MarkerViolation(format!(
                    "cannot open {}: {} anchor is {}",
                    marker, prev, s
                )));
            }
            None => {
                return Err(GovernanceError::MarkerViolation(format!(
                    "cannot open {}: no {} anchor",
                    marker, prev
                )));
            }
        }
    }

    let later = snapshot.has_later_anchor(marker);
    let regressed = current.is_some_and(|c| status < c);
    let backward = later || regressed;
    if backward && deviation.is_none() {
        let why = if later {
            format!("{} is revised while a later marker is anchored", marker)
        } else {
            format!(
                "{} status would move back from {} to {}",
                marker,
                current.unwrap_or_default(),
                status
            )
        };
        return Err(GovernanceError::DeviationRequired(why));
    }

    Ok(Transition {
        opening,
        backward,
        reopen,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Lifecycle {
        Lifecycle::new(7, "chat-1")
    }

    #[test]
    fn order_is_linear() {
        assert_eq!(Marker::Intent.next(), Some(Marker::Route));
        assert_eq!(Marker::Complete.next(), None);
        assert_eq!(Marker::Intent.previous(), None);
        assert_eq!(Marker::Execute.previous(), Some(Marker::Route));
    }

    #[test]
    fn anchor_kinds_per_marker() {
        assert!(Marker::Intent.accepts(ArtefactKind::Cko));
        assert!(!Marker::Intent.accepts(ArtefactKind::Wko));
        assert!(Marker::Complete.accepts(ArtefactKind::Tko));
        assert!(Marker::Complete.accepts(ArtefactKind::Pko));
        assert!(Marker::Execute.accepts(ArtefactKind::ExecutionState));
    }

    #[test]
    fn parse_accepts_legacy_locked_name() {
        assert_eq!("pass_locked".parse::<AnchorStatus>().unwrap(), AnchorStatus::Locked);
        assert!("ROUTE".parse::<Marker>().is_ok());
        assert!("LATER".parse::<Marker>().is_err());
    }

    #[test]
    fn intent_is_the_first_permitted_marker() {
        let snap = MarkerSnapshot::default();
        let t = check_transition(&snap, &fresh(), Marker::Intent, AnchorStatus::Draft, None).unwrap();
        assert!(t.opening);
        let err = check_transition(&snap, &fresh(), Marker::Route, AnchorStatus::Draft, None).unwrap_err();
        assert!(matches!(err, GovernanceError::MarkerViolation(_)));
    }

    #[test]
    fn draft_anchor_blocks_next_marker() {
        let snap = MarkerSnapshot::default().with(Marker::Intent, AnchorStatus::Draft);
        let err = check_transition(&snap, &fresh(), Marker::Route, AnchorStatus::Draft, None).unwrap_err();
        assert!(err.to_string().contains("DRAFT"));

        let snap = snap.with(Marker::Intent, AnchorStatus::Proposed);
        assert!(check_transition(&snap, &fresh(), Marker::Route, AnchorStatus::Draft, None).is_ok());
    }

    #[test]
    fn revising_earlier_marker_needs_deviation() {
        let snap = MarkerSnapshot::default()
            .with(Marker::Intent, AnchorStatus::Locked)
            .with(Marker::Route, AnchorStatus::Locked)
            .with(Marker::Execute, AnchorStatus::Draft);
        let err = check_transition(&snap, &fresh(), Marker::Route, AnchorStatus::Locked, None).unwrap_err();
        assert!(matches!(err, GovernanceError::DeviationRequired(_)));

        let t = check_transition(&snap, &fresh(), Marker::Route, AnchorStatus::Locked, Some("scope grew"))
            .unwrap();
        assert!(t.backward);
    }

    #[test]
    fn status_regression_needs_deviation() {
        let snap = MarkerSnapshot::default().with(Marker::Intent, AnchorStatus::Locked);
        assert!(check_transition(&snap, &fresh(), Marker::Intent, AnchorStatus::Draft, None).is_err());
        assert!(check_transition(&snap, &fresh(), Marker::Intent, AnchorStatus::Locked, None).is_ok());
    }

    #[test]
    fn blank_deviation_note_is_refused() {
        let snap = MarkerSnapshot::default();
        let err = check_transition(&snap, &fresh(), Marker::Intent, AnchorStatus::Draft, Some("  ")).unwrap_err();
        assert_eq!(err.code(), "DEVIATION_REQUIRED");
    }

    #[test]
    fn closed_lifecycle_reopens_only_by_deviation() {
        let snap = MarkerSnapshot::default()
            .with(Marker::Intent, AnchorStatus::Locked)
            .with(Marker::Route, AnchorStatus::Locked)
            .with(Marker::Execute, AnchorStatus::Locked)
            .with(Marker::Complete, AnchorStatus::Locked);
        let mut closed = fresh();
        closed.closed = true;

        assert!(check_transition(&snap, &closed, Marker::Complete, AnchorStatus::Locked, None).is_err());
        let t = check_transition(&snap, &closed, Marker::Complete, AnchorStatus::Locked, Some("follow-up"))
            .unwrap();
        assert!(t.reopen);

        let next = closed.reopen("follow-up", "alice");
        assert_eq!(next.cycle, 2);
        assert!(!next.closed);
        assert!(closed.closed);
        assert_eq!(next.deviations[0].revision, 2);
    }
}
