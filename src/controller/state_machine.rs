//! Phase lifecycle shared by every resource kind
//!
//! Each kind has its own closed phase enum, but all of them move through the
//! same three stages: an initial phase before the first successful pass, a
//! ready phase, and a failed phase. The transition table below is the only
//! place that decides which stage changes are legal.

use std::fmt;

use crate::controller::error::{Error, Result};
use crate::crd::{DatabasePhase, EnginePhase, PublicationPhase, UserRolePhase};

/// Stage of a resource's lifecycle, independent of its kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Never reconciled successfully
    Initial,
    /// Last pass succeeded
    Ready,
    /// Last pass failed
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Initial => write!(f, "Initial"),
            Stage::Ready => write!(f, "Ready"),
            Stage::Failed => write!(f, "Failed"),
        }
    }
}

/// Events that trigger stage transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// The kind's apply step completed
    ReconcileSucceeded,
    /// The kind's apply step returned an error
    ReconcileFailed,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::ReconcileSucceeded => write!(f, "ReconcileSucceeded"),
            LifecycleEvent::ReconcileFailed => write!(f, "ReconcileFailed"),
        }
    }
}

/// A kind-specific phase enum mapped onto the shared stages
pub trait LifecyclePhase: Copy + PartialEq + fmt::Display + Default + Send + Sync {
    fn stage(&self) -> Stage;
    /// The kind's terminal success value
    fn ready() -> Self;
    fn failed() -> Self;
}

impl LifecyclePhase for EnginePhase {
    fn stage(&self) -> Stage {
        match self {
            EnginePhase::Unvalidated => Stage::Initial,
            EnginePhase::Validated => Stage::Ready,
            EnginePhase::Failed => Stage::Failed,
        }
    }
    fn ready() -> Self {
        EnginePhase::Validated
    }
    fn failed() -> Self {
        EnginePhase::Failed
    }
}

impl LifecyclePhase for DatabasePhase {
    fn stage(&self) -> Stage {
        match self {
            DatabasePhase::Pending => Stage::Initial,
            DatabasePhase::Created => Stage::Ready,
            DatabasePhase::Failed => Stage::Failed,
        }
    }
    fn ready() -> Self {
        DatabasePhase::Created
    }
    fn failed() -> Self {
        DatabasePhase::Failed
    }
}

impl LifecyclePhase for UserRolePhase {
    fn stage(&self) -> Stage {
        match self {
            UserRolePhase::Pending => Stage::Initial,
            UserRolePhase::Created => Stage::Ready,
            UserRolePhase::Failed => Stage::Failed,
        }
    }
    fn ready() -> Self {
        UserRolePhase::Created
    }
    fn failed() -> Self {
        UserRolePhase::Failed
    }
}

impl LifecyclePhase for PublicationPhase {
    fn stage(&self) -> Stage {
        match self {
            PublicationPhase::Pending => Stage::Initial,
            PublicationPhase::Created => Stage::Ready,
            PublicationPhase::Failed => Stage::Failed,
        }
    }
    fn ready() -> Self {
        PublicationPhase::Created
    }
    fn failed() -> Self {
        PublicationPhase::Failed
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: Stage,
    pub to: Stage,
    pub event: LifecycleEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: Stage,
        to: Stage,
        event: LifecycleEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// The complete transition table
pub const TRANSITIONS: [Transition; 6] = [
    // === Initial ===
    Transition::new(
        Stage::Initial,
        Stage::Ready,
        LifecycleEvent::ReconcileSucceeded,
        "First successful reconcile",
    ),
    Transition::new(
        Stage::Initial,
        Stage::Failed,
        LifecycleEvent::ReconcileFailed,
        "First reconcile failed",
    ),
    // === Ready ===
    Transition::new(
        Stage::Ready,
        Stage::Ready,
        LifecycleEvent::ReconcileSucceeded,
        "Resource still in sync",
    ),
    Transition::new(
        Stage::Ready,
        Stage::Failed,
        LifecycleEvent::ReconcileFailed,
        "Resource drifted into an error",
    ),
    // === Failed ===
    Transition::new(
        Stage::Failed,
        Stage::Ready,
        LifecycleEvent::ReconcileSucceeded,
        "Recovered from error",
    ),
    Transition::new(
        Stage::Failed,
        Stage::Failed,
        LifecycleEvent::ReconcileFailed,
        "Still failing",
    ),
];

/// Look up the transition for `event` from `current`
pub fn find_transition(current: Stage, event: LifecycleEvent) -> Option<&'static Transition> {
    TRANSITIONS
        .iter()
        .find(|t| t.from == current && t.event == event)
}

/// Compute the next phase for `event`, rejecting transitions absent from the table
pub fn next_phase<P: LifecyclePhase>(current: P, event: LifecycleEvent) -> Result<P> {
    let target = match event {
        LifecycleEvent::ReconcileSucceeded => P::ready(),
        LifecycleEvent::ReconcileFailed => P::failed(),
    };

    match find_transition(current.stage(), event) {
        Some(t) if t.to == target.stage() => Ok(target),
        _ => Err(Error::IllegalTransition {
            from: current.to_string(),
            to: target.to_string(),
        }),
    }
}
