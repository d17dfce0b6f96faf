//! Availability state machine of a pipeline definition.
//!
//! One [`PipelineDefinitionStatus`] exists per definition, not per request.
//! The definition manager drives it with [`DefinitionEvent`]s on load,
//! reload and retire; the request path only reads it.
//!
//! ```text
//!            ValidationPassed                UsedModelChanged
//!   BEGIN ────────────────────▶ AVAILABLE ─────────────────▶ AVAILABLE_RR
//!     │                            │  ▲                          │
//!     │ ValidationFailed    Reload │  └──── ValidationPassed ────┤
//!     ▼                            ▼                             │
//!    LPF ◀──── ValidationFailed ─ RELOADING ◀────── Reload ──────┘
//!     │
//!     └── UsedModelChanged ──▶ LPF_RR       (any loaded state ── Retire ──▶ RETIRED)
//! ```
//!
//! Illegal transitions are management-layer bugs: [`PipelineDefinitionStatus::handle`]
//! panics on them and leaves the state unchanged.

use chrono::{DateTime, Local};
use std::fmt;
use thiserror::Error;

/// State of a pipeline definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefinitionState {
    Begin,
    Reloading,
    LoadingPreconditionFailed,
    LoadingPreconditionFailedRequiredRevalidation,
    AvailableRequiredRevalidation,
    Available,
    Retired,
}

impl DefinitionState {
    pub const ALL: [DefinitionState; 7] = [
        DefinitionState::Begin,
        DefinitionState::Reloading,
        DefinitionState::LoadingPreconditionFailed,
        DefinitionState::LoadingPreconditionFailedRequiredRevalidation,
        DefinitionState::AvailableRequiredRevalidation,
        DefinitionState::Available,
        DefinitionState::Retired,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DefinitionState::Begin => "BEGIN",
            DefinitionState::Reloading => "RELOADING",
            DefinitionState::LoadingPreconditionFailed => "LOADING_PRECONDITION_FAILED",
            DefinitionState::LoadingPreconditionFailedRequiredRevalidation => {
                "LOADING_PRECONDITION_FAILED_REQUIRED_REVALIDATION"
            }
            DefinitionState::AvailableRequiredRevalidation => "AVAILABLE_REQUIRED_REVALIDATION",
            DefinitionState::Available => "AVAILABLE",
            DefinitionState::Retired => "RETIRED",
        }
    }
}

impl fmt::Display for DefinitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event applied to a definition's status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefinitionEvent {
    Reload,
    ValidationPassed,
    ValidationFailed,
    UsedModelChanged,
    Retire,
}

impl DefinitionEvent {
    pub const ALL: [DefinitionEvent; 5] = [
        DefinitionEvent::Reload,
        DefinitionEvent::ValidationPassed,
        DefinitionEvent::ValidationFailed,
        DefinitionEvent::UsedModelChanged,
        DefinitionEvent::Retire,
    ];
}

/// Model-level lifecycle state reported for a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVersionState {
    Loading,
    Available,
    End,
}

/// Error code paired with [`ModelVersionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVersionStatusErrorCode {
    Ok,
    FailedPrecondition,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid transition: {event:?} in state {state}")]
pub struct InvalidTransition {
    pub state: DefinitionState,
    pub event: DefinitionEvent,
}

/// Current state of one definition, with the time of its last change.
#[derive(Debug, Clone)]
pub struct PipelineDefinitionStatus {
    name: String,
    state: DefinitionState,
    changed_at: DateTime<Local>,
}

impl PipelineDefinitionStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: DefinitionState::Begin,
            changed_at: Local::now(),
        }
    }

    pub fn state(&self) -> DefinitionState {
        self.state
    }

    pub fn changed_at(&self) -> DateTime<Local> {
        self.changed_at
    }

    /// Target state of `event` from `state`, or `None` if illegal.
    pub fn next_state(state: DefinitionState, event: DefinitionEvent) -> Option<DefinitionState> {
        use DefinitionEvent as E;
        use DefinitionState as S;
        match (state, event) {
            (S::Begin | S::Reloading, E::ValidationPassed) => Some(S::Available),
            (S::Begin | S::Reloading, E::ValidationFailed) => Some(S::LoadingPreconditionFailed),
            (S::Begin | S::Reloading, _) => None,

            (S::Available, E::Reload) => Some(S::Reloading),
            (S::Available, E::UsedModelChanged) => Some(S::AvailableRequiredRevalidation),
            (S::Available, E::Retire) => Some(S::Retired),
            (S::Available, _) => None,

            (
                S::AvailableRequiredRevalidation | S::LoadingPreconditionFailedRequiredRevalidation,
                E::Reload,
            ) => Some(S::Reloading),
            (
                S::AvailableRequiredRevalidation | S::LoadingPreconditionFailedRequiredRevalidation,
                E::ValidationPassed,
            ) => Some(S::Available),
            (
                S::AvailableRequiredRevalidation | S::LoadingPreconditionFailedRequiredRevalidation,
                E::ValidationFailed,
            ) => Some(S::LoadingPreconditionFailed),
            (
                s @ (S::AvailableRequiredRevalidation
                | S::LoadingPreconditionFailedRequiredRevalidation),
                E::UsedModelChanged,
            ) => Some(s),
            (
                S::AvailableRequiredRevalidation | S::LoadingPreconditionFailedRequiredRevalidation,
                E::Retire,
            ) => Some(S::Retired),

            (S::LoadingPreconditionFailed, E::Reload) => Some(S::Reloading),
            (S::LoadingPreconditionFailed, E::UsedModelChanged) => {
                Some(S::LoadingPreconditionFailedRequiredRevalidation)
            }
            (S::LoadingPreconditionFailed, E::Retire) => Some(S::Retired),
            (S::LoadingPreconditionFailed, _) => None,

            (S::Retired, E::Reload) => Some(S::Reloading),
            (S::Retired, _) => None,
        }
    }

    /// Apply `event`, returning the new state, or an error leaving the
    /// state unchanged.
    pub fn try_handle(&mut self, event: DefinitionEvent) -> Result<DefinitionState, InvalidTransition> {
        let previous = self.state;
        let next = Self::next_state(previous, event).ok_or(InvalidTransition {
            state: previous,
            event,
        })?;
        self.state = next;
        if next != previous {
            self.changed_at = Local::now();
        }
        tracing::info!(
            "Pipeline definition {} state changed from {} to {} after {:?}",
            self.name,
            previous,
            next,
            event
        );
        Ok(next)
    }

    /// Apply `event`.
    ///
    /// # Panics
    ///
    /// Panics on an illegal transition. The state is left unchanged.
    pub fn handle(&mut self, event: DefinitionEvent) -> DefinitionState {
        match self.try_handle(event) {
            Ok(state) => state,
            Err(e) => panic!("pipeline definition {}: {}", self.name, e),
        }
    }

    /// Traffic may be admitted.
    pub fn is_available(&self) -> bool {
        matches!(
            self.state,
            DefinitionState::Available | DefinitionState::AvailableRequiredRevalidation
        )
    }

    /// The definition is still expected to become available.
    pub fn can_end_loaded(&self) -> bool {
        self.is_available()
            || matches!(
                self.state,
                DefinitionState::LoadingPreconditionFailedRequiredRevalidation
                    | DefinitionState::Begin
                    | DefinitionState::Reloading
            )
    }

    pub fn is_revalidation_required(&self) -> bool {
        matches!(
            self.state,
            DefinitionState::LoadingPreconditionFailedRequiredRevalidation
                | DefinitionState::AvailableRequiredRevalidation
        )
    }

    pub fn convert_to_model_status(&self) -> (ModelVersionState, ModelVersionStatusErrorCode) {
        match self.state {
            DefinitionState::Begin
            | DefinitionState::Reloading
            | DefinitionState::LoadingPreconditionFailedRequiredRevalidation => {
                (ModelVersionState::Loading, ModelVersionStatusErrorCode::Ok)
            }
            DefinitionState::LoadingPreconditionFailed => (
                ModelVersionState::Loading,
                ModelVersionStatusErrorCode::FailedPrecondition,
            ),
            DefinitionState::AvailableRequiredRevalidation | DefinitionState::Available => {
                (ModelVersionState::Available, ModelVersionStatusErrorCode::Ok)
            }
            DefinitionState::Retired => (ModelVersionState::End, ModelVersionStatusErrorCode::Ok),
        }
    }

    #[cfg(test)]
    fn with_state(state: DefinitionState) -> Self {
        Self {
            name: "test".to_string(),
            state,
            changed_at: Local::now(),
        }
    }
}
