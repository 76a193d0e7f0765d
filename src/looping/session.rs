//! Loop session records and persistence.

use crate::state::{StateManager, TerminationReason};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LoopSessionStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Aborted,
    LimitReached,
}

impl From<TerminationReason> for LoopSessionStatus {
    fn from(reason: TerminationReason) -> Self {
        match reason {
            TerminationReason::Natural => Self::Completed,
            TerminationReason::Failure => Self::Failed,
            TerminationReason::Aborted => Self::Aborted,
            TerminationReason::LimitReached => Self::LimitReached,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IterationStatus {
    InProgress,
    Completed,
    Failed,
    Aborted,
}

/// One pipeline run within a loop session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopIteration {
    pub iteration_number: u32,
    pub pipeline_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub status: IterationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Whether this iteration queued a follow-up pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_next: Option<bool>,
}

/// Persisted record of one loop invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopSession {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub status: LoopSessionStatus,
    pub max_iterations: u32,
    pub total_iterations: u32,
    pub iterations: Vec<LoopIteration>,
}

impl LoopSession {
    pub fn new(session_id: String, max_iterations: u32) -> Self {
        Self {
            session_id,
            start_time: Utc::now(),
            end_time: None,
            status: LoopSessionStatus::Running,
            max_iterations,
            total_iterations: 0,
            iterations: Vec::new(),
        }
    }
}

/// Owns the session record for one loop invocation, persisting after every
/// mutation. Persistence failures are logged and tolerated.
pub struct LoopStateManager {
    store: StateManager,
    session: LoopSession,
}

impl LoopStateManager {
    pub fn new(store: StateManager, session_id: String, max_iterations: u32) -> Self {
        let manager = Self {
            store,
            session: LoopSession::new(session_id, max_iterations),
        };
        manager.persist();
        manager
    }

    pub fn session(&self) -> &LoopSession {
        &self.session
    }

    pub fn begin_iteration(&mut self, iteration_number: u32, pipeline_name: &str) {
        self.session.iterations.push(LoopIteration {
            iteration_number,
            pipeline_name: pipeline_name.to_string(),
            run_id: None,
            status: IterationStatus::InProgress,
            duration_ms: None,
            triggered_next: None,
        });
        self.session.total_iterations = iteration_number;
        self.persist();
    }

    pub fn finish_iteration(
        &mut self,
        run_id: Option<String>,
        status: IterationStatus,
        duration_ms: Option<u64>,
        triggered_next: bool,
    ) {
        if let Some(iteration) = self.session.iterations.last_mut() {
            iteration.run_id = run_id;
            iteration.status = status;
            iteration.duration_ms = duration_ms;
            iteration.triggered_next = Some(triggered_next);
        }
        self.persist();
    }

    pub fn terminate(&mut self, reason: TerminationReason) -> Result<()> {
        self.session.status = reason.into();
        self.session.end_time = Some(Utc::now());
        self.store.save_loop_session(&self.session)
    }

    fn persist(&self) {
        if let Err(e) = self.store.save_loop_session(&self.session) {
            warn!(session = %self.session.session_id, "could not persist loop session: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn termination_reason_maps_to_status() {
        assert_eq!(
            LoopSessionStatus::from(TerminationReason::Natural),
            LoopSessionStatus::Completed
        );
        assert_eq!(
            LoopSessionStatus::from(TerminationReason::Failure),
            LoopSessionStatus::Failed
        );
        assert_eq!(
            LoopSessionStatus::from(TerminationReason::Aborted),
            LoopSessionStatus::Aborted
        );
        assert_eq!(
            LoopSessionStatus::from(TerminationReason::LimitReached),
            LoopSessionStatus::LimitReached
        );
    }

    #[test]
    fn iteration_lifecycle_is_persisted() {
        let dir = tempdir().unwrap();
        let store = StateManager::new(dir.path());
        let mut manager = LoopStateManager::new(store, "sess-1".to_string(), 10);

        manager.begin_iteration(1, "seed");
        manager.finish_iteration(
            Some("run-1".to_string()),
            IterationStatus::Completed,
            Some(1500),
            false,
        );
        manager.terminate(TerminationReason::Natural).unwrap();

        let loaded = StateManager::new(dir.path())
            .load_loop_session("sess-1")
            .unwrap();
        assert_eq!(loaded.status, LoopSessionStatus::Completed);
        assert_eq!(loaded.total_iterations, 1);
        assert_eq!(loaded.iterations.len(), 1);
        let iteration = &loaded.iterations[0];
        assert_eq!(iteration.status, IterationStatus::Completed);
        assert_eq!(iteration.run_id.as_deref(), Some("run-1"));
        assert_eq!(iteration.triggered_next, Some(false));
        assert!(loaded.end_time.is_some());
    }

    #[test]
    fn session_round_trips_through_json() {
        let session = LoopSession::new("s".to_string(), 5);
        let json = serde_json::to_string(&session).unwrap();
        assert!(json.contains("\"sessionId\""));
        assert!(json.contains("\"running\""));
        let parsed: LoopSession = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, session);
    }
}
