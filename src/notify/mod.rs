//! Notification events and dispatch.
//!
//! The engine emits lifecycle events; channel implementations (desktop,
//! Slack webhooks) live outside the core and plug in via the `Notifier`
//! trait. Dispatch failures are logged and never propagate — a broken
//! notification channel must not break a run.

use crate::state::{PipelineStatus, StageStatus};
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

/// Lifecycle events a run emits.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationEvent {
    PipelineStarted {
        pipeline: String,
        run_id: String,
    },
    PipelineFinished {
        pipeline: String,
        run_id: String,
        status: PipelineStatus,
    },
    StageFinished {
        pipeline: String,
        stage: String,
        status: StageStatus,
    },
}

impl NotificationEvent {
    /// Event name in the `pipeline.started` / `stage.completed` style.
    pub fn name(&self) -> String {
        match self {
            Self::PipelineStarted { .. } => "pipeline.started".to_string(),
            Self::PipelineFinished { status, .. } => format!("pipeline.{}", status.as_str()),
            Self::StageFinished { status, .. } => match status {
                StageStatus::Success => "stage.completed".to_string(),
                other => format!("stage.{}", other.as_str()),
            },
        }
    }
}

/// A notification channel.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &NotificationEvent) -> Result<()>;
}

/// Channel that writes through the tracing subscriber.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &NotificationEvent) -> Result<()> {
        info!(event = %event.name(), "{event:?}");
        Ok(())
    }
}

/// Fan-out dispatcher over every configured channel.
#[derive(Clone, Default)]
pub struct Notifications {
    channels: Vec<Arc<dyn Notifier>>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, channel: Arc<dyn Notifier>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Deliver to every channel; failures are swallowed with a warning.
    pub fn dispatch(&self, event: &NotificationEvent) {
        for channel in &self.channels {
            if let Err(e) = channel.notify(event) {
                warn!(event = %event.name(), "notification channel failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::Mutex;

    struct Recording(Mutex<Vec<String>>);

    impl Notifier for Recording {
        fn notify(&self, event: &NotificationEvent) -> Result<()> {
            self.0.lock().unwrap().push(event.name());
            Ok(())
        }
    }

    struct Broken;

    impl Notifier for Broken {
        fn notify(&self, _event: &NotificationEvent) -> Result<()> {
            Err(anyhow!("webhook unreachable"))
        }
    }

    #[test]
    fn event_names() {
        assert_eq!(
            NotificationEvent::PipelineStarted {
                pipeline: "p".into(),
                run_id: "r".into()
            }
            .name(),
            "pipeline.started"
        );
        assert_eq!(
            NotificationEvent::PipelineFinished {
                pipeline: "p".into(),
                run_id: "r".into(),
                status: PipelineStatus::Aborted
            }
            .name(),
            "pipeline.aborted"
        );
        assert_eq!(
            NotificationEvent::StageFinished {
                pipeline: "p".into(),
                stage: "s".into(),
                status: StageStatus::Success
            }
            .name(),
            "stage.completed"
        );
        assert_eq!(
            NotificationEvent::StageFinished {
                pipeline: "p".into(),
                stage: "s".into(),
                status: StageStatus::Failed
            }
            .name(),
            "stage.failed"
        );
    }

    #[test]
    fn broken_channel_never_propagates() {
        let recorder = Arc::new(Recording(Mutex::new(Vec::new())));
        let notifications = Notifications::new()
            .with_channel(Arc::new(Broken))
            .with_channel(recorder.clone());

        notifications.dispatch(&NotificationEvent::PipelineStarted {
            pipeline: "p".into(),
            run_id: "r".into(),
        });

        // The healthy channel still received the event.
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }
}
