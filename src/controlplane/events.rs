//! Event Recorders
//!
//! Cluster events are informational. Publishing is best effort: failures
//! are logged and never fail a reconcile pass.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use parking_lot::Mutex;
use tracing::warn;

use crate::domain::ports::{EventKind, EventRecorder};
use crate::error::Result;

/// Controller name used as the event reporter
pub const REPORTER: &str = "gpu-fleet-operator";

// =============================================================================
// Kubernetes Recorder
// =============================================================================

/// Publishes `events.k8s.io` events through the kube runtime recorder
pub struct KubeEventRecorder {
    client: Client,
    reporter: Reporter,
}

impl KubeEventRecorder {
    pub fn new(client: Client, instance: Option<String>) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: REPORTER.to_string(),
                instance,
            },
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(
        &self,
        reference: &ObjectReference,
        kind: EventKind,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), reference.clone());
        recorder
            .publish(Event {
                type_: match kind {
                    EventKind::Normal => EventType::Normal,
                    EventKind::Warning => EventType::Warning,
                },
                reason: reason.to_string(),
                note: Some(message.to_string()),
                action: "Reconcile".to_string(),
                secondary: None,
            })
            .await?;
        Ok(())
    }
}

// =============================================================================
// In-Memory Recorder
// =============================================================================

/// A published event, as kept by [`MemoryEventRecorder`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub object: String,
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
}

/// Keeps events in memory
#[derive(Default)]
pub struct MemoryEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }
}

#[async_trait]
impl EventRecorder for MemoryEventRecorder {
    async fn publish(
        &self,
        reference: &ObjectReference,
        kind: EventKind,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        self.events.lock().push(RecordedEvent {
            object: reference.name.clone().unwrap_or_default(),
            kind,
            reason: reason.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Publish an event, logging instead of failing
pub async fn emit(
    recorder: &dyn EventRecorder,
    reference: &ObjectReference,
    kind: EventKind,
    reason: &str,
    message: &str,
) {
    if let Err(e) = recorder.publish(reference, kind, reason, message).await {
        warn!(
            object = reference.name.as_deref().unwrap_or_default(),
            %reason,
            error = %e,
            "Failed to publish event"
        );
    }
}
