//! Reconq core types: resources, change classification, queue items and errors.

#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Platform-assigned resource identity (`metadata.uid`).
pub type Uid = String;

/// A watched object the queue can cache and diff.
///
/// Implementations expose business fields only: `spec` and `status` equality must ignore
/// bookkeeping such as `resourceVersion`.
pub trait Resource: Clone + Send + Sync + 'static {
    type Spec: PartialEq;
    type Status: PartialEq;

    fn uid(&self) -> &str;
    fn name(&self) -> &str;
    fn spec(&self) -> &Self::Spec;
    fn status(&self) -> &Self::Status;
    fn deletion_timestamp(&self) -> Option<DateTime<Utc>>;
}

/// Outcome of diffing an incoming snapshot against the cached one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ComparisonResult {
    New,
    Modified,
    StatusModified,
    NotModified,
}

/// Typed lifecycle event delivered to subscribers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    Created,
    Updated,
    StatusUpdated,
    NotModified,
    Finalizing,
    Deleted,
}

impl EventKind {
    /// Derive the event kind for a cache comparison. A pending deletion wins over any
    /// comparison result.
    pub fn classify(cmp: ComparisonResult, deleting: bool) -> Self {
        if deleting {
            return EventKind::Finalizing;
        }
        match cmp {
            ComparisonResult::New => EventKind::Created,
            ComparisonResult::Modified => EventKind::Updated,
            ComparisonResult::StatusModified => EventKind::StatusUpdated,
            ComparisonResult::NotModified => EventKind::NotModified,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::StatusUpdated => "status_updated",
            EventKind::NotModified => "not_modified",
            EventKind::Finalizing => "finalizing",
            EventKind::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw change type reported by a watch source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct WatchEvent<R> {
    pub kind: WatchEventType,
    pub resource: R,
}

impl<R> WatchEvent<R> {
    pub fn added(resource: R) -> Self { Self { kind: WatchEventType::Added, resource } }
    pub fn modified(resource: R) -> Self { Self { kind: WatchEventType::Modified, resource } }
    pub fn deleted(resource: R) -> Self { Self { kind: WatchEventType::Deleted, resource } }
}

/// Unit flowing through the bounded event channel.
#[derive(Debug, Clone)]
pub struct QueueItem<R> {
    pub kind: EventKind,
    pub resource: R,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    /// The event channel no longer accepts writes; the event was dropped.
    #[error("event channel is closed")]
    Closed,
    /// The queue was stopped while waiting for channel space.
    #[error("event queue is shutting down")]
    Cancelled,
    #[error("event queue is already running")]
    AlreadyStarted,
    #[error("event queue was disposed")]
    Disposed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub uid: Uid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

/// Dynamically typed resource: JSON `spec` and `status` plus the metadata the queue needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Object {
    #[serde(default)]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub status: serde_json::Value,
}

impl Object {
    pub fn new(uid: impl Into<Uid>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta { uid: uid.into(), name: name.into(), ..Default::default() },
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_spec(mut self, spec: serde_json::Value) -> Self {
        self.spec = spec;
        self
    }

    pub fn with_status(mut self, status: serde_json::Value) -> Self {
        self.status = status;
        self
    }

    pub fn with_resource_version(mut self, rv: impl Into<String>) -> Self {
        self.metadata.resource_version = Some(rv.into());
        self
    }

    pub fn with_deletion_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.metadata.deletion_timestamp = Some(ts);
        self
    }
}

impl Resource for Object {
    type Spec = serde_json::Value;
    type Status = serde_json::Value;

    fn uid(&self) -> &str { &self.metadata.uid }
    fn name(&self) -> &str { &self.metadata.name }
    fn spec(&self) -> &serde_json::Value { &self.spec }
    fn status(&self) -> &serde_json::Value { &self.status }
    fn deletion_timestamp(&self) -> Option<DateTime<Utc>> { self.metadata.deletion_timestamp }
}

pub mod prelude {
    pub use super::{
        ComparisonResult, EventKind, Object, ObjectMeta, QueueError, QueueItem, Resource, Uid,
        WatchEvent, WatchEventType,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletion_overrides_every_comparison() {
        for cmp in [
            ComparisonResult::New,
            ComparisonResult::Modified,
            ComparisonResult::StatusModified,
            ComparisonResult::NotModified,
        ] {
            assert_eq!(EventKind::classify(cmp, true), EventKind::Finalizing);
        }
    }

    #[test]
    fn classify_without_deletion() {
        assert_eq!(EventKind::classify(ComparisonResult::New, false), EventKind::Created);
        assert_eq!(EventKind::classify(ComparisonResult::Modified, false), EventKind::Updated);
        assert_eq!(EventKind::classify(ComparisonResult::StatusModified, false), EventKind::StatusUpdated);
        assert_eq!(EventKind::classify(ComparisonResult::NotModified, false), EventKind::NotModified);
    }

    #[test]
    fn object_reads_kube_shaped_json() {
        let raw = serde_json::json!({
            "kind": "TestEntity",
            "metadata": {
                "uid": "0b7c1f36-7d6e-4a43-9d1e-1f0d0f5a2b11",
                "name": "demo",
                "namespace": "default",
                "resourceVersion": "42",
                "deletionTimestamp": "2024-05-01T10:00:00Z"
            },
            "spec": { "spec": "hello" }
        });
        let obj: Object = serde_json::from_value(raw).unwrap();
        assert_eq!(obj.uid(), "0b7c1f36-7d6e-4a43-9d1e-1f0d0f5a2b11");
        assert_eq!(obj.metadata.resource_version.as_deref(), Some("42"));
        assert!(obj.deletion_timestamp().is_some());
        assert_eq!(obj.status, serde_json::Value::Null);
    }
}
