use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Ms;

const CHANNEL_CAPACITY: usize = 256;

/// Payloads handed to the notification hook after a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LessonEvent {
    LessonCanceled {
        lesson_id: Ulid,
        tutor_user_id: String,
        affected_tutee_ids: Vec<String>,
        subject_name: String,
        appointed_at: Ms,
    },
    TuteeWithdrew {
        lesson_id: Ulid,
        tutor_id: Ulid,
        tutor_user_id: String,
        tutee_user_id: String,
        subject_name: String,
        appointed_at: Ms,
    },
}

impl LessonEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LessonEvent::LessonCanceled { .. } => "lesson_canceled",
            LessonEvent::TuteeWithdrew { .. } => "tutee_withdrew",
        }
    }

    /// Users who should hear about this event.
    pub fn recipients(&self) -> Vec<&str> {
        match self {
            LessonEvent::LessonCanceled {
                affected_tutee_ids, ..
            } => affected_tutee_ids.iter().map(String::as_str).collect(),
            LessonEvent::TuteeWithdrew { tutor_user_id, .. } => vec![tutor_user_id.as_str()],
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Downstream notification seam. Called once per event, only after the
/// transaction that produced it has committed. Must not block.
pub trait EventHook: Send + Sync {
    fn emit(&self, event: &LessonEvent);
}

/// Hook that drops everything.
pub struct Discard;

impl EventHook for Discard {
    fn emit(&self, _event: &LessonEvent) {}
}

/// Broadcast hub: per-user channels plus one channel carrying every event.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<LessonEvent>>,
    all: broadcast::Sender<LessonEvent>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to events addressed to one user. Creates the channel if needed.
    pub fn subscribe(&self, user_id: &str) -> broadcast::Receiver<LessonEvent> {
        let sender = self
            .channels
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<LessonEvent> {
        self.all.subscribe()
    }

    /// Drop a user's channel, e.g. when their session ends.
    pub fn remove(&self, user_id: &str) {
        self.channels.remove(user_id);
    }
}

impl EventHook for NotifyHub {
    /// No-op for users nobody is listening for.
    fn emit(&self, event: &LessonEvent) {
        let _ = self.all.send(event.clone());
        for user in event.recipients() {
            if let Some(sender) = self.channels.get(user) {
                let _ = sender.send(event.clone());
            }
        }
    }
}
