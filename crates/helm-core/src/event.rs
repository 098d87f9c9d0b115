use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::{Message, Part};
use crate::session::{FileDiff, Session};

/// Events published to the bus. Each carries the full updated entity (or the
/// delta) so subscribers can render without a read-back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "properties")]
pub enum Event {
    #[serde(rename = "session.created")]
    SessionCreated { info: Session },
    #[serde(rename = "session.updated")]
    SessionUpdated { info: Session },
    #[serde(rename = "session.deleted")]
    SessionDeleted { info: Session },
    #[serde(rename = "session.diff")]
    SessionDiff {
        #[serde(rename = "sessionID")]
        session_id: String,
        diff: Vec<FileDiff>,
    },
    #[serde(rename = "session.error")]
    SessionError {
        #[serde(rename = "sessionID", skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        error: ProviderError,
    },
    #[serde(rename = "message.updated")]
    MessageUpdated { info: Message },
    #[serde(rename = "message.removed")]
    MessageRemoved {
        #[serde(rename = "sessionID")]
        session_id: String,
        #[serde(rename = "messageID")]
        message_id: String,
    },
    #[serde(rename = "message.part.updated")]
    PartUpdated {
        part: Part,
        /// Streaming appendix for text/reasoning parts so subscribers can
        /// append instead of re-rendering the whole part.
        #[serde(skip_serializing_if = "Option::is_none")]
        delta: Option<String>,
    },
    #[serde(rename = "message.part.removed")]
    PartRemoved {
        #[serde(rename = "sessionID")]
        session_id: String,
        #[serde(rename = "messageID")]
        message_id: String,
        #[serde(rename = "partID")]
        part_id: String,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session.created",
            Self::SessionUpdated { .. } => "session.updated",
            Self::SessionDeleted { .. } => "session.deleted",
            Self::SessionDiff { .. } => "session.diff",
            Self::SessionError { .. } => "session.error",
            Self::MessageUpdated { .. } => "message.updated",
            Self::MessageRemoved { .. } => "message.removed",
            Self::PartUpdated { .. } => "message.part.updated",
            Self::PartRemoved { .. } => "message.part.removed",
        }
    }
}

/// Publish half of the event bus. The transport lives outside this crate;
/// the store only needs somewhere to hand completed events.
pub trait Bus: Send + Sync {
    fn publish(&self, event: Event);
}

/// Bus that drops every event.
pub struct NullBus;

impl Bus for NullBus {
    fn publish(&self, _event: Event) {}
}

/// Bus that records events in memory, for tests and draining bridges.
#[derive(Default)]
pub struct MemoryBus {
    events: Mutex<Vec<Event>>,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take every recorded event, oldest first.
    pub fn drain(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(Event::name).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl Bus for MemoryBus {
    fn publish(&self, event: Event) {
        self.events.lock().push(event);
    }
}
