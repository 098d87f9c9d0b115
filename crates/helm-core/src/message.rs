use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::id::{self, Kind};
use crate::session::FileDiff;

pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Provider/model pair that produced (or should answer) a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelRef {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

/// Normalized token counts for one assistant turn.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
    pub cache: CacheTokens,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTokens {
    pub read: u64,
    pub write: u64,
}

/// One turn within a session, discriminated by role.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub time: UserTime,
    pub agent: String,
    pub model: ModelRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<UserSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<BTreeMap<String, bool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserTime {
    pub created: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    pub diffs: Vec<FileDiff>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    /// The user message that triggered this turn.
    #[serde(rename = "parentID")]
    pub parent_id: String,
    pub time: AssistantTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ProviderError>,
    #[serde(rename = "modelID")]
    pub model_id: String,
    #[serde(rename = "providerID")]
    pub provider_id: String,
    pub agent: String,
    /// Set when this turn is the summarizing answer to a compaction request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<bool>,
    pub cost: f64,
    pub tokens: TokenTotals,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssistantTime {
    pub created: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
}

impl Message {
    pub fn id(&self) -> &str {
        match self {
            Self::User(m) => &m.id,
            Self::Assistant(m) => &m.id,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::User(m) => &m.session_id,
            Self::Assistant(m) => &m.session_id,
        }
    }

    pub fn created(&self) -> i64 {
        match self {
            Self::User(m) => m.time.created,
            Self::Assistant(m) => m.time.created,
        }
    }

    pub fn role_name(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Assistant(_) => "assistant",
        }
    }

    pub fn set_id(&mut self, id: String) {
        match self {
            Self::User(m) => m.id = id,
            Self::Assistant(m) => m.id = id,
        }
    }

    pub fn set_session_id(&mut self, session_id: String) {
        match self {
            Self::User(m) => m.session_id = session_id,
            Self::Assistant(m) => m.session_id = session_id,
        }
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Self::Assistant(m) => Some(m),
            Self::User(_) => None,
        }
    }

    pub fn as_user(&self) -> Option<&UserMessage> {
        match self {
            Self::User(m) => Some(m),
            Self::Assistant(_) => None,
        }
    }
}

impl UserMessage {
    /// Fresh user message for a session, with an ascending ID.
    pub fn new(session_id: impl Into<String>, agent: impl Into<String>, model: ModelRef) -> Self {
        Self {
            id: id::ascending(Kind::Message),
            session_id: session_id.into(),
            time: UserTime { created: Utc::now().timestamp_millis() },
            agent: agent.into(),
            model,
            summary: None,
            system: None,
            tools: None,
            variant: None,
        }
    }
}

impl AssistantMessage {
    /// Fresh assistant message answering `user`, with an ascending ID.
    pub fn reply_to(user: &UserMessage, agent: impl Into<String>) -> Self {
        Self {
            id: id::ascending(Kind::Message),
            session_id: user.session_id.clone(),
            parent_id: user.id.clone(),
            time: AssistantTime { created: Utc::now().timestamp_millis(), completed: None },
            error: None,
            model_id: user.model.model_id.clone(),
            provider_id: user.model.provider_id.clone(),
            agent: agent.into(),
            summary: None,
            cost: 0.0,
            tokens: TokenTotals::default(),
            finish: None,
        }
    }
}

// --- Parts ---

/// Atomic content unit within a message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Part {
    #[serde(rename = "text")]
    Text(TextPart),
    #[serde(rename = "reasoning")]
    Reasoning(ReasoningPart),
    #[serde(rename = "file")]
    File(FilePart),
    #[serde(rename = "tool")]
    Tool(ToolPart),
    #[serde(rename = "snapshot")]
    Snapshot(SnapshotPart),
    #[serde(rename = "patch")]
    Patch(PatchPart),
    #[serde(rename = "agent")]
    Agent(AgentPart),
    #[serde(rename = "retry")]
    Retry(RetryPart),
    #[serde(rename = "step-start")]
    StepStart(StepStartPart),
    #[serde(rename = "step-finish")]
    StepFinish(StepFinishPart),
    #[serde(rename = "compaction")]
    Compaction(CompactionPart),
    #[serde(rename = "subtask")]
    Subtask(SubtaskPart),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartTime {
    pub start: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextPart {
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthetic: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignored: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<PartTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReasoningPart {
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    pub time: PartTime,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceText {
    pub value: String,
    pub start: i64,
    pub end: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FilePartSource {
    File {
        path: String,
        text: SourceText,
    },
    Symbol {
        path: String,
        name: String,
        kind: i64,
        range: serde_json::Value,
        text: SourceText,
    },
    Resource {
        #[serde(rename = "clientName")]
        client_name: String,
        uri: String,
        text: SourceText,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilePart {
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub mime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<FilePartSource>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolPart {
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "callID")]
    pub call_id: String,
    pub tool: String,
    pub state: ToolState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPart {
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub snapshot: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatchPart {
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub hash: String,
    pub files: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentPart {
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceText>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreatedAt {
    pub created: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPart {
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub attempt: u32,
    pub error: ProviderError,
    pub time: CreatedAt,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepStartPart {
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepFinishPart {
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    pub cost: f64,
    pub tokens: TokenTotals,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompactionPart {
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub auto: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubtaskPart {
    pub id: String,
    #[serde(rename = "messageID")]
    pub message_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub prompt: String,
    pub description: String,
    pub agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

macro_rules! each_part {
    ($value:expr, $part:ident => $body:expr) => {
        match $value {
            Part::Text($part) => $body,
            Part::Reasoning($part) => $body,
            Part::File($part) => $body,
            Part::Tool($part) => $body,
            Part::Snapshot($part) => $body,
            Part::Patch($part) => $body,
            Part::Agent($part) => $body,
            Part::Retry($part) => $body,
            Part::StepStart($part) => $body,
            Part::StepFinish($part) => $body,
            Part::Compaction($part) => $body,
            Part::Subtask($part) => $body,
        }
    };
}

impl Part {
    pub fn id(&self) -> &str {
        each_part!(self, p => &p.id)
    }

    pub fn message_id(&self) -> &str {
        each_part!(self, p => &p.message_id)
    }

    pub fn session_id(&self) -> &str {
        each_part!(self, p => &p.session_id)
    }

    pub fn set_id(&mut self, id: String) {
        each_part!(self, p => p.id = id)
    }

    pub fn set_message_id(&mut self, message_id: String) {
        each_part!(self, p => p.message_id = message_id)
    }

    pub fn set_session_id(&mut self, session_id: String) {
        each_part!(self, p => p.session_id = session_id)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Reasoning(_) => "reasoning",
            Self::File(_) => "file",
            Self::Tool(_) => "tool",
            Self::Snapshot(_) => "snapshot",
            Self::Patch(_) => "patch",
            Self::Agent(_) => "agent",
            Self::Retry(_) => "retry",
            Self::StepStart(_) => "step-start",
            Self::StepFinish(_) => "step-finish",
            Self::Compaction(_) => "compaction",
            Self::Subtask(_) => "subtask",
        }
    }

    /// Whether this part can receive streaming delta updates.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Text(_) | Self::Reasoning(_))
    }
}

fn base(message: &Message) -> (String, String, String) {
    (
        id::ascending(Kind::Part),
        message.id().to_string(),
        message.session_id().to_string(),
    )
}

impl TextPart {
    pub fn new(message: &Message, text: impl Into<String>) -> Self {
        let (id, message_id, session_id) = base(message);
        Self {
            id,
            message_id,
            session_id,
            text: text.into(),
            synthetic: None,
            ignored: None,
            time: None,
            metadata: None,
        }
    }
}

impl ReasoningPart {
    pub fn new(message: &Message, text: impl Into<String>) -> Self {
        let (id, message_id, session_id) = base(message);
        Self {
            id,
            message_id,
            session_id,
            text: text.into(),
            metadata: None,
            time: PartTime { start: Utc::now().timestamp_millis(), end: None },
        }
    }
}

impl ToolPart {
    pub fn new(
        message: &Message,
        tool: impl Into<String>,
        call_id: impl Into<String>,
        state: ToolState,
    ) -> Self {
        let (id, message_id, session_id) = base(message);
        Self {
            id,
            message_id,
            session_id,
            call_id: call_id.into(),
            tool: tool.into(),
            state,
            metadata: None,
        }
    }
}

impl StepStartPart {
    pub fn new(message: &Message) -> Self {
        let (id, message_id, session_id) = base(message);
        Self { id, message_id, session_id, snapshot: None }
    }
}

impl CompactionPart {
    pub fn new(message: &Message, auto: bool) -> Self {
        let (id, message_id, session_id) = base(message);
        Self { id, message_id, session_id, auto }
    }
}

// --- Tool state machine ---

/// State machine for a tool invocation. Transitions only move forward:
/// pending -> running -> completed | error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolState {
    Pending {
        input: serde_json::Value,
        raw: String,
    },
    Running {
        input: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
        time: ToolTimeStart,
    },
    Completed {
        input: serde_json::Value,
        output: String,
        title: String,
        metadata: Metadata,
        time: ToolTimeComplete,
        #[serde(skip_serializing_if = "Option::is_none")]
        attachments: Option<Vec<FilePart>>,
    },
    Error {
        input: serde_json::Value,
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
        time: ToolTimeError,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolTimeStart {
    pub start: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolTimeComplete {
    pub start: i64,
    pub end: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compacted: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolTimeError {
    pub start: i64,
    pub end: i64,
}

impl ToolState {
    pub fn status_name(&self) -> &'static str {
        match self {
            Self::Pending { .. } => "pending",
            Self::Running { .. } => "running",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
        }
    }

    pub fn input(&self) -> &serde_json::Value {
        match self {
            Self::Pending { input, .. }
            | Self::Running { input, .. }
            | Self::Completed { input, .. }
            | Self::Error { input, .. } => input,
        }
    }

    /// A call that has not reached a terminal state. Such calls must be
    /// converted to a synthetic error before being replayed to a model.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Pending { .. } | Self::Running { .. })
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending { .. } => 0,
            Self::Running { .. } => 1,
            Self::Completed { .. } | Self::Error { .. } => 2,
        }
    }

    /// Transitions never move backward.
    pub fn can_advance_to(&self, next: &ToolState) -> bool {
        next.rank() >= self.rank()
    }
}

/// A message plus its parts, as read back from the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageWithParts {
    pub info: Message,
    pub parts: Vec<Part>,
}
