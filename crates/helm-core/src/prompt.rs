use serde::Serialize;

use crate::cost::Model;
use crate::message::{FilePart, Message, MessageWithParts, Metadata, Part, ToolState};

/// Placeholder output for a tool call whose run was interrupted before it
/// resolved. Model APIs reject a tool call with no result, so unresolved
/// calls are answered with this instead of being dropped.
pub const INTERRUPTED_TOOL_OUTPUT: &str = "[Tool execution was interrupted]";

/// Replacement for tool output that a compaction pass already summarized.
pub const COMPACTED_TOOL_OUTPUT: &str = "[Old tool result content cleared]";

const COMPACTION_CUE: &str = "What did we do so far?";
const SUBTASK_CUE: &str = "The following tool was executed by the user";

const PLAIN_TEXT_MIME: &str = "text/plain";
const DIRECTORY_MIME: &str = "application/x-directory";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    User,
    Assistant,
}

/// A message normalized for replay to a model.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PromptMessage {
    pub id: String,
    pub role: PromptRole,
    pub parts: Vec<PromptPart>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PromptPart {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<Metadata>,
    },
    File {
        url: String,
        media_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    Reasoning {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<Metadata>,
    },
    StepStart,
    Tool {
        tool: String,
        call_id: String,
        input: serde_json::Value,
        result: ToolResult,
        #[serde(skip_serializing_if = "Option::is_none")]
        provider_metadata: Option<Metadata>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum ToolResult {
    OutputAvailable {
        text: String,
        attachments: Vec<FilePart>,
    },
    OutputError {
        text: String,
    },
}

/// Convert stored messages into the normalized prompt a model receives.
///
/// Provider metadata (cache hints etc.) is attached only when replaying to
/// the same provider/model pair that produced it; cross-model replay must
/// not leak provider-specific cache tokens.
pub fn to_model_messages(records: &[MessageWithParts], model: &Model) -> Vec<PromptMessage> {
    let mut result = Vec::new();

    for record in records {
        if record.parts.is_empty() {
            continue;
        }
        match &record.info {
            Message::User(user) => {
                let mut parts = Vec::new();
                for part in &record.parts {
                    match part {
                        Part::Text(text) => {
                            if text.ignored.unwrap_or(false) || text.synthetic.unwrap_or(false) {
                                continue;
                            }
                            parts.push(PromptPart::Text {
                                text: text.text.clone(),
                                provider_metadata: None,
                            });
                        }
                        // Plain-text and directory files were already folded
                        // into text parts upstream.
                        Part::File(file) => {
                            if file.mime == PLAIN_TEXT_MIME || file.mime == DIRECTORY_MIME {
                                continue;
                            }
                            parts.push(PromptPart::File {
                                url: file.url.clone(),
                                media_type: file.mime.clone(),
                                filename: file.filename.clone(),
                            });
                        }
                        Part::Compaction(_) => parts.push(PromptPart::Text {
                            text: COMPACTION_CUE.into(),
                            provider_metadata: None,
                        }),
                        Part::Subtask(_) => parts.push(PromptPart::Text {
                            text: SUBTASK_CUE.into(),
                            provider_metadata: None,
                        }),
                        _ => {}
                    }
                }
                result.push(PromptMessage { id: user.id.clone(), role: PromptRole::User, parts });
            }
            Message::Assistant(assistant) => {
                let same_model = assistant.provider_id == model.provider_id
                    && assistant.model_id == model.id;
                let keep_metadata = |metadata: &Option<Metadata>| -> Option<Metadata> {
                    if same_model { metadata.clone() } else { None }
                };

                if let Some(error) = &assistant.error {
                    let salvageable = record
                        .parts
                        .iter()
                        .any(|p| !matches!(p, Part::StepStart(_) | Part::Reasoning(_)));
                    if !(error.is_aborted() && salvageable) {
                        continue;
                    }
                }

                let mut parts = Vec::new();
                for part in &record.parts {
                    match part {
                        Part::Text(text) => parts.push(PromptPart::Text {
                            text: text.text.clone(),
                            provider_metadata: keep_metadata(&text.metadata),
                        }),
                        Part::StepStart(_) => parts.push(PromptPart::StepStart),
                        Part::Reasoning(reasoning) => parts.push(PromptPart::Reasoning {
                            text: reasoning.text.clone(),
                            provider_metadata: keep_metadata(&reasoning.metadata),
                        }),
                        Part::Tool(tool) => {
                            let result_part = match &tool.state {
                                ToolState::Completed { output, time, attachments, .. } => {
                                    if time.compacted.is_some() {
                                        ToolResult::OutputAvailable {
                                            text: COMPACTED_TOOL_OUTPUT.into(),
                                            attachments: Vec::new(),
                                        }
                                    } else {
                                        ToolResult::OutputAvailable {
                                            text: output.clone(),
                                            attachments: attachments.clone().unwrap_or_default(),
                                        }
                                    }
                                }
                                ToolState::Error { error, .. } => {
                                    ToolResult::OutputError { text: error.clone() }
                                }
                                ToolState::Pending { .. } | ToolState::Running { .. } => {
                                    ToolResult::OutputError {
                                        text: INTERRUPTED_TOOL_OUTPUT.into(),
                                    }
                                }
                            };
                            parts.push(PromptPart::Tool {
                                tool: tool.tool.clone(),
                                call_id: tool.call_id.clone(),
                                input: tool.state.input().clone(),
                                result: result_part,
                                provider_metadata: keep_metadata(&tool.metadata),
                            });
                        }
                        _ => {}
                    }
                }
                if !parts.is_empty() {
                    result.push(PromptMessage {
                        id: assistant.id.clone(),
                        role: PromptRole::Assistant,
                        parts,
                    });
                }
            }
        }
    }

    // A message whose only surviving parts are step markers carries nothing
    // for the model.
    result.retain(|message| message.parts.iter().any(|p| !matches!(p, PromptPart::StepStart)));
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::message::{
        AssistantMessage, CompactionPart, FilePart, Metadata, ModelRef, ReasoningPart,
        StepStartPart, TextPart, ToolPart, ToolState, ToolTimeComplete, ToolTimeError,
        ToolTimeStart, UserMessage,
    };
    use serde_json::json;

    fn model() -> Model {
        Model { id: "claude-sonnet-4-5".into(), provider_id: "anthropic".into(), cost: None }
    }

    fn model_ref() -> ModelRef {
        ModelRef { provider_id: "anthropic".into(), model_id: "claude-sonnet-4-5".into() }
    }

    fn user_message() -> Message {
        Message::User(UserMessage::new("ses_1", "build", model_ref()))
    }

    fn assistant_message(user: &Message) -> Message {
        Message::Assistant(AssistantMessage::reply_to(user.as_user().unwrap(), "build"))
    }

    #[test]
    fn skips_messages_with_no_parts() {
        let records = vec![MessageWithParts { info: user_message(), parts: vec![] }];
        assert!(to_model_messages(&records, &model()).is_empty());
    }

    #[test]
    fn user_text_filtering() {
        let info = user_message();
        let mut ignored = TextPart::new(&info, "hidden");
        ignored.ignored = Some(true);
        let mut synthetic = TextPart::new(&info, "injected");
        synthetic.synthetic = Some(true);
        let kept = TextPart::new(&info, "real question");

        let records = vec![MessageWithParts {
            info,
            parts: vec![Part::Text(ignored), Part::Text(synthetic), Part::Text(kept)],
        }];
        let prompt = to_model_messages(&records, &model());
        assert_eq!(prompt.len(), 1);
        assert_eq!(
            prompt[0].parts,
            vec![PromptPart::Text { text: "real question".into(), provider_metadata: None }]
        );
    }

    #[test]
    fn user_file_mime_filtering() {
        let info = user_message();
        let image = FilePart {
            id: "prt_a".into(),
            message_id: info.id().into(),
            session_id: "ses_1".into(),
            mime: "image/png".into(),
            filename: Some("shot.png".into()),
            url: "data:image/png;base64,xxxx".into(),
            source: None,
        };
        let mut plain = image.clone();
        plain.id = "prt_b".into();
        plain.mime = "text/plain".into();
        let mut dir = image.clone();
        dir.id = "prt_c".into();
        dir.mime = "application/x-directory".into();

        let records = vec![MessageWithParts {
            info,
            parts: vec![Part::File(image), Part::File(plain), Part::File(dir)],
        }];
        let prompt = to_model_messages(&records, &model());
        assert_eq!(prompt[0].parts.len(), 1);
        assert!(matches!(&prompt[0].parts[0], PromptPart::File { media_type, .. } if media_type == "image/png"));
    }

    #[test]
    fn compaction_and_subtask_become_text_cues() {
        let info = user_message();
        let compaction = CompactionPart::new(&info, false);
        let records = vec![MessageWithParts { info, parts: vec![Part::Compaction(compaction)] }];
        let prompt = to_model_messages(&records, &model());
        assert_eq!(
            prompt[0].parts,
            vec![PromptPart::Text { text: "What did we do so far?".into(), provider_metadata: None }]
        );
    }

    #[test]
    fn non_abort_error_skips_the_assistant_message() {
        let user = user_message();
        let mut assistant = AssistantMessage::reply_to(user.as_user().unwrap(), "build");
        assistant.error = Some(ProviderError::unknown("boom"));
        let info = Message::Assistant(assistant);
        let text = TextPart::new(&info, "half an answer");
        let records = vec![MessageWithParts { info, parts: vec![Part::Text(text)] }];
        // A non-abort error drops the message even when parts exist.
        assert!(to_model_messages(&records, &model()).is_empty());
    }

    #[test]
    fn aborted_assistant_with_salvageable_content_is_kept() {
        let user = user_message();
        let mut assistant = AssistantMessage::reply_to(user.as_user().unwrap(), "build");
        assistant.error = Some(ProviderError::aborted("ctrl-c"));
        let info = Message::Assistant(assistant.clone());
        let text = TextPart::new(&info, "partial answer");
        let records = vec![MessageWithParts { info: info.clone(), parts: vec![Part::Text(text)] }];
        let prompt = to_model_messages(&records, &model());
        assert_eq!(prompt.len(), 1);

        // Aborted with only reasoning/step parts is still dropped.
        let reasoning = ReasoningPart::new(&info, "thinking");
        let step = StepStartPart::new(&info);
        let records = vec![MessageWithParts {
            info,
            parts: vec![Part::Reasoning(reasoning), Part::StepStart(step)],
        }];
        assert!(to_model_messages(&records, &model()).is_empty());
    }

    #[test]
    fn unresolved_tool_calls_become_synthetic_errors() {
        let user = user_message();
        let info = assistant_message(&user);
        let running = ToolPart::new(
            &info,
            "bash",
            "call_run",
            ToolState::Running {
                input: json!({"command": "sleep 100"}),
                title: None,
                metadata: None,
                time: ToolTimeStart { start: 1 },
            },
        );
        let pending = ToolPart::new(
            &info,
            "read",
            "call_pend",
            ToolState::Pending { input: json!({}), raw: "{}".into() },
        );
        let records = vec![MessageWithParts {
            info,
            parts: vec![Part::Tool(running), Part::Tool(pending)],
        }];
        let prompt = to_model_messages(&records, &model());
        assert_eq!(prompt[0].parts.len(), 2);
        for part in &prompt[0].parts {
            match part {
                PromptPart::Tool { result, .. } => assert_eq!(
                    result,
                    &ToolResult::OutputError { text: "[Tool execution was interrupted]".into() }
                ),
                other => panic!("expected tool part, got {other:?}"),
            }
        }
    }

    #[test]
    fn compacted_tool_output_is_cleared() {
        let user = user_message();
        let info = assistant_message(&user);
        let attachment = FilePart {
            id: "prt_att".into(),
            message_id: info.id().into(),
            session_id: "ses_1".into(),
            mime: "image/png".into(),
            filename: None,
            url: "data:image/png;base64,zzz".into(),
            source: None,
        };
        let done = ToolPart::new(
            &info,
            "read",
            "call_done",
            ToolState::Completed {
                input: json!({}),
                output: "large old output".into(),
                title: "read".into(),
                metadata: Metadata::new(),
                time: ToolTimeComplete { start: 1, end: 2, compacted: Some(3) },
                attachments: Some(vec![attachment]),
            },
        );
        let records = vec![MessageWithParts { info, parts: vec![Part::Tool(done)] }];
        let prompt = to_model_messages(&records, &model());
        match &prompt[0].parts[0] {
            PromptPart::Tool { result: ToolResult::OutputAvailable { text, attachments }, .. } => {
                assert_eq!(text, "[Old tool result content cleared]");
                assert!(attachments.is_empty());
            }
            other => panic!("expected cleared tool output, got {other:?}"),
        }
    }

    #[test]
    fn tool_errors_pass_through() {
        let user = user_message();
        let info = assistant_message(&user);
        let failed = ToolPart::new(
            &info,
            "bash",
            "call_err",
            ToolState::Error {
                input: json!({}),
                error: "permission denied".into(),
                metadata: None,
                time: ToolTimeError { start: 1, end: 2 },
            },
        );
        let records = vec![MessageWithParts { info, parts: vec![Part::Tool(failed)] }];
        let prompt = to_model_messages(&records, &model());
        assert!(matches!(
            &prompt[0].parts[0],
            PromptPart::Tool { result: ToolResult::OutputError { text }, .. }
                if text == "permission denied"
        ));
    }

    #[test]
    fn provider_metadata_only_for_same_model() {
        let user = user_message();
        let info = assistant_message(&user);
        let mut text = TextPart::new(&info, "answer");
        let mut metadata = Metadata::new();
        metadata.insert("anthropic".into(), json!({"cacheControl": {"type": "ephemeral"}}));
        text.metadata = Some(metadata.clone());
        let records = vec![MessageWithParts { info, parts: vec![Part::Text(text)] }];

        let same = to_model_messages(&records, &model());
        assert!(matches!(
            &same[0].parts[0],
            PromptPart::Text { provider_metadata: Some(m), .. } if m == &metadata
        ));

        let other = Model { id: "gpt-5".into(), provider_id: "openai".into(), cost: None };
        let cross = to_model_messages(&records, &other);
        assert!(matches!(
            &cross[0].parts[0],
            PromptPart::Text { provider_metadata: None, .. }
        ));
    }

    #[test]
    fn step_marker_only_messages_are_dropped() {
        let user = user_message();
        let info = assistant_message(&user);
        let step = StepStartPart::new(&info);
        let records = vec![MessageWithParts { info, parts: vec![Part::StepStart(step)] }];
        assert!(to_model_messages(&records, &model()).is_empty());
    }
}
