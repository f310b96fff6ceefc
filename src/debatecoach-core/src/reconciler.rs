//! Event reconciler.
//!
//! Applies decoded control-channel events to the conversation log and
//! dispatches tool calls. Reconciliation never performs I/O: the messages
//! that must go back to the endpoint are returned to the caller, in the
//! order they must be sent.

use serde::Serialize;
use serde_json::{Value, json};

use crate::conversation::{ConversationLog, PROCESSING_PLACEHOLDER, TurnStatus};
use crate::error::DebateError;
use crate::protocol::{ClientEvent, RawEvent, ServerEvent, TokenUsage};
use crate::tools::ToolRegistry;

/// Shown when a partial transcription carries no text yet.
const PARTIAL_PLACEHOLDER: &str = "User is speaking...";

/// A tool call requested by the model and how it was answered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolInvocation {
    pub name: String,
    pub call_id: String,
    pub arguments: Value,
    /// `Ok(result)` or `Err({"error": ...})`.
    pub outcome: Result<Value, Value>,
}

/// Side effects of reconciling one event.
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Messages to send back over the control channel, in order.
    pub outbound: Vec<ClientEvent>,
    pub invocation: Option<ToolInvocation>,
    pub usage: Option<TokenUsage>,
    pub error: Option<String>,
}

pub struct Reconciler<'a> {
    log: &'a mut ConversationLog,
    tools: &'a ToolRegistry,
}

impl<'a> Reconciler<'a> {
    pub fn new(log: &'a mut ConversationLog, tools: &'a ToolRegistry) -> Self {
        Self { log, tools }
    }

    /// Record a raw message, then decode and apply it.
    ///
    /// The raw log entry is written before decoding, so a malformed message
    /// is still retained for diagnostics. A tool call that cannot be decoded
    /// but still names its `call_id` is answered with an error output.
    pub fn handle_message(
        &mut self,
        text: &str,
        raw_log: &mut Vec<RawEvent>,
    ) -> Result<Reconciliation, DebateError> {
        raw_log.push(RawEvent::from_text(text));
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => Ok(self.apply(event)),
            Err(e) => {
                let Some((name, call_id)) = raw_log.last().and_then(|raw| undecodable_call(&raw.payload))
                else {
                    return Err(e.into());
                };
                Ok(answer_call(
                    name,
                    call_id,
                    Value::Null,
                    Err(error_payload(format!("malformed call: {}", e))),
                ))
            }
        }
    }

    pub fn apply(&mut self, event: ServerEvent) -> Reconciliation {
        tracing::trace!(kind = event.kind(), "<- control event");
        match event {
            ServerEvent::SpeechStarted => self.speech_started(),
            ServerEvent::SpeechStopped => self.speech_stopped(),
            ServerEvent::AudioCommitted => self.audio_committed(),
            ServerEvent::PartialTranscript { transcript, text } => {
                self.partial_transcript(transcript.or(text))
            }
            ServerEvent::FinalTranscript { transcript } => self.final_transcript(transcript),
            ServerEvent::AssistantDelta { delta } => self.assistant_delta(&delta),
            ServerEvent::AssistantDone => self.assistant_done(),
            ServerEvent::FunctionCallDone {
                name,
                call_id,
                arguments,
            } => self.function_call(name, call_id, arguments),
            ServerEvent::ResponseDone { response } => Reconciliation {
                usage: response.and_then(|r| r.usage),
                ..Default::default()
            },
            ServerEvent::Error { error } => {
                let message = error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "realtime error".to_string());
                tracing::warn!(error = %message, "Realtime endpoint reported an error");
                Reconciliation {
                    error: Some(message),
                    ..Default::default()
                }
            }
            ServerEvent::Unrecognized => Reconciliation::default(),
        }
    }

    fn speech_started(&mut self) -> Reconciliation {
        self.log.ensure_ephemeral_user().status = Some(TurnStatus::Speaking);
        Reconciliation::default()
    }

    fn speech_stopped(&mut self) -> Reconciliation {
        self.log
            .update_ephemeral_user(|turn| turn.status = Some(TurnStatus::Speaking));
        Reconciliation::default()
    }

    fn audio_committed(&mut self) -> Reconciliation {
        self.log.update_ephemeral_user(|turn| {
            turn.text = PROCESSING_PLACEHOLDER.to_string();
            turn.status = Some(TurnStatus::Processing);
        });
        Reconciliation::default()
    }

    fn partial_transcript(&mut self, partial: Option<String>) -> Reconciliation {
        let text = partial.unwrap_or_else(|| PARTIAL_PLACEHOLDER.to_string());
        self.log.update_ephemeral_user(|turn| {
            turn.text = text;
            turn.status = Some(TurnStatus::Speaking);
            turn.is_final = false;
        });
        Reconciliation::default()
    }

    fn final_transcript(&mut self, transcript: Option<String>) -> Reconciliation {
        if !self.log.finalize_ephemeral_user(transcript.unwrap_or_default()) {
            tracing::debug!("Final transcript without a pending user turn");
        }
        Reconciliation::default()
    }

    fn assistant_delta(&mut self, delta: &str) -> Reconciliation {
        self.log.append_assistant_delta(delta);
        Reconciliation::default()
    }

    fn assistant_done(&mut self) -> Reconciliation {
        self.log.finalize_assistant();
        Reconciliation::default()
    }

    /// Run the tool and answer with exactly one output for `call_id`,
    /// followed by a request to keep generating.
    fn function_call(&mut self, name: String, call_id: String, arguments: Value) -> Reconciliation {
        let (arguments, outcome) = match parse_arguments(arguments) {
            Ok(args) => {
                let outcome = self.tools.invoke(&name, args.clone());
                (args, outcome)
            }
            Err(e) => (Value::Null, Err(error_payload(format!("invalid arguments: {}", e)))),
        };
        answer_call(name, call_id, arguments, outcome)
    }
}

fn error_payload(message: String) -> Value {
    json!({ "error": format!("Error executing function: {}", message) })
}

fn answer_call(
    name: String,
    call_id: String,
    arguments: Value,
    outcome: Result<Value, Value>,
) -> Reconciliation {
    match &outcome {
        Ok(_) => tracing::info!(tool = %name, call_id = %call_id, "Tool call completed"),
        Err(payload) => {
            let error = DebateError::ToolInvocation {
                name: name.clone(),
                message: payload["error"].as_str().unwrap_or_default().to_string(),
            };
            tracing::warn!(call_id = %call_id, error = %error, "Tool call failed");
        }
    }

    let output = match &outcome {
        Ok(result) => result,
        Err(payload) => payload,
    };

    Reconciliation {
        outbound: vec![
            ClientEvent::function_output(call_id.clone(), output),
            ClientEvent::continue_response(),
        ],
        invocation: Some(ToolInvocation {
            name,
            call_id,
            arguments,
            outcome,
        }),
        ..Default::default()
    }
}

/// Name and call id of a function-call message that failed to decode.
fn undecodable_call(payload: &Value) -> Option<(String, String)> {
    if payload.get("type").and_then(Value::as_str) != Some("response.function_call_arguments.done") {
        return None;
    }
    let call_id = payload.get("call_id").and_then(Value::as_str)?;
    let name = payload.get("name").and_then(Value::as_str).unwrap_or_default();
    Some((name.to_string(), call_id.to_string()))
}

/// Arguments arrive as JSON text or as the object itself; empty or absent
/// means no arguments.
fn parse_arguments(arguments: Value) -> Result<Value, String> {
    match arguments {
        Value::Null => Ok(json!({})),
        Value::String(text) if text.trim().is_empty() => Ok(json!({})),
        Value::String(text) => serde_json::from_str(&text).map_err(|e| e.to_string()),
        Value::Object(map) => Ok(Value::Object(map)),
        other => Err(format!("expected a JSON object, got {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;
    use crate::protocol::ConversationItem;

    fn run(events: &[&str], tools: &ToolRegistry) -> (ConversationLog, Vec<RawEvent>, Vec<Reconciliation>) {
        let mut log = ConversationLog::new();
        let mut raw = Vec::new();
        let mut results = Vec::new();
        for event in events {
            let mut reconciler = Reconciler::new(&mut log, tools);
            if let Ok(r) = reconciler.handle_message(event, &mut raw) {
                results.push(r);
            }
        }
        (log, raw, results)
    }

    fn partial(text: &str) -> String {
        json!({"type": "conversation.item.input_audio_transcription", "transcript": text}).to_string()
    }

    fn completed(text: &str) -> String {
        json!({"type": "conversation.item.input_audio_transcription.completed", "transcript": text})
            .to_string()
    }

    fn delta(text: &str) -> String {
        json!({"type": "response.audio_transcript.delta", "delta": text}).to_string()
    }

    const SPEECH_STARTED: &str = r#"{"type":"input_audio_buffer.speech_started"}"#;
    const ASSISTANT_DONE: &str = r#"{"type":"response.audio_transcript.done"}"#;

    fn function_call(name: &str, call_id: &str, arguments: &str) -> String {
        json!({
            "type": "response.function_call_arguments.done",
            "name": name,
            "call_id": call_id,
            "arguments": arguments,
        })
        .to_string()
    }

    fn output_of(event: &ClientEvent) -> (String, Value) {
        match event {
            ClientEvent::ConversationItemCreate {
                item: ConversationItem::FunctionCallOutput { call_id, output },
            } => (call_id.clone(), serde_json::from_str(output).unwrap()),
            other => panic!("expected function output, got {:?}", other),
        }
    }

    #[test]
    fn test_scenario_user_transcription() {
        let events = [
            SPEECH_STARTED.to_string(),
            partial("Hel"),
            partial("Hello there"),
            completed("Hello there."),
        ];
        let refs: Vec<&str> = events.iter().map(String::as_str).collect();
        let (log, raw, _) = run(&refs, &ToolRegistry::new());

        assert_eq!(log.len(), 1);
        let turn = &log.turns()[0];
        assert_eq!(turn.role, Role::User);
        assert_eq!(turn.text, "Hello there.");
        assert!(turn.is_final);
        assert_eq!(turn.status, Some(TurnStatus::Final));
        assert!(log.ephemeral_user().is_none());
        assert_eq!(raw.len(), 4);
    }

    #[test]
    fn test_any_number_of_partials_yields_one_turn() {
        for n in 0..6 {
            let mut events = vec![SPEECH_STARTED.to_string()];
            events.extend((0..n).map(|i| partial(&format!("partial {}", i))));
            events.push(completed("done"));
            let refs: Vec<&str> = events.iter().map(String::as_str).collect();
            let (log, _, _) = run(&refs, &ToolRegistry::new());

            assert_eq!(log.len(), 1, "n = {}", n);
            assert_eq!(log.turns()[0].text, "done");
            assert!(log.turns()[0].is_final);
        }
    }

    #[test]
    fn test_committed_then_final() {
        let events = [
            SPEECH_STARTED.to_string(),
            r#"{"type":"input_audio_buffer.speech_stopped"}"#.to_string(),
            r#"{"type":"input_audio_buffer.committed"}"#.to_string(),
        ];
        let refs: Vec<&str> = events.iter().map(String::as_str).collect();
        let (log, _, _) = run(&refs, &ToolRegistry::new());

        let turn = &log.turns()[0];
        assert_eq!(turn.text, PROCESSING_PLACEHOLDER);
        assert_eq!(turn.status, Some(TurnStatus::Processing));
        assert!(!turn.is_final);
    }

    #[test]
    fn test_partial_without_text_uses_placeholder() {
        let events = [
            SPEECH_STARTED,
            r#"{"type":"conversation.item.input_audio_transcription"}"#,
        ];
        let (log, _, _) = run(&events, &ToolRegistry::new());
        assert_eq!(log.turns()[0].text, PARTIAL_PLACEHOLDER);
    }

    #[test]
    fn test_next_speech_starts_fresh_turn() {
        let events = [
            SPEECH_STARTED.to_string(),
            completed("First."),
            SPEECH_STARTED.to_string(),
            partial("Sec"),
        ];
        let refs: Vec<&str> = events.iter().map(String::as_str).collect();
        let (log, _, _) = run(&refs, &ToolRegistry::new());

        assert_eq!(log.len(), 2);
        assert_eq!(log.turns()[0].text, "First.");
        assert!(log.turns()[0].is_final);
        assert_eq!(log.turns()[1].text, "Sec");
        assert!(!log.turns()[1].is_final);
    }

    #[test]
    fn test_events_without_ephemeral_turn_do_not_create_one() {
        let events = [
            partial("ghost"),
            completed("ghost"),
            r#"{"type":"input_audio_buffer.committed"}"#.to_string(),
        ];
        let refs: Vec<&str> = events.iter().map(String::as_str).collect();
        let (log, raw, _) = run(&refs, &ToolRegistry::new());
        assert!(log.is_empty());
        assert_eq!(raw.len(), 3);
    }

    #[test]
    fn test_scenario_assistant_deltas() {
        let events = [
            delta("The "),
            delta("case "),
            delta("is strong."),
            ASSISTANT_DONE.to_string(),
        ];
        let refs: Vec<&str> = events.iter().map(String::as_str).collect();
        let (log, _, _) = run(&refs, &ToolRegistry::new());

        assert_eq!(log.len(), 1);
        let turn = &log.turns()[0];
        assert_eq!(turn.role, Role::Assistant);
        assert_eq!(turn.text, "The case is strong.");
        assert!(turn.is_final);
    }

    #[test]
    fn test_assistant_done_on_empty_log() {
        let (log, raw, results) = run(&[ASSISTANT_DONE], &ToolRegistry::new());
        assert!(log.is_empty());
        assert_eq!(raw.len(), 1);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_scenario_unregistered_tool() {
        let call = function_call("foo", "call_9", "{}");
        let (_, _, results) = run(&[call.as_str()], &ToolRegistry::new());

        let r = &results[0];
        assert_eq!(r.outbound.len(), 2);
        let (call_id, output) = output_of(&r.outbound[0]);
        assert_eq!(call_id, "call_9");
        assert!(output.get("error").is_some());
        assert_eq!(r.outbound[1], ClientEvent::continue_response());
    }

    #[test]
    fn test_registered_tool_result_is_relayed() {
        let mut tools = ToolRegistry::new();
        tools.register("time_warning", |args| {
            Ok(json!({"success": true, "remaining_seconds": args["remaining_seconds"]}))
        });
        let call = function_call("time_warning", "call_1", r#"{"remaining_seconds":30}"#);
        let (_, _, results) = run(&[call.as_str()], &tools);

        let r = &results[0];
        let (call_id, output) = output_of(&r.outbound[0]);
        assert_eq!(call_id, "call_1");
        assert_eq!(output, json!({"success": true, "remaining_seconds": 30}));

        let invocation = r.invocation.as_ref().unwrap();
        assert_eq!(invocation.arguments, json!({"remaining_seconds": 30}));
        assert!(invocation.outcome.is_ok());
    }

    #[test]
    fn test_exactly_one_output_per_call_in_every_outcome() {
        let mut tools = ToolRegistry::new();
        tools.register("ok", |_| Ok(json!({"fine": true})));
        tools.register("err", |_| Err("nope".into()));
        tools.register("panics", |_| panic!("bad tool"));

        let calls = [
            function_call("ok", "a", "{}"),
            function_call("err", "b", "{}"),
            function_call("panics", "c", "{}"),
            function_call("missing", "d", "{}"),
            function_call("ok", "e", "{not json"),
        ];
        let refs: Vec<&str> = calls.iter().map(String::as_str).collect();
        let (_, _, results) = run(&refs, &tools);

        assert_eq!(results.len(), 5);
        for (r, expected) in results.iter().zip(["a", "b", "c", "d", "e"]) {
            let outputs: Vec<_> = r
                .outbound
                .iter()
                .filter(|e| matches!(e, ClientEvent::ConversationItemCreate { .. }))
                .collect();
            assert_eq!(outputs.len(), 1);
            assert_eq!(output_of(outputs[0]).0, expected);
        }
        assert!(output_of(&results[1].outbound[0]).1["error"]
            .as_str()
            .unwrap()
            .contains("nope"));
        assert!(output_of(&results[4].outbound[0]).1.get("error").is_some());
    }

    #[test]
    fn test_object_arguments_are_used_as_is() {
        let mut tools = ToolRegistry::new();
        tools.register("foo", |args| Ok(json!({"doubled": args["x"].as_i64().unwrap_or(0) * 2})));
        let call = r#"{"type":"response.function_call_arguments.done","name":"foo","call_id":"c7","arguments":{"x":1}}"#;
        let (_, raw, results) = run(&[call], &tools);

        assert_eq!(raw.len(), 1);
        let (call_id, output) = output_of(&results[0].outbound[0]);
        assert_eq!(call_id, "c7");
        assert_eq!(output, json!({"doubled": 2}));
        assert_eq!(results[0].outbound[1], ClientEvent::continue_response());
    }

    #[test]
    fn test_scalar_arguments_get_error_output() {
        let mut tools = ToolRegistry::new();
        tools.register("foo", |_| Ok(json!({"ran": true})));
        let calls = [
            r#"{"type":"response.function_call_arguments.done","name":"foo","call_id":"n1","arguments":5}"#,
            r#"{"type":"response.function_call_arguments.done","name":"foo","call_id":"n2","arguments":[1]}"#,
        ];
        let (_, _, results) = run(&calls, &tools);

        assert_eq!(results.len(), 2);
        for (r, expected) in results.iter().zip(["n1", "n2"]) {
            let (call_id, output) = output_of(&r.outbound[0]);
            assert_eq!(call_id, expected);
            assert!(output["error"].as_str().unwrap().contains("invalid arguments"));
            assert_eq!(r.outbound.len(), 2);
        }
    }

    #[test]
    fn test_undecodable_call_with_call_id_is_answered() {
        let tools = ToolRegistry::new();
        let call = r#"{"type":"response.function_call_arguments.done","name":42,"call_id":"c9","arguments":"{}"}"#;
        let (_, raw, results) = run(&[call], &tools);

        assert_eq!(raw.len(), 1);
        assert_eq!(results.len(), 1);
        let (call_id, output) = output_of(&results[0].outbound[0]);
        assert_eq!(call_id, "c9");
        assert!(output["error"].as_str().unwrap().contains("malformed call"));
        assert_eq!(results[0].outbound[1], ClientEvent::continue_response());
        assert!(results[0].invocation.as_ref().unwrap().outcome.is_err());
    }

    #[test]
    fn test_call_without_call_id_is_an_error() {
        let call = r#"{"type":"response.function_call_arguments.done","name":"foo","arguments":"{}"}"#;
        let mut log = ConversationLog::new();
        let mut raw = Vec::new();
        let tools = ToolRegistry::new();
        let result = Reconciler::new(&mut log, &tools).handle_message(call, &mut raw);

        assert!(matches!(result, Err(DebateError::Json(_))));
        assert_eq!(raw.len(), 1);
    }

    #[test]
    fn test_malformed_message_is_logged_and_skipped() {
        let events = ["{oops", r#"{"no_type":1}"#, SPEECH_STARTED];
        let (log, raw, results) = run(&events, &ToolRegistry::new());

        assert_eq!(raw.len(), 3);
        assert_eq!(raw[0].payload, Value::String("{oops".into()));
        assert_eq!(results.len(), 1);
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_unrecognized_event_only_reaches_raw_log() {
        let (log, raw, results) = run(&[r#"{"type":"session.created","session":{}}"#], &ToolRegistry::new());
        assert!(log.is_empty());
        assert_eq!(raw.len(), 1);
        assert!(results[0].outbound.is_empty());
    }

    #[test]
    fn test_response_done_reports_usage() {
        let event = r#"{"type":"response.done","response":{"usage":{"total_tokens":7,"input_tokens":3,"output_tokens":4}}}"#;
        let (_, _, results) = run(&[event], &ToolRegistry::new());
        assert_eq!(results[0].usage.unwrap().total_tokens, 7);
    }

    #[test]
    fn test_error_event_reports_message() {
        let event = r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad session"}}"#;
        let (_, _, results) = run(&[event], &ToolRegistry::new());
        assert_eq!(results[0].error.as_deref(), Some("bad session"));
    }
}
