//! AI narrative requests. The request is acknowledged right away and the
//! reply is streamed afterwards as `narrative.*` event lines.

use crate::bands::BandTally;
use crate::calc::ScoreRecord;
use crate::db;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::handlers::analytics::{section_distribution, subject_summary};
use crate::ipc::handlers::setup::topic_titles;
use crate::ipc::helpers::{db_conn, optional_f64, optional_str, required_str};
use crate::ipc::types::{AppState, Emitter, NarrativeRegistry, Request};
use crate::narrative::{
    collect_narrative, section_messages, student_messages, subject_messages, CancelToken, ChatClient,
    ChatMessage, ChatSettings, NarrativeStream, SubjectSummary,
};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

const CHAT_SETTINGS_KEY: &str = "ai.chat";
const MAX_TOKENS_LIMIT: u32 = 4096;

fn load_chat_settings(conn: Option<&Connection>) -> ChatSettings {
    let Some(conn) = conn else {
        return ChatSettings::default();
    };
    match db::settings_get_json(conn, CHAT_SETTINGS_KEY) {
        Ok(Some(v)) => serde_json::from_value(v).unwrap_or_else(|e| {
            warn!(error = %e, "ignoring malformed chat settings");
            ChatSettings::default()
        }),
        Ok(None) => ChatSettings::default(),
        Err(e) => {
            warn!(error = ?e, "failed to read chat settings");
            ChatSettings::default()
        }
    }
}

fn ai_config_get(state: &AppState) -> Result<serde_json::Value, HandlerErr> {
    let settings = load_chat_settings(state.db.as_ref());
    Ok(json!({
        "configured": state.chat.is_some(),
        "settings": settings,
    }))
}

fn ai_config_update(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = db_conn(state)?;
    let mut settings = load_chat_settings(Some(conn));

    if let Some(model) = optional_str(req, "model") {
        settings.model = model;
    }
    if let Some(t) = optional_f64(req, "temperature")? {
        if !(0.0..=2.0).contains(&t) {
            return Err(HandlerErr::bad_params("temperature must be between 0 and 2")
                .with_details(json!({ "temperature": t })));
        }
        settings.temperature = t;
    }
    if let Some(v) = req.params.get("maxTokens").filter(|v| !v.is_null()) {
        let max_tokens = v
            .as_u64()
            .filter(|n| (1..=MAX_TOKENS_LIMIT as u64).contains(n))
            .ok_or_else(|| {
                HandlerErr::bad_params(format!("maxTokens must be an integer in 1..={}", MAX_TOKENS_LIMIT))
            })?;
        settings.max_tokens = max_tokens as u32;
    }

    let value = serde_json::to_value(&settings).map_err(|e| HandlerErr::new("bad_params", e.to_string()))?;
    db::settings_set_json(conn, CHAT_SETTINGS_KEY, &value)
        .map_err(|e| HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "settings" })))?;
    Ok(json!({ "settings": settings }))
}

fn usize_field(obj: &serde_json::Value, key: &str) -> Result<usize, HandlerErr> {
    obj.get(key)
        .and_then(|v| v.as_u64())
        .map(|n| n as usize)
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a non-negative integer", key)))
}

fn subject_prompt(state: &AppState, req: &Request) -> Result<Vec<ChatMessage>, HandlerErr> {
    if let Some(raw) = req.params.get("summary") {
        let summary: SubjectSummary = serde_json::from_value(raw.clone())
            .map_err(|e| HandlerErr::bad_params(format!("invalid summary: {}", e)))?;
        let name = required_str(req, "subjectName")?;
        return Ok(subject_messages(&summary, &name));
    }

    let conn = db_conn(state)?;
    let subject_id = required_str(req, "subjectId")?;
    let section_id = optional_str(req, "sectionId");
    let title: Option<String> = conn
        .query_row("SELECT title FROM subjects WHERE id = ?", [&subject_id], |r| r.get(0))
        .optional()
        .map_err(HandlerErr::query)?;
    let Some(title) = title else {
        return Err(HandlerErr::not_found("subject"));
    };
    let summary = subject_summary(conn, &subject_id, section_id.as_deref())?;
    Ok(subject_messages(&summary, &title))
}

fn section_prompt(state: &AppState, req: &Request) -> Result<Vec<ChatMessage>, HandlerErr> {
    if let Some(raw) = req.params.get("distribution") {
        let tally = BandTally {
            excellent: usize_field(raw, "excellentCount")?,
            good: usize_field(raw, "goodCount")?,
            average: usize_field(raw, "averageCount")?,
            failing: usize_field(raw, "failingCount")?,
        };
        let name = required_str(req, "sectionName")?;
        return Ok(section_messages(&tally, &name));
    }

    let conn = db_conn(state)?;
    let section_id = required_str(req, "sectionId")?;
    let subject_id = optional_str(req, "subjectId");
    let code: Option<String> = conn
        .query_row("SELECT code FROM sections WHERE id = ?", [&section_id], |r| r.get(0))
        .optional()
        .map_err(HandlerErr::query)?;
    let Some(code) = code else {
        return Err(HandlerErr::not_found("section"));
    };
    let tally = section_distribution(conn, &section_id, subject_id.as_deref())?;
    Ok(section_messages(&tally, &code))
}

fn student_prompt(state: &AppState, req: &Request) -> Result<Vec<ChatMessage>, HandlerErr> {
    if let Some(raw) = req.params.get("record") {
        let record = ScoreRecord::from_json(raw)
            .map_err(|e| HandlerErr::new(e.code(), e.to_string()).with_details(e.details()))?;
        let name = required_str(req, "studentName")?;
        let topics: Vec<String> = match req.params.get("topicNames").filter(|v| !v.is_null()) {
            None => Vec::new(),
            Some(v) => v
                .as_array()
                .and_then(|items| items.iter().map(|t| t.as_str().map(str::to_string)).collect())
                .ok_or_else(|| HandlerErr::bad_params("topicNames must be an array of strings"))?,
        };
        return Ok(student_messages(&record, &name, &topics));
    }

    let conn = db_conn(state)?;
    let record_id = required_str(req, "recordId")?;
    let owner: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT s.firstname, s.lastname, cr.id, cr.subject_id
             FROM records r
             JOIN students s ON s.id = r.student_id
             JOIN class_records cr ON cr.id = r.class_record_id
             WHERE r.id = ?",
            [&record_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let Some((firstname, lastname, class_record_id, subject_id)) = owner else {
        return Err(HandlerErr::not_found("record").with_details(json!({ "recordId": record_id })));
    };
    let record = db::load_score_record(conn, &record_id)
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("record"))?;

    let mut topics = topic_titles(conn, &subject_id, Some(class_record_id.as_str()))?;
    if topics.is_empty() {
        topics = topic_titles(conn, &subject_id, None)?;
    }
    let names: Vec<String> = topics.into_iter().map(|(_, title)| title).collect();
    Ok(student_messages(&record, &format!("{} {}", firstname, lastname), &names))
}

fn run_worker(
    chat: Arc<dyn ChatClient>,
    messages: Vec<ChatMessage>,
    settings: ChatSettings,
    cancel: CancelToken,
    request_id: String,
    emitter: Emitter,
    registry: NarrativeRegistry,
) {
    let outcome = chat.stream_chat(&messages, &settings).and_then(|fragments| {
        collect_narrative(NarrativeStream::new(fragments, cancel)?, |text| {
            emitter.emit(&json!({
                "event": "narrative.fragment",
                "requestId": request_id,
                "text": text,
            }));
        })
    });

    // Deregister before the terminal event so the id is free once a client
    // sees it.
    registry.finish(&request_id);
    match outcome {
        Ok(o) => {
            info!(request = %request_id, chars = o.raw.len(), cancelled = o.cancelled, "narrative finished");
            emitter.emit(&json!({
                "event": "narrative.done",
                "requestId": request_id,
                "raw": o.raw,
                "html": o.html,
                "cancelled": o.cancelled,
            }));
        }
        Err(e) => {
            warn!(request = %request_id, error = ?e, "narrative failed");
            emitter.emit(&json!({
                "event": "narrative.error",
                "requestId": request_id,
                "error": { "code": "ai_request_failed", "message": format!("{e:#}") },
            }));
        }
    }
}

fn start_narrative(
    state: &mut AppState,
    req: &Request,
    prompt: fn(&AppState, &Request) -> Result<Vec<ChatMessage>, HandlerErr>,
    tune: fn(ChatSettings) -> ChatSettings,
) -> Result<serde_json::Value, HandlerErr> {
    let Some(chat) = state.chat.clone() else {
        return Err(HandlerErr::new(
            "ai_unconfigured",
            "no chat API key configured (set GROQ_API_KEY)",
        ));
    };
    if state.narratives.is_running(&req.id) {
        return Err(HandlerErr::bad_params("a narrative with this id is already streaming")
            .with_details(json!({ "requestId": req.id })));
    }
    let messages = prompt(state, req)?;
    let settings = tune(load_chat_settings(state.db.as_ref()));

    let cancel = state.narratives.register(&req.id);
    let request_id = req.id.clone();
    let emitter = state.emitter.clone();
    let registry = state.narratives.clone();
    state.after_response(move || {
        let thread_registry = registry.clone();
        let thread_emitter = emitter.clone();
        let thread_id = request_id.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("narrative-{}", request_id))
            .spawn(move || {
                run_worker(
                    chat,
                    messages,
                    settings,
                    cancel,
                    thread_id,
                    thread_emitter,
                    thread_registry,
                )
            });
        match spawned {
            Ok(handle) => registry.track(handle),
            Err(e) => {
                warn!(request = %request_id, error = %e, "failed to spawn narrative worker");
                registry.finish(&request_id);
                emitter.emit(&json!({
                    "event": "narrative.error",
                    "requestId": request_id,
                    "error": { "code": "ai_request_failed", "message": e.to_string() },
                }));
            }
        }
    });

    Ok(json!({ "streaming": true, "requestId": req.id }))
}

fn narrative_cancel(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let request_id = required_str(req, "requestId")?;
    if !state.narratives.cancel(&request_id) {
        return Err(HandlerErr::not_found("narrative stream").with_details(json!({ "requestId": request_id })));
    }
    info!(request = %request_id, "narrative cancel requested");
    Ok(json!({ "cancelled": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "ai.config.get" => ai_config_get(state),
        "ai.config.update" => ai_config_update(state, req),
        "analytics.narrative.subject" => start_narrative(state, req, subject_prompt, |s| s),
        "analytics.narrative.section" => start_narrative(state, req, section_prompt, |s| s),
        "analytics.narrative.student" => {
            start_narrative(state, req, student_prompt, ChatSettings::for_student_feedback)
        }
        "narrative.cancel" => narrative_cancel(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::narrative::FragmentIter;
    use std::io::Write;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("buf lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn lines(&self) -> Vec<serde_json::Value> {
            let bytes = self.0.lock().expect("buf lock").clone();
            String::from_utf8(bytes)
                .expect("utf8")
                .lines()
                .map(|l| serde_json::from_str(l).expect("json line"))
                .collect()
        }
    }

    struct Fixed(Vec<&'static str>);

    impl ChatClient for Fixed {
        fn stream_chat(&self, messages: &[ChatMessage], _settings: &ChatSettings) -> anyhow::Result<FragmentIter> {
            assert!(messages[1].content.contains("Excellent (90-100): 2"));
            let items: Vec<anyhow::Result<String>> = self.0.iter().map(|s| Ok(s.to_string())).collect();
            Ok(Box::new(items.into_iter()))
        }
    }

    /// Remembers what it was asked and replies with one fragment.
    #[derive(Default)]
    struct Recording(Mutex<Option<(Vec<ChatMessage>, ChatSettings)>>);

    impl ChatClient for Recording {
        fn stream_chat(&self, messages: &[ChatMessage], settings: &ChatSettings) -> anyhow::Result<FragmentIter> {
            *self.0.lock().expect("recording lock") = Some((messages.to_vec(), settings.clone()));
            Ok(Box::new(vec![Ok("Practise fractions.".to_string())].into_iter()))
        }
    }

    fn wait_for_terminal(buf: &SharedBuf, id: &str) -> Vec<serde_json::Value> {
        for _ in 0..300 {
            let lines = buf.lines();
            let finished = lines.iter().any(|l| {
                l["requestId"] == json!(id)
                    && (l["event"] == json!("narrative.done") || l["event"] == json!("narrative.error"))
            });
            if finished {
                return lines;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("no terminal event for {}", id);
    }

    fn request(id: &str, method: &str, params: serde_json::Value) -> Request {
        Request {
            id: id.to_string(),
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn section_narrative_streams_fragments_after_ack() {
        let buf = SharedBuf::default();
        let mut state = AppState::new(
            Some(Arc::new(Fixed(vec!["**Group** work", "\nhelps."])) as Arc<dyn ChatClient>),
            Emitter::new(buf.clone()),
        );
        let req = request(
            "n1",
            "analytics.narrative.section",
            json!({
                "sectionName": "8-Mabini",
                "distribution": {
                    "excellentCount": 2, "goodCount": 4, "averageCount": 1, "failingCount": 3
                }
            }),
        );
        let ack = try_handle(&mut state, &req).expect("handled");
        assert_eq!(ack["ok"], json!(true));
        assert_eq!(ack["result"]["streaming"], json!(true));
        assert!(state.narratives.is_running("n1"));

        state.emitter.emit(&ack);
        state.run_deferred();
        let lines = wait_for_terminal(&buf, "n1");
        assert!(!state.narratives.is_running("n1"));
        state.narratives.join_workers();

        assert_eq!(lines[0]["id"], json!("n1"));
        let fragments: Vec<&serde_json::Value> = lines
            .iter()
            .filter(|l| l["event"] == json!("narrative.fragment"))
            .collect();
        assert_eq!(fragments.len(), 2);
        let done = lines
            .iter()
            .find(|l| l["event"] == json!("narrative.done"))
            .expect("done event");
        assert_eq!(done["raw"], json!("**Group** work\nhelps."));
        assert_eq!(done["html"], json!("<strong>Group</strong> work<br>helps."));
        assert_eq!(done["cancelled"], json!(false));
    }

    #[test]
    fn student_narrative_uses_feedback_sampling_and_named_topics() {
        let buf = SharedBuf::default();
        let client = Arc::new(Recording::default());
        let mut state = AppState::new(Some(client.clone() as Arc<dyn ChatClient>), Emitter::new(buf.clone()));
        let req = request(
            "s1",
            "analytics.narrative.student",
            json!({
                "studentName": "Rico Tan",
                "topicNames": ["Fractions", "", "Decimals"],
                "record": { "topic1": 12, "wwMax1": 20, "qa1": 30, "qaMax1": 50 }
            }),
        );
        let ack = try_handle(&mut state, &req).expect("handled");
        assert_eq!(ack["ok"], json!(true), "{}", ack);
        state.emitter.emit(&ack);
        state.run_deferred();
        let lines = wait_for_terminal(&buf, "s1");
        state.narratives.join_workers();

        let done = lines
            .iter()
            .find(|l| l["event"] == json!("narrative.done"))
            .expect("done event");
        assert_eq!(done["raw"], json!("Practise fractions."));

        let (messages, settings) = client.0.lock().expect("recording lock").clone().expect("chat called");
        assert_eq!(settings.model, crate::narrative::DEFAULT_MODEL);
        assert_eq!(settings.temperature, 0.6);
        assert_eq!(settings.max_tokens, 600);
        assert_eq!(settings.top_p, Some(0.95));
        assert!(messages[1].content.contains(r#"["Fractions","Decimals"]"#));
        assert!(messages[1].content.contains("Rico Tan"));
    }

    #[test]
    fn student_narrative_rejects_malformed_input() {
        let mut state = AppState::new(
            Some(Arc::new(Recording::default()) as Arc<dyn ChatClient>),
            Emitter::new(SharedBuf::default()),
        );
        let bad_score = request(
            "s2",
            "analytics.narrative.student",
            json!({ "studentName": "Ana", "record": { "pt1": "high" } }),
        );
        let resp = try_handle(&mut state, &bad_score).expect("handled");
        assert_eq!(resp["error"]["code"], json!("invalid_input"));

        let bad_topics = request(
            "s3",
            "analytics.narrative.student",
            json!({ "studentName": "Ana", "record": {}, "topicNames": [1, 2] }),
        );
        let resp = try_handle(&mut state, &bad_topics).expect("handled");
        assert_eq!(resp["error"]["code"], json!("bad_params"));

        let no_workspace = request("s4", "analytics.narrative.student", json!({ "recordId": "r1" }));
        let resp = try_handle(&mut state, &no_workspace).expect("handled");
        assert_eq!(resp["error"]["code"], json!("no_workspace"));
        assert!(!state.narratives.is_running("s2"));
    }

    #[test]
    fn narrative_without_client_is_unconfigured() {
        let mut state = AppState::new(None, Emitter::new(SharedBuf::default()));
        let req = request(
            "n2",
            "analytics.narrative.subject",
            json!({
                "subjectName": "Science",
                "summary": { "passingCount": 1, "failingCount": 0, "averageGrade": 90.0 }
            }),
        );
        let resp = try_handle(&mut state, &req).expect("handled");
        assert_eq!(resp["error"]["code"], json!("ai_unconfigured"));
    }

    #[test]
    fn cancel_flips_registered_token() {
        let state = AppState::new(None, Emitter::new(SharedBuf::default()));
        let token = state.narratives.register("n3");
        let resp = narrative_cancel(&state, &request("c1", "narrative.cancel", json!({ "requestId": "n3" })))
            .expect("cancel");
        assert_eq!(resp["cancelled"], json!(true));
        assert!(token.is_cancelled());

        let missing = narrative_cancel(&state, &request("c2", "narrative.cancel", json!({ "requestId": "nope" })))
            .expect_err("unknown id");
        assert_eq!(missing.code, "not_found");
    }
}
