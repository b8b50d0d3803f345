//! AI narrative feedback over subject and section performance, and over a
//! single student's score record.
//!
//! Prompts are rendered from aggregate figures (or one record), sent to an OpenAI-compatible
//! chat-completion endpoint with `stream: true`, and the reply is pulled back
//! fragment by fragment. Formatting of the finished text is a separate pure
//! step ([`format_markup`]).

use crate::bands::{BandTally, SectionBand};
use crate::calc::ScoreRecord;
use anyhow::{anyhow, Context};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_CHAT_ENDPOINT: &str = "https://api.groq.com/openai/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gemma2-9b-it";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 300;

/// Sampling used for per-student feedback, which asks for a longer answer.
pub const STUDENT_TEMPERATURE: f64 = 0.6;
pub const STUDENT_MAX_TOKENS: u32 = 600;
pub const STUDENT_TOP_P: f64 = 0.95;

/// How often a waiting stream re-checks its cancel token.
const CANCEL_POLL: Duration = Duration::from_millis(50);

const SYSTEM_PROMPT_SUBJECT: &str = "You are an educational analytics expert. Provide concise suggestions for improving subject performance.";
const SYSTEM_PROMPT_SECTION: &str = "You are an educational analytics expert. Provide concise suggestions for improving section performance.";
const SYSTEM_PROMPT_STUDENT: &str = "Analyze this student's performance data to identify which specific topics they are struggling with. Focus on the lowest scores and suggest targeted strategies to help improve in those specific areas. Use the actual topic names in your feedback, not just topic numbers. Keep your response under 500 words.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Per-workspace model selection, stored under the `ai.chat` setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            top_p: None,
        }
    }
}

impl ChatSettings {
    /// Keeps the configured model; sampling switches to the student-feedback
    /// values.
    pub fn for_student_feedback(self) -> Self {
        Self {
            temperature: STUDENT_TEMPERATURE,
            max_tokens: STUDENT_MAX_TOKENS,
            top_p: Some(STUDENT_TOP_P),
            ..self
        }
    }
}

pub type FragmentIter = Box<dyn Iterator<Item = anyhow::Result<String>> + Send>;

pub trait ChatClient: Send + Sync {
    /// Starts a streamed completion. Fragments are produced as the caller
    /// pulls them.
    fn stream_chat(&self, messages: &[ChatMessage], settings: &ChatSettings) -> anyhow::Result<FragmentIter>;
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Streaming chat client for Groq (or any OpenAI-compatible endpoint).
pub struct GroqClient {
    http: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
}

impl GroqClient {
    pub fn new(api_key: String, endpoint: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_CHAT_ENDPOINT.to_string()),
            api_key,
        })
    }
}

impl ChatClient for GroqClient {
    fn stream_chat(&self, messages: &[ChatMessage], settings: &ChatSettings) -> anyhow::Result<FragmentIter> {
        let body = CompletionRequest {
            model: &settings.model,
            messages,
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            top_p: settings.top_p,
            stream: true,
        };
        debug!(endpoint = %self.endpoint, model = %settings.model, "starting chat completion");
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .context("chat completion request failed")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(anyhow!("chat completion returned {status}: {text}"));
        }
        Ok(Box::new(SseFragments::new(std::io::BufReader::new(response))))
    }
}

/// Pulls `data:` lines from a server-sent-event body and yields the delta
/// text of each chunk until `[DONE]` or end of stream.
pub struct SseFragments<R> {
    reader: R,
    done: bool,
}

impl<R: BufRead> SseFragments<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for SseFragments<R> {
    type Item = anyhow::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = String::new();
        while !self.done {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    self.done = true;
                    return Some(Err(anyhow!(e).context("read chat stream")));
                }
            }

            let Some(data) = line.trim_end().strip_prefix("data:") else {
                // Blank separators, comments and event/id lines.
                continue;
            };
            let data = data.trim();
            if data == "[DONE]" {
                self.done = true;
                return None;
            }

            let chunk: CompletionChunk = match serde_json::from_str(data) {
                Ok(c) => c,
                Err(e) => {
                    self.done = true;
                    return Some(Err(anyhow!(e).context("parse chat stream chunk")));
                }
            };
            if let Some(error) = chunk.error {
                self.done = true;
                return Some(Err(anyhow!("chat stream error: {error}")));
            }
            let content = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta.content)
                .unwrap_or_default();
            if content.is_empty() {
                continue;
            }
            return Some(Ok(content));
        }
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fragment stream that ends once its token is cancelled, even while the
/// upstream body is stalled.
///
/// The upstream iterator is drained on its own reader thread; `next` waits on
/// the channel and re-checks the token every `CANCEL_POLL`. A reader left
/// blocked after cancellation exits when its read returns and the send fails.
pub struct NarrativeStream {
    rx: Receiver<anyhow::Result<String>>,
    cancel: CancelToken,
}

impl NarrativeStream {
    pub fn new(inner: FragmentIter, cancel: CancelToken) -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("narrative-reader".to_string())
            .spawn(move || {
                for item in inner {
                    if tx.send(item).is_err() {
                        break;
                    }
                }
            })
            .context("spawn narrative reader")?;
        Ok(Self { rx, cancel })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Iterator for NarrativeStream {
    type Item = anyhow::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            match self.rx.recv_timeout(CANCEL_POLL) {
                Ok(item) => return Some(item),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NarrativeOutcome {
    pub raw: String,
    pub html: String,
    pub cancelled: bool,
}

/// Drives a stream to completion (or cancellation), handing every fragment
/// to `on_fragment` before it is appended.
pub fn collect_narrative(
    mut stream: NarrativeStream,
    mut on_fragment: impl FnMut(&str),
) -> anyhow::Result<NarrativeOutcome> {
    let mut raw = String::new();
    for fragment in stream.by_ref() {
        let fragment = fragment?;
        on_fragment(&fragment);
        raw.push_str(&fragment);
    }
    let cancelled = stream.is_cancelled();
    if cancelled {
        warn!(chars = raw.len(), "narrative stream cancelled");
    }
    Ok(NarrativeOutcome {
        html: format_markup(&raw),
        raw,
        cancelled,
    })
}

static BOLD_ITALIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*\*(.*?)\*\*\*").expect("valid regex"));
static BOLD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*(.*?)\*\*").expect("valid regex"));
static ITALIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*(.*?)\*").expect("valid regex"));

/// Newlines to `<br>`, then `***x***`, `**x**` and `*x*` to strong/em markup.
pub fn format_markup(text: &str) -> String {
    let text = text.replace('\n', "<br>");
    let text = BOLD_ITALIC.replace_all(&text, "<strong><em>${1}</em></strong>");
    let text = BOLD.replace_all(&text, "<strong>${1}</strong>");
    ITALIC.replace_all(&text, "<em>${1}</em>").into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectSummary {
    pub passing_count: usize,
    pub failing_count: usize,
    pub average_grade: f64,
}

pub fn subject_messages(summary: &SubjectSummary, subject_name: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(SYSTEM_PROMPT_SUBJECT),
        ChatMessage::user(format!(
            "Analyze this subject performance data for {subject_name}:\n\
             Passing students: {}\n\
             Failing students: {}\n\
             Class average: {}\n\n\
             Provide specific teaching strategies and interventions in 200 words.",
            summary.passing_count, summary.failing_count, summary.average_grade
        )),
    ]
}

pub fn section_messages(distribution: &BandTally, section_name: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(SYSTEM_PROMPT_SECTION),
        ChatMessage::user(format!(
            "Analyze this section performance distribution for {section_name}:\n\
             {}: {}\n\
             {}: {}\n\
             {}: {}\n\
             {}: {}\n\n\
             Provide specific class management strategies and differentiated learning approaches in 200 words.",
            SectionBand::Excellent.label(),
            distribution.excellent,
            SectionBand::Good.label(),
            distribution.good,
            SectionBand::Average.label(),
            distribution.average,
            SectionBand::Failing.label(),
            distribution.failing
        )),
    ]
}

/// Feedback on one student's record. `topic_names` label topic1..topic5 in
/// order; blank names are dropped.
pub fn student_messages(record: &ScoreRecord, student_name: &str, topic_names: &[String]) -> Vec<ChatMessage> {
    let topics: Vec<&str> = topic_names
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect();
    let topics_json = serde_json::to_string(&topics).unwrap_or_else(|_| "[]".to_string());
    vec![
        ChatMessage::system(SYSTEM_PROMPT_STUDENT),
        ChatMessage::user(format!(
            "The actual topic names for topic1 through topic5 are: {topics_json}.\n\
             WW = written works (these are the named topics), PT = performance tasks (pt1 through pt10), \
             and QA = quality assessment (qa1).\n\
             Scores below 75 are considered failing, 75-80 are borderline, and above 80 are good.\n\
             Identify which specific named topics have the lowest scores and suggest concrete improvement \
             strategies tailored to those topics.\n\
             Always refer to topics by their actual names (not as topic1, topic2, etc.) when providing advice.\n\
             Student: {student_name}.\n\
             Record: {}",
            record.to_json()
        )),
    ]
}
