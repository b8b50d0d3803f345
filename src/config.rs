use clap::Parser;
use std::path::PathBuf;

use crate::narrative::DEFAULT_CHAT_ENDPOINT;

/// Gradebook sidecar: newline-delimited JSON requests on stdin, responses
/// and stream events on stdout, logs on stderr.
#[derive(Debug, Parser)]
#[command(name = "gradebookd", version, about)]
pub struct Config {
    /// Workspace directory to open at startup.
    #[arg(long, env = "GRADEBOOK_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// API key for the chat-completion endpoint. Narrative requests are
    /// rejected when unset.
    #[arg(long, env = "GROQ_API_KEY", hide_env_values = true)]
    pub groq_api_key: Option<String>,

    /// OpenAI-compatible chat-completion endpoint.
    #[arg(long, env = "GRADEBOOK_CHAT_ENDPOINT", default_value = DEFAULT_CHAT_ENDPOINT)]
    pub chat_endpoint: String,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, env = "GRADEBOOK_LOG", default_value = "info")]
    pub log_filter: String,
}
