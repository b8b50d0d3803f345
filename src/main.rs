mod bands;
mod calc;
mod config;
mod db;
mod ipc;
mod narrative;

use clap::Parser;
use std::io::{self, BufRead};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging(default_filter: &str) {
    // stdout carries the protocol; logs go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();
}

fn main() {
    let _ = dotenvy::dotenv();
    let cfg = config::Config::parse();
    init_logging(&cfg.log_filter);

    let chat: Option<Arc<dyn narrative::ChatClient>> = match cfg.groq_api_key.clone() {
        Some(key) if !key.trim().is_empty() => {
            match narrative::GroqClient::new(key, Some(cfg.chat_endpoint.clone())) {
                Ok(c) => Some(Arc::new(c)),
                Err(e) => {
                    error!(error = ?e, "chat client unavailable");
                    None
                }
            }
        }
        _ => {
            info!("no chat API key; narrative requests disabled");
            None
        }
    };

    let mut state = ipc::AppState::new(chat, ipc::Emitter::stdout());
    if let Some(path) = cfg.workspace.clone() {
        if let Err(e) = ipc::select_workspace(&mut state, path) {
            warn!(error = ?e, "startup workspace could not be opened");
        }
    }

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "stdin closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to reply to.
                warn!(error = %e, "unparseable request line");
                state.emitter.emit(&ipc::err("", "bad_json", e.to_string(), None));
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        state.emitter.emit(&resp);
        state.run_deferred();
    }
    // In-flight narratives still get to finish their event stream.
    state.narratives.join_workers();
    info!("shutting down");
}
