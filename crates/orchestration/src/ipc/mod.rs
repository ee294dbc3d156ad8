//! Named-pipe control/status channel.
//!
//! Each worker owns two FIFOs: `W-control` (messages in) and `W-status`
//! (replies out). Pipes are a latency shortcut only; a task file is always
//! the durable path, and a claim is always decided by rename.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::{ensure_fifo, send, send_blocking, send_timeout, PipeChannel};

/// One line read from a control pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// `ping` / `status`: reply with the current heartbeat on the status pipe.
    Ping,
    /// `wake` / `process`: run a reconciliation pass now.
    Wake,
    /// Anything else is handed to the activation sink.
    Activate(String),
}

impl ControlMessage {
    pub fn parse(line: &str) -> Option<Self> {
        let text = line.trim();
        if text.is_empty() {
            return None;
        }
        let message = match text.to_ascii_lowercase().as_str() {
            "ping" | "status" => ControlMessage::Ping,
            "wake" | "process" => ControlMessage::Wake,
            _ => ControlMessage::Activate(text.to_string()),
        };
        Some(message)
    }
}
