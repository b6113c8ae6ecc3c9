//! Decision prompts
//!
//! `TerminalPrompt` asks the operator on stdin; `FixedPrompt` answers the same
//! way every time (for unattended runs).

use super::events::{Decision, DecisionRequest};
use super::messages::msg_decision_prompt;
use super::traits::DecisionPrompt;
use async_trait::async_trait;
use std::io::{BufRead, Write};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Map a typed answer to a decision. Anything but yes/no is a cancel.
pub fn parse_answer(input: &str) -> Decision {
    match input.trim().to_lowercase().as_str() {
        "y" | "yes" => Decision::Confirm,
        "n" | "no" => Decision::Reject,
        _ => Decision::CancelNoAnswer,
    }
}

/// Interactive prompt on the controlling terminal
///
/// One reader thread owns stdin for the life of the prompt and forwards
/// lines over a channel, so an abandoned prompt (timed out, or its session
/// cancelled) never keeps a read pending that would swallow the next answer.
/// The thread is detached and does not hold up runtime shutdown.
///
/// Prompts are serialised: a second handshake waits for the first answer
/// instead of interleaving on stdin. Lines typed after a prompt was abandoned
/// and before the next one is shown are discarded.
pub struct TerminalPrompt {
    input: Mutex<PromptInput>,
}

struct PromptInput {
    lines: mpsc::UnboundedReceiver<String>,
    /// The previous prompt went away without reading an answer
    abandoned: bool,
}

impl TerminalPrompt {
    /// Prompt on the process stdin
    pub fn new() -> Self {
        Self::with_reader(std::io::BufReader::new(std::io::stdin()))
    }

    /// Prompt on any line source
    pub fn with_reader<R>(reader: R) -> Self
    where
        R: BufRead + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();

        let spawned = std::thread::Builder::new()
            .name("courier-stdin".to_string())
            .spawn(move || {
                for line in reader.lines() {
                    match line {
                        Ok(line) => {
                            if tx.send(line).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Failed to read answer: {}", e);
                            break;
                        }
                    }
                }
                debug!("Prompt input closed");
            });

        // Without a reader every prompt sees a closed input and cancels.
        if let Err(e) = spawned {
            warn!("Failed to start prompt reader: {}", e);
        }

        Self::from_lines(rx)
    }

    fn from_lines(lines: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            input: Mutex::new(PromptInput {
                lines,
                abandoned: false,
            }),
        }
    }
}

impl Default for TerminalPrompt {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DecisionPrompt for TerminalPrompt {
    async fn ask(&self, request: &DecisionRequest) -> Decision {
        let mut input = self.input.lock().await;

        if input.abandoned {
            let mut stale = 0;
            while input.lines.try_recv().is_ok() {
                stale += 1;
            }
            if stale > 0 {
                debug!(
                    transaction_id = %request.transaction_id,
                    stale,
                    "Discarded answers to an earlier prompt"
                );
            }
        }

        print!("{}", msg_decision_prompt(request));
        let _ = std::io::stdout().flush();

        // Cleared only once a line is read; a dropped ask leaves it set.
        input.abandoned = true;
        let line = input.lines.recv().await;
        input.abandoned = false;

        match line {
            Some(line) => parse_answer(&line),
            None => {
                warn!(transaction_id = %request.transaction_id, "stdin closed, cancelling");
                Decision::CancelNoAnswer
            }
        }
    }
}

/// Always gives the same answer
#[derive(Debug, Clone, Copy)]
pub struct FixedPrompt {
    decision: Decision,
}

impl FixedPrompt {
    pub fn new(decision: Decision) -> Self {
        Self { decision }
    }
}

#[async_trait]
impl DecisionPrompt for FixedPrompt {
    async fn ask(&self, _request: &DecisionRequest) -> Decision {
        self.decision
    }
}
