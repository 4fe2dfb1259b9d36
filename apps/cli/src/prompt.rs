use std::io::{self, BufRead, IsTerminal, Write};

use ingest::{Decider, Decision};

/// How registry changes that need consent are answered for this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliDecider {
    Allow,
    Deny,
    Prompt,
}

impl CliDecider {
    pub fn from_flags(yes: bool, no_input: bool) -> Self {
        if yes {
            CliDecider::Allow
        } else if no_input {
            CliDecider::Deny
        } else {
            CliDecider::Prompt
        }
    }
}

impl Decider for CliDecider {
    fn decide(&self, decision: &Decision<'_>) -> bool {
        match self {
            CliDecider::Allow => true,
            CliDecider::Deny => false,
            CliDecider::Prompt => ask(decision),
        }
    }
}

fn ask(decision: &Decision<'_>) -> bool {
    let stdin = io::stdin();
    if !stdin.is_terminal() {
        tracing::warn!(
            decision = %decision.describe(),
            "stdin is not a terminal; declining"
        );
        return false;
    }
    let mut stderr = io::stderr();
    let _ = write!(stderr, "{}? [y/N] ", decision.describe());
    let _ = stderr.flush();
    let mut answer = String::new();
    if stdin.lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
