//! Operator checkpoints between reachability-affecting steps
//!
//! A gate blocks until the operator types the exact affirmative token.
//! Anything else, including end of input and read errors, is a refusal.
//! Without a terminal the gate refuses unless the run was started with an
//! explicit override.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{self, IsTerminal};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// The only response accepted as consent
pub const AFFIRMATIVE_TOKEN: &str = "yes";

/// Source of operator responses
#[async_trait]
pub trait Confirmer: Send {
    /// Whether an operator can answer at all
    fn is_interactive(&self) -> bool;

    /// Show `message` and read one line; `Ok(None)` at end of input
    async fn ask(&mut self, message: &str) -> io::Result<Option<String>>;
}

/// Prompts on stderr and reads stdin
#[derive(Debug, Default)]
pub struct StdinConfirmer;

#[async_trait]
impl Confirmer for StdinConfirmer {
    fn is_interactive(&self) -> bool {
        io::stdin().is_terminal()
    }

    async fn ask(&mut self, message: &str) -> io::Result<Option<String>> {
        let mut stderr = tokio::io::stderr();
        let prompt = format!(
            "\n{}\nType '{}' to continue, anything else aborts: ",
            message, AFFIRMATIVE_TOKEN
        );
        stderr.write_all(prompt.as_bytes()).await?;
        stderr.flush().await?;

        let mut line = String::new();
        let read = BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        Ok((read > 0).then_some(line))
    }
}

/// Answers from a fixed script; `None` entries simulate end of input
#[derive(Debug, Default)]
pub struct ScriptedConfirmer {
    interactive: bool,
    responses: VecDeque<Option<String>>,
    asked: Vec<String>,
}

impl ScriptedConfirmer {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            interactive: true,
            responses: responses.into_iter().map(|r| Some(r.into())).collect(),
            asked: Vec::new(),
        }
    }

    /// A confirmer with no terminal attached
    pub fn non_interactive() -> Self {
        Self::default()
    }

    /// Messages shown so far
    pub fn asked(&self) -> &[String] {
        &self.asked
    }
}

#[async_trait]
impl Confirmer for ScriptedConfirmer {
    fn is_interactive(&self) -> bool {
        self.interactive
    }

    async fn ask(&mut self, message: &str) -> io::Result<Option<String>> {
        self.asked.push(message.to_string());
        Ok(self.responses.pop_front().flatten())
    }
}

/// How a gate was resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Confirmation {
    /// The operator typed the token
    Affirmed,
    /// No terminal, but the run declared the non-interactive override
    Overridden,
    /// The operator answered something else
    Declined { response: String },
    /// No terminal and no override
    NoOperator,
    /// Input closed or unreadable
    InputClosed { detail: Option<String> },
}

impl Confirmation {
    pub fn granted(&self) -> bool {
        matches!(self, Confirmation::Affirmed | Confirmation::Overridden)
    }

    /// Why the gate stopped the run, for the summary
    pub fn reason(&self) -> String {
        match self {
            Confirmation::Affirmed => "confirmed by operator".to_string(),
            Confirmation::Overridden => "confirmed by non-interactive override".to_string(),
            Confirmation::Declined { response } => {
                format!("operator answered {:?} instead of '{}'", response, AFFIRMATIVE_TOKEN)
            }
            Confirmation::NoOperator => {
                "no terminal to confirm on and no non-interactive override declared".to_string()
            }
            Confirmation::InputClosed { detail: None } => "input closed before an answer".to_string(),
            Confirmation::InputClosed { detail: Some(d) } => format!("cannot read answer: {}", d),
        }
    }
}

/// Whether a raw response line is consent.
///
/// Only the line terminator is stripped; case and surrounding spaces matter.
pub fn is_affirmative(response: &str) -> bool {
    let line = response
        .strip_suffix('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .unwrap_or(response);
    line == AFFIRMATIVE_TOKEN
}

/// Blocking confirmation point
pub struct CheckpointGate {
    confirmer: Box<dyn Confirmer>,
    non_interactive_override: bool,
}

impl CheckpointGate {
    pub fn new(confirmer: Box<dyn Confirmer>, non_interactive_override: bool) -> Self {
        if non_interactive_override {
            tracing::warn!(
                "Non-interactive override declared: checkpoints will pass without a terminal"
            );
        }
        Self {
            confirmer,
            non_interactive_override,
        }
    }

    /// Gate on stdin, overridable when declared in the configuration
    pub fn stdin(non_interactive_override: bool) -> Self {
        Self::new(Box::new(StdinConfirmer), non_interactive_override)
    }

    pub async fn confirm(&mut self, message: &str) -> Confirmation {
        if !self.confirmer.is_interactive() {
            if self.non_interactive_override {
                tracing::warn!("Checkpoint passed by non-interactive override: {}", message);
                return Confirmation::Overridden;
            }
            return Confirmation::NoOperator;
        }

        match self.confirmer.ask(message).await {
            Ok(Some(response)) if is_affirmative(&response) => Confirmation::Affirmed,
            Ok(Some(response)) => Confirmation::Declined {
                response: response.trim_end_matches(['\r', '\n']).to_string(),
            },
            Ok(None) => Confirmation::InputClosed { detail: None },
            Err(e) => Confirmation::InputClosed {
                detail: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_exact_token_is_affirmative() {
        assert!(is_affirmative("yes"));
        assert!(is_affirmative("yes\n"));
        assert!(is_affirmative("yes\r\n"));
        for response in ["no", "y", "YES", "Yes", " yes", "yes ", "yes\n\n", "", "yess", "ok"] {
            assert!(!is_affirmative(response), "{:?} must not be consent", response);
        }
    }

    #[tokio::test]
    async fn test_gate_refuses_anything_but_yes() {
        let mut gate = CheckpointGate::new(Box::new(ScriptedConfirmer::new(["no\n"])), false);
        let decision = gate.confirm("still reachable?").await;
        assert!(!decision.granted());
        assert_eq!(
            decision,
            Confirmation::Declined {
                response: "no".into()
            }
        );

        let mut gate = CheckpointGate::new(Box::new(ScriptedConfirmer::new(["yes\n"])), false);
        assert_eq!(gate.confirm("still reachable?").await, Confirmation::Affirmed);
    }

    #[tokio::test]
    async fn test_end_of_input_is_refusal() {
        let mut gate = CheckpointGate::new(Box::new(ScriptedConfirmer::new(Vec::<String>::new())), false);
        let decision = gate.confirm("still reachable?").await;
        assert_eq!(decision, Confirmation::InputClosed { detail: None });
        assert!(!decision.granted());
    }

    #[tokio::test]
    async fn test_non_interactive_fails_closed_without_override() {
        let mut gate = CheckpointGate::new(Box::new(ScriptedConfirmer::non_interactive()), false);
        assert_eq!(gate.confirm("still reachable?").await, Confirmation::NoOperator);

        let mut gate = CheckpointGate::new(Box::new(ScriptedConfirmer::non_interactive()), true);
        assert_eq!(gate.confirm("still reachable?").await, Confirmation::Overridden);
    }

    #[test]
    fn test_confirmation_serializes_decision() {
        let json = serde_json::to_value(Confirmation::NoOperator).unwrap();
        assert_eq!(json["decision"], "no_operator");
    }
}
