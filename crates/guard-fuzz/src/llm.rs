//! The LLM boundary: a synchronous text-in/text-out contract.
//!
//! Transport retries belong to this layer; parsing and semantics do not.

use std::{
    io::Write,
    process::{Command, Stdio},
    time::Duration,
};

use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM transport failure: {0}")]
    Transport(String),
    #[error("LLM returned an empty completion")]
    EmptyCompletion,
}

pub trait LlmClient {
    fn get_completion(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError>;
}

/// Retries transport failures with exponential backoff.
#[derive(Debug)]
pub struct Retrying<C> {
    inner: C,
    max_attempts: u32,
    base_delay: Duration,
}

impl<C> Retrying<C> {
    pub fn new(inner: C, max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }
}

impl<C: LlmClient> LlmClient for Retrying<C> {
    fn get_completion(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError> {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match self.inner.get_completion(system_prompt, user_prompt) {
                Ok(completion) => return Ok(completion),
                Err(LlmError::Transport(message)) if attempt < self.max_attempts => {
                    warn!(attempt, %message, "LLM call failed, backing off");
                    std::thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

/// Shells out to a user-supplied command that reads the user prompt on stdin
/// and writes the completion to stdout. The system prompt is passed in the
/// `GUARD_FUZZ_SYSTEM_PROMPT` environment variable.
#[derive(Debug, Clone)]
pub struct CommandLlm {
    command: String,
    args: Vec<String>,
}

impl CommandLlm {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

impl LlmClient for CommandLlm {
    fn get_completion(&self, system_prompt: &str, user_prompt: &str) -> Result<String, LlmError> {
        let transport = |error: std::io::Error| LlmError::Transport(error.to_string());

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .env("GUARD_FUZZ_SYSTEM_PROMPT", system_prompt)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(transport)?;
        child
            .stdin
            .take()
            .expect("stdin was set to piped")
            .write_all(user_prompt.as_bytes())
            .map_err(transport)?;

        let output = child.wait_with_output().map_err(transport)?;
        if !output.status.success() {
            return Err(LlmError::Transport(format!(
                "completion command exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr),
            )));
        }
        let completion = String::from_utf8_lossy(&output.stdout).into_owned();
        if completion.trim().is_empty() {
            return Err(LlmError::EmptyCompletion);
        }
        debug!(bytes = completion.len(), "Completion received");
        Ok(completion)
    }
}

/// Test double that replays a fixed sequence of completions.
#[derive(Debug, Default)]
pub struct ScriptedLlm {
    responses: std::cell::RefCell<std::collections::VecDeque<String>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: std::cell::RefCell::new(
                responses.into_iter().map(Into::into).collect(),
            ),
        }
    }
}

impl LlmClient for ScriptedLlm {
    fn get_completion(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String, LlmError> {
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| LlmError::Transport("scripted responses exhausted".to_owned()))
    }
}
