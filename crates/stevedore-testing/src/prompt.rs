//! Scripted password prompt.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use stevedore_core::{PasswordPrompt, PromptError};

/// Password prompt that replays queued responses and records what it was
/// asked for. An exhausted queue answers with cancellation.
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    responses: Mutex<VecDeque<Result<String, PromptError>>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompt {
    /// Create a prompt with no queued responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a password to hand out on the next ask.
    pub fn push_password(&self, password: &str) {
        self.responses
            .lock()
            .expect("responses poisoned")
            .push_back(Ok(password.to_string()));
    }

    /// Queue a cancellation for the next ask.
    pub fn push_cancel(&self) {
        self.responses
            .lock()
            .expect("responses poisoned")
            .push_back(Err(PromptError::Cancelled));
    }

    /// Filenames the prompt was asked about, in order.
    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().expect("asked poisoned").clone()
    }
}

#[async_trait]
impl PasswordPrompt for ScriptedPrompt {
    async fn ask_for_password(&self, filename: &str) -> Result<String, PromptError> {
        self.asked
            .lock()
            .expect("asked poisoned")
            .push(filename.to_string());
        self.responses
            .lock()
            .expect("responses poisoned")
            .pop_front()
            .unwrap_or(Err(PromptError::Cancelled))
    }
}
