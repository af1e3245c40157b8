//! Concrete prompt capability: shell out to a configured program.
//!
//! The daemon itself has no UI. Whatever asks the human for the secret
//! (e.g. `systemd-ask-password`, a desktop dialog wrapper, a script) is
//! configured as a shell command and run per `GETPIN`. Masked input is
//! the prompt program's responsibility.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

use crate::connection::PinPrompt;

/// Runs a shell command to collect a secret.
///
/// The stored title and prompt are passed in the `PINENTRY_TITLE` and
/// `PINENTRY_PROMPT` environment variables. The first line of the
/// command's stdout is the secret; a non-zero exit status means the
/// human cancelled.
#[derive(Debug, Clone)]
pub struct CommandPrompt {
    program: String,
}

impl CommandPrompt {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl PinPrompt for CommandPrompt {
    async fn prompt_for_secret(
        &self,
        title: Option<&str>,
        prompt: Option<&str>,
    ) -> Result<Option<String>> {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c")
            .arg(&self.program)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(title) = title {
            cmd.env("PINENTRY_TITLE", title);
        }
        if let Some(prompt) = prompt {
            cmd.env("PINENTRY_PROMPT", prompt);
        }

        let output = cmd
            .output()
            .await
            .with_context(|| format!("failed to run prompt command `{}`", self.program))?;

        if !output.status.success() {
            log::debug!("prompt command exited with {}, treating as cancel", output.status);
            return Ok(None);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(Some(stdout.lines().next().unwrap_or("").to_string()))
    }
}
