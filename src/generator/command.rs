//! Subprocess-backed generator
//!
//! Runs `program args… --cookie-file <file> --label <label>` and reads the
//! alias from stdout. The cookie file is private to the call and removed
//! afterwards, even if the call is cancelled.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;

use super::{Artifact, GenerationError, Generator};
use crate::config::GeneratorSettings;
use crate::security::Sanitizer;
use crate::session::SessionRecord;

const EMAIL_MARKER: &str = "Generated email:";

// Status codes only count next to HTTP wording, never inside paths or line numbers
static AUTH_FAILURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:unauthori[sz]ed|unauthenticated|forbidden|not authenticated|authentication (?:failed|required))\b|\b(?:http(?:/[\d.]+)?|status(?: code)?|error|code)\W{0,3}(?:401|403)\b",
    )
    .expect("auth failure regex must be valid")
});

static RATE_LIMIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:too many requests|rate[ -]?limit(?:ed)?|throttled)\b|\b(?:http(?:/[\d.]+)?|status(?: code)?|error|code)\W{0,3}429\b",
    )
    .expect("rate limit regex must be valid")
});

/// Generator that shells out to an external tool
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl CommandGenerator {
    pub fn new(program: impl Into<String>, args: Vec<String>, working_dir: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir,
        }
    }

    pub fn from_settings(settings: &GeneratorSettings) -> Self {
        Self::new(
            settings.program.clone(),
            settings.args.clone(),
            settings.working_dir.clone(),
        )
    }

    fn write_cookie_file(
        &self,
        session: &SessionRecord,
    ) -> Result<tempfile::NamedTempFile, GenerationError> {
        let io_err = |e: std::io::Error| GenerationError::Unknown(format!("cookie file: {}", e));
        let mut file = tempfile::Builder::new()
            .prefix("cookie-bot-session-")
            .suffix(".json")
            .tempfile()
            .map_err(io_err)?;
        let content = serde_json::to_vec(&session.cookies)
            .map_err(|e| GenerationError::Unknown(format!("cookie file: {}", e)))?;
        file.write_all(&content).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        Ok(file)
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    async fn generate(
        &self,
        session: &SessionRecord,
        label: &str,
    ) -> Result<Artifact, GenerationError> {
        let cookie_file = self.write_cookie_file(session)?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--cookie-file")
            .arg(cookie_file.path())
            .arg("--label")
            .arg(label)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        tracing::debug!(profile = %session.profile_id, program = %self.program, label, "Running generator");
        let child = command
            .spawn()
            .map_err(|e| GenerationError::Unknown(format!("failed to spawn {}: {}", self.program, e)))?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| GenerationError::Unknown(format!("failed to read generator output: {}", e)))?;
        drop(cookie_file);

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            tracing::warn!(profile = %session.profile_id, code, "Generator exited with an error");
            return Err(classify_failure(code, &stderr, &stdout));
        }

        match parse_alias(&stdout) {
            Some(alias) => {
                tracing::debug!(profile = %session.profile_id, alias = %Sanitizer::mask_alias(&alias), "Generator produced alias");
                Ok(Artifact {
                    alias,
                    label: label.to_string(),
                })
            }
            None => Err(GenerationError::Unknown(
                "generator output contained no e-mail address".into(),
            )),
        }
    }
}

/// Finds the generated address in the tool's stdout
///
/// A `Generated email: <addr>` line wins; otherwise the first token that
/// looks like an address is used.
pub fn parse_alias(stdout: &str) -> Option<String> {
    let marked = stdout.lines().find_map(|line| {
        line.split_once(EMAIL_MARKER)
            .map(|(_, rest)| rest.trim().to_string())
            .filter(|addr| looks_like_address(addr))
    });
    marked.or_else(|| {
        stdout
            .split_whitespace()
            .map(|token| token.trim_matches(|c: char| matches!(c, '<' | '>' | ',' | '"' | '\'')))
            .find(|token| looks_like_address(token))
            .map(str::to_string)
    })
}

fn looks_like_address(candidate: &str) -> bool {
    match candidate.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !candidate.contains(char::is_whitespace)
        }
        None => false,
    }
}

/// Maps a failed run onto a [`GenerationError`]
pub fn classify_failure(code: i32, stderr: &str, stdout: &str) -> GenerationError {
    let text = format!("{}\n{}", stderr, stdout);

    if AUTH_FAILURE.is_match(&text) {
        GenerationError::AuthRejected
    } else if RATE_LIMIT.is_match(&text) {
        GenerationError::RateLimited
    } else {
        let detail = stderr.trim().lines().last().unwrap_or("no output");
        GenerationError::Unknown(format!("exit code {}: {}", code, detail))
    }
}
