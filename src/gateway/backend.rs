// Tool backends - the seam between the gateway and the external tool
//
// The external code-generation tool is modeled as a capability interface so
// the gateway and engine stay ignorant of transport details. `CliBackend`
// binds it to a subprocess in print mode with JSON output.

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::types::{Capability, TokenUsage, ToolFailure, ToolOutput, ToolRequest};

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Issue one call to the tool. The gateway owns the deadline; a backend
    /// future dropped at the deadline must not leave a child process behind.
    async fn run(&self, request: &ToolRequest) -> Result<ToolOutput, ToolFailure>;

    /// Whether the tool is installed and responding.
    async fn health_check(&self) -> bool;
}

/// JSON envelope printed by the CLI tool with `--output-format json`.
#[derive(Debug, Deserialize)]
struct CliEnvelope {
    #[serde(default)]
    result: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    usage: Option<CliUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Subprocess adapter for the interactive code-generation CLI.
pub struct CliBackend {
    binary: String,
}

impl CliBackend {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn build_command(&self, request: &ToolRequest) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p")
            .arg(&request.prompt)
            .arg("--output-format")
            .arg("json");

        if let Some(native_id) = &request.native_session_id {
            cmd.arg("--resume").arg(native_id);
        }

        if !request.capabilities.is_empty() {
            let tools: Vec<&str> = request
                .capabilities
                .iter()
                .map(Capability::as_str)
                .collect();
            cmd.arg("--allowedTools").arg(tools.join(","));
        }

        cmd.arg("--model").arg(&request.tier);
        cmd.current_dir(&request.working_dir);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn parse_output(request: &ToolRequest, stdout: &[u8]) -> ToolOutput {
        let raw = String::from_utf8_lossy(stdout).into_owned();
        match serde_json::from_str::<CliEnvelope>(&raw) {
            Ok(envelope) => {
                let usage = envelope.usage.unwrap_or_default();
                ToolOutput {
                    content: envelope.result,
                    native_session_id: envelope
                        .session_id
                        .or_else(|| request.native_session_id.clone()),
                    usage: TokenUsage {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        total_tokens: usage.input_tokens + usage.output_tokens,
                    },
                }
            }
            // Not valid JSON - treat the raw output as plain text
            Err(_) => ToolOutput {
                content: raw,
                native_session_id: request.native_session_id.clone(),
                usage: TokenUsage::default(),
            },
        }
    }
}

#[async_trait]
impl ToolBackend for CliBackend {
    async fn run(&self, request: &ToolRequest) -> Result<ToolOutput, ToolFailure> {
        tracing::debug!(
            binary = %self.binary,
            tier = %request.tier,
            prompt_len = request.prompt.len(),
            "spawning tool process"
        );

        let output = self
            .build_command(request)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    ToolFailure::Unavailable(format!("binary '{}' not found", self.binary))
                }
                _ => ToolFailure::Unavailable(format!("failed to spawn '{}': {}", self.binary, e)),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let diagnostic = if stderr.trim().is_empty() {
                format!("exit code {}", output.status.code().unwrap_or(-1))
            } else {
                stderr.trim().to_string()
            };
            return Err(ToolFailure::Rejected(diagnostic));
        }

        Ok(Self::parse_output(request, &output.stdout))
    }

    async fn health_check(&self) -> bool {
        let child = Command::new(&self.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        matches!(
            tokio::time::timeout(VERSION_CHECK_TIMEOUT, child).await,
            Ok(Ok(status)) if status.success()
        )
    }
}

// ---------------------------------------------------------------------------
// Scripted backend - deterministic replacement used by the test suite
// ---------------------------------------------------------------------------

/// One step in a scripted run.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    Reply(ToolOutput),
    Fail(ToolFailure),
    /// Never completes; exercises the gateway's timeout handling.
    Hang,
}

/// A [`ToolBackend`] that replays a fixed script. Each call consumes the next
/// step; an exhausted script reports the tool as unavailable.
pub struct ScriptedBackend {
    steps: std::sync::Mutex<std::collections::VecDeque<ScriptedStep>>,
    repeat: Option<ToolOutput>,
    calls: std::sync::atomic::AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(steps: Vec<ScriptedStep>) -> Self {
        Self {
            steps: std::sync::Mutex::new(steps.into()),
            repeat: None,
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// A backend that returns the same reply forever.
    pub fn repeating(output: ToolOutput) -> Self {
        Self {
            steps: std::sync::Mutex::new(std::collections::VecDeque::new()),
            repeat: Some(output),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Convenience reply carrying only text content.
    pub fn reply(content: &str) -> ScriptedStep {
        ScriptedStep::Reply(ToolOutput {
            content: content.to_string(),
            native_session_id: None,
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 20,
                total_tokens: 30,
            },
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolBackend for ScriptedBackend {
    async fn run(&self, _request: &ToolRequest) -> Result<ToolOutput, ToolFailure> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let step = self.steps.lock().expect("script lock").pop_front();
        match step {
            Some(ScriptedStep::Reply(output)) => Ok(output),
            Some(ScriptedStep::Fail(failure)) => Err(failure),
            Some(ScriptedStep::Hang) => {
                tokio::time::sleep(Duration::from_secs(86_400)).await;
                Err(ToolFailure::Unavailable("hang elapsed".to_string()))
            }
            None => match &self.repeat {
                Some(output) => Ok(output.clone()),
                None => Err(ToolFailure::Unavailable("script exhausted".to_string())),
            },
        }
    }

    async fn health_check(&self) -> bool {
        true
    }
}
