//! Agent CLI execution with budget enforcement and usage attribution.
//!
//! The executor spawns the agent CLI as a child process, parses its single
//! JSON result document, and attributes cost and usage to the session and
//! the statistics store. It never returns `Err`: every failure folds into
//! an [`ExecutionOutcome`] with `success: false`, and failed attempts are
//! still counted in statistics.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SharedConfig;
use crate::store::sessions::SessionStore;
use crate::store::statistics::{RequestRecord, StatsStore};

/// Hard ceiling on a single agent CLI run.
const EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);

/// Options for one execution.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub prompt: String,
    pub project_path: String,
    pub model: String,
    pub session_id: Option<Uuid>,
    pub system_prompt: Option<String>,
    pub max_budget_usd: Option<f64>,
    pub allowed_tools: Option<Vec<String>>,
    pub disallowed_tools: Option<Vec<String>>,
    pub agent: Option<String>,
    pub mcp_config: Option<String>,
}

/// Token usage reported by the agent CLI.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Result of one execution attempt.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub budget_exceeded: bool,
    pub duration_ms: u64,
    pub cost_usd: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl ExecutionOutcome {
    fn failure(error: impl Into<String>, duration_ms: u64, session_id: Option<Uuid>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            duration_ms,
            session_id,
            ..Default::default()
        }
    }

    fn budget_stop(error: impl Into<String>, duration_ms: u64, session_id: Option<Uuid>) -> Self {
        Self {
            budget_exceeded: true,
            ..Self::failure(error, duration_ms, session_id)
        }
    }
}

/// Seam between the orchestration layer and the agent CLI.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, opts: ExecuteOptions) -> ExecutionOutcome;
}

/// The single JSON document the agent CLI prints on stdout.
#[derive(Debug, Deserialize)]
struct AgentReply {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    total_cost_usd: f64,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

enum SpawnFailure {
    Spawn(String),
    Timeout,
    NonZeroExit { code: Option<i32>, stderr: String },
    EmptyOutput { stderr: String },
    Parse { error: String, stdout: String },
}

impl SpawnFailure {
    fn message(&self) -> String {
        match self {
            Self::Spawn(error) => format!("Failed to spawn agent CLI: {error}"),
            Self::Timeout => format!(
                "Agent CLI timed out after {} seconds",
                EXECUTION_TIMEOUT.as_secs()
            ),
            Self::NonZeroExit { code, stderr } => {
                let code = code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
                if stderr.is_empty() {
                    format!("Agent CLI exited with code {code}")
                } else {
                    format!("Agent CLI exited with code {code}: {stderr}")
                }
            }
            Self::EmptyOutput { stderr } => {
                if stderr.is_empty() {
                    "Agent CLI produced no output".to_string()
                } else {
                    format!("Agent CLI produced no output; stderr: {stderr}")
                }
            }
            Self::Parse { error, stdout } => {
                format!("Failed to parse agent CLI output as JSON: {error}; output: {stdout}")
            }
        }
    }
}

/// Executor that runs the configured agent CLI binary.
pub struct CliExecutor {
    config: SharedConfig,
    sessions: Arc<SessionStore>,
    statistics: Arc<StatsStore>,
}

impl CliExecutor {
    pub fn new(
        config: SharedConfig,
        sessions: Arc<SessionStore>,
        statistics: Arc<StatsStore>,
    ) -> Self {
        Self {
            config,
            sessions,
            statistics,
        }
    }

    /// Build the child environment: inherit, prepend `toolchainBin` to
    /// `PATH`, and set `IS_SANDBOX=1` only under root-compatibility mode.
    fn build_env(
        toolchain_bin: Option<&str>,
        root_compatibility: bool,
    ) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars().collect();

        if let Some(bin) = toolchain_bin {
            let path = env.get("PATH").cloned().unwrap_or_default();
            let joined = if path.is_empty() {
                bin.to_string()
            } else {
                format!("{bin}:{path}")
            };
            env.insert("PATH".to_string(), joined);
        }

        if root_compatibility && crate::config::running_as_root() {
            env.insert("IS_SANDBOX".to_string(), "1".to_string());
        }

        env
    }

    /// Build the argv tail. The prompt occupies a single argv slot and is
    /// never shell-interpolated.
    fn build_args(opts: &ExecuteOptions) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            opts.prompt.clone(),
            "--output-format".to_string(),
            "json".to_string(),
        ];

        if !opts.model.is_empty() {
            args.push("--model".to_string());
            args.push(opts.model.clone());
        }
        if let Some(session_id) = opts.session_id {
            args.push("--session-id".to_string());
            args.push(session_id.to_string());
        }
        if let Some(system_prompt) = &opts.system_prompt {
            args.push("--system-prompt".to_string());
            args.push(system_prompt.clone());
        }
        if let Some(budget) = opts.max_budget_usd {
            args.push("--max-budget-usd".to_string());
            args.push(budget.to_string());
        }
        if let Some(tools) = &opts.allowed_tools {
            args.push("--allowed-tools".to_string());
            args.push(tools.join(","));
        }
        if let Some(tools) = &opts.disallowed_tools {
            args.push("--disallowed-tools".to_string());
            args.push(tools.join(","));
        }
        if let Some(agent) = &opts.agent {
            args.push("--agent".to_string());
            args.push(agent.clone());
        }
        if let Some(mcp_config) = &opts.mcp_config {
            args.push("--mcp-config".to_string());
            args.push(mcp_config.clone());
        }
        args.push("--allow-dangerously-skip-permissions".to_string());

        args
    }

    /// Spawn the agent CLI and parse its stdout as one JSON document.
    async fn run_agent(
        agent_path: &str,
        args: &[String],
        env: HashMap<String, String>,
        project_path: &str,
    ) -> Result<AgentReply, SpawnFailure> {
        let mut command = tokio::process::Command::new(agent_path);
        command
            .args(args)
            .env_clear()
            .envs(env)
            .current_dir(project_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|err| SpawnFailure::Spawn(err.to_string()))?;

        // The wait future owns the child; dropping it on timeout kills the
        // process via kill_on_drop.
        let output = match tokio::time::timeout(EXECUTION_TIMEOUT, child.wait_with_output()).await
        {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(SpawnFailure::Spawn(err.to_string())),
            Err(_) => return Err(SpawnFailure::Timeout),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            return Err(SpawnFailure::NonZeroExit {
                code: output.status.code(),
                stderr,
            });
        }
        if stdout.is_empty() {
            return Err(SpawnFailure::EmptyOutput { stderr });
        }

        serde_json::from_str(&stdout).map_err(|err| SpawnFailure::Parse {
            error: err.to_string(),
            stdout,
        })
    }

    async fn record_attempt(&self, record: RequestRecord) {
        if let Err(err) = self.statistics.record_request(record).await {
            tracing::warn!("Failed to record request statistics: {}", err);
        }
    }
}

#[async_trait]
impl Executor for CliExecutor {
    async fn execute(&self, opts: ExecuteOptions) -> ExecutionOutcome {
        let started = Instant::now();
        let elapsed_ms = |started: Instant| started.elapsed().as_millis() as u64;

        // Pre-budget check: a session already at or past its budget never
        // spawns and never touches statistics.
        if let (Some(session_id), Some(budget)) = (opts.session_id, opts.max_budget_usd) {
            match self.sessions.get(session_id).await {
                Ok(Some(session)) if session.total_cost_usd >= budget => {
                    return ExecutionOutcome::budget_stop(
                        format!(
                            "Session budget exceeded: {:.4} USD spent of {:.4} USD allowed",
                            session.total_cost_usd, budget
                        ),
                        elapsed_ms(started),
                        Some(session_id),
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    return ExecutionOutcome::failure(
                        format!("Failed to read session {session_id}: {err}"),
                        elapsed_ms(started),
                        Some(session_id),
                    );
                }
            }
        }

        let (agent_path, toolchain_bin, root_compatibility) = {
            let config = self.config.read().await;
            (
                config.agent_path.clone(),
                config.toolchain_bin.clone(),
                config.enable_root_compatibility,
            )
        };

        let Some(agent_path) = agent_path else {
            let outcome = ExecutionOutcome::failure(
                "No agent CLI configured; set agentPath in the configuration",
                elapsed_ms(started),
                opts.session_id,
            );
            self.record_attempt(RequestRecord {
                success: false,
                model: opts.model.clone(),
                ..Default::default()
            })
            .await;
            return outcome;
        };

        let env = Self::build_env(toolchain_bin.as_deref(), root_compatibility);
        let args = Self::build_args(&opts);

        let reply = match Self::run_agent(&agent_path, &args, env, &opts.project_path).await {
            Ok(reply) => reply,
            Err(failure) => {
                let message = failure.message();
                tracing::warn!("Agent execution failed: {}", message);
                self.record_attempt(RequestRecord {
                    success: false,
                    model: opts.model.clone(),
                    ..Default::default()
                })
                .await;
                return ExecutionOutcome::failure(message, elapsed_ms(started), opts.session_id);
            }
        };

        let cost = reply.total_cost_usd;
        let usage = reply.usage.unwrap_or_default();

        // Post-budget check: the run already happened, so the attempt is
        // recorded, but an over-budget session is not charged.
        if let (Some(session_id), Some(budget)) = (opts.session_id, opts.max_budget_usd) {
            let session_cost = match self.sessions.get(session_id).await {
                Ok(Some(session)) => session.total_cost_usd,
                _ => 0.0,
            };
            if session_cost + cost > budget {
                self.record_attempt(RequestRecord {
                    success: true,
                    model: opts.model.clone(),
                    cost_usd: cost,
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                })
                .await;
                return ExecutionOutcome::budget_stop(
                    format!(
                        "Session budget exceeded: run cost {:.4} USD would push the session \
                         past {:.4} USD",
                        cost, budget
                    ),
                    elapsed_ms(started),
                    Some(session_id),
                );
            }
        }

        self.record_attempt(RequestRecord {
            success: true,
            model: opts.model.clone(),
            cost_usd: cost,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        })
        .await;

        if let Some(session_id) = opts.session_id {
            if let Err(err) = self.sessions.add_cost(session_id, cost).await {
                tracing::warn!("Failed to add cost to session {}: {}", session_id, err);
            }
            if let Err(err) = self.sessions.increment_messages(session_id).await {
                tracing::warn!(
                    "Failed to bump message count on session {}: {}",
                    session_id,
                    err
                );
            }
        }

        ExecutionOutcome {
            success: true,
            result: Some(reply.result.unwrap_or_default()),
            error: None,
            budget_exceeded: false,
            duration_ms: elapsed_ms(started),
            cost_usd: cost,
            session_id: opts.session_id,
            usage: Some(usage),
        }
    }
}
