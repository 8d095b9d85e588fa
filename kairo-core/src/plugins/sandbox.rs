//! Process-level sandbox for validating plugins outside the live registry.
//!
//! Every session runs the plugin artifact as a child process with a cleared
//! environment and a private scratch directory, and talks to it over
//! newline-delimited JSON on stdin/stdout:
//!
//! ```text
//! host  -> guest  {"type":"activate","sandboxId":"..."}
//! host  -> guest  {"type":"invoke_tool","tool":"search","input":{...}}
//! guest -> host   {"type":"require","module":"json"}
//! host  -> guest  {"type":"granted","module":"json"}
//! guest -> host   {"type":"log","level":"info","message":"..."}
//! guest -> host   {"type":"manifest","manifest":{...}}
//! guest -> host   {"type":"result","output":...}
//! guest -> host   {"type":"error","message":"..."}
//! ```
//!
//! A `require` for a module outside the allow-list ends the session with
//! `CapabilityDenied`. The conversation runs under one wall-clock deadline.
//! On Unix the guest leads its own process group, and when the session ends,
//! whatever the outcome, the whole group is killed and the guest reaped, so
//! nothing it started in the background survives. On Linux the guest also
//! runs under the configured `setrlimit` limits. The scratch directory is
//! removed last.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ResourceLimits, SandboxSettings};
use crate::error::{KairoError, KairoResult};

use super::manifest::PluginManifest;
use super::types::{ExecutionResult, PluginLogger};

/// The only `PATH` a guest process sees.
pub const SAFE_PATH: &str = "/usr/bin:/bin:/usr/local/bin";

/// Grant that covers every capability.
pub const GRANT_ALL: &str = "*";

/// Explicit set of capabilities a guest may require. Grants are
/// hierarchical: `storage` also grants `storage:read`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityAllowList {
    grants: BTreeSet<String>,
}

impl CapabilityAllowList {
    pub fn new<I, S>(grants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            grants: grants
                .into_iter()
                .map(Into::into)
                .map(|g: String| g.trim().to_string())
                .filter(|g| !g.is_empty())
                .collect(),
        }
    }

    pub fn deny_all() -> Self {
        Self::default()
    }

    pub fn grant(&mut self, capability: impl Into<String>) {
        self.grants.insert(capability.into());
    }

    pub fn permits(&self, capability: &str) -> bool {
        self.grants.iter().any(|grant| implies(grant, capability))
    }

    pub fn grants(&self) -> impl Iterator<Item = &str> {
        self.grants.iter().map(String::as_str)
    }
}

fn implies(grant: &str, capability: &str) -> bool {
    if grant == GRANT_ALL || grant == capability {
        return true;
    }
    capability
        .strip_prefix(grant)
        .is_some_and(|rest| rest.starts_with(':'))
}

/// The program that hosts a plugin inside a sandbox session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginArtifact {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl PluginArtifact {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SandboxAction {
    Activate,
    InvokeTool { tool: String, input: Value },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestLog {
    pub level: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxReport {
    pub sandbox_id: Uuid,
    pub manifest: PluginManifest,
    pub granted: Vec<String>,
    pub logs: Vec<GuestLog>,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub sandbox_id: Uuid,
    pub tool: String,
    pub output: Value,
    pub granted: Vec<String>,
    pub logs: Vec<GuestLog>,
    pub execution_time_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HostMessage<'a> {
    Activate {
        #[serde(rename = "sandboxId")]
        sandbox_id: Uuid,
    },
    InvokeTool {
        tool: &'a str,
        input: &'a Value,
    },
    Granted {
        module: &'a str,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum GuestMessage {
    Require {
        module: String,
    },
    Log {
        #[serde(default = "default_log_level")]
        level: String,
        message: String,
    },
    Manifest {
        manifest: Value,
    },
    Result {
        #[serde(default)]
        output: Value,
    },
    Error {
        message: String,
    },
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Manifest,
    Result,
}

struct SessionOutcome {
    sandbox_id: Uuid,
    payload: Value,
    granted: Vec<String>,
    logs: Vec<GuestLog>,
    execution_time_ms: u64,
}

/// The guest's process group. Killing it reaches everything the guest
/// spawned; a session dropped mid-flight kills it on drop.
struct ProcessGroup {
    leader: Option<u32>,
    sandbox_id: Uuid,
}

impl ProcessGroup {
    fn of(child: &Child, sandbox_id: Uuid) -> Self {
        Self {
            leader: child.id(),
            sandbox_id,
        }
    }

    fn kill(&mut self) {
        let Some(leader) = self.leader.take() else {
            return;
        };
        #[cfg(unix)]
        {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(e) = killpg(Pid::from_raw(leader as i32), Signal::SIGKILL) {
                debug!(sandbox_id = %self.sandbox_id, "Guest process group already gone: {}", e);
            }
        }
        #[cfg(not(unix))]
        let _ = leader;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Decrements the live-session counter when a session ends.
struct LiveSession(Arc<AtomicUsize>);

impl LiveSession {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct SandboxHarness {
    allow_list: Arc<CapabilityAllowList>,
    timeout: Duration,
    max_line_bytes: usize,
    limits: ResourceLimits,
    live: Arc<AtomicUsize>,
}

impl SandboxHarness {
    pub fn new(settings: &SandboxSettings) -> Self {
        Self {
            allow_list: Arc::new(CapabilityAllowList::new(settings.allowed_modules.clone())),
            timeout: settings.timeout(),
            max_line_bytes: settings.max_line_bytes,
            limits: settings.limits,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_allow_list(mut self, allow_list: CapabilityAllowList) -> Self {
        self.allow_list = Arc::new(allow_list);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn allow_list(&self) -> &CapabilityAllowList {
        &self.allow_list
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Sessions currently running.
    pub fn active_sessions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Activates the artifact in a fresh session and validates the manifest it
    /// reports.
    pub async fn validate_activation(&self, artifact: &PluginArtifact) -> KairoResult<SandboxReport> {
        let outcome = self.session(artifact, &SandboxAction::Activate).await?;

        let manifest: PluginManifest = serde_json::from_value(outcome.payload).map_err(|e| {
            KairoError::manifest(
                format!("sandbox:{}", outcome.sandbox_id),
                format!("Guest returned an unreadable manifest: {}", e),
            )
        })?;
        manifest.validate_for_sandbox()?;

        info!(sandbox_id = %outcome.sandbox_id, plugin_id = %manifest.id, "Sandbox activation validated");
        Ok(SandboxReport {
            sandbox_id: outcome.sandbox_id,
            manifest,
            granted: outcome.granted,
            logs: outcome.logs,
            execution_time_ms: outcome.execution_time_ms,
        })
    }

    /// Invokes one tool in a fresh session.
    pub async fn invoke_tool(
        &self,
        artifact: &PluginArtifact,
        tool: &str,
        input: Value,
    ) -> KairoResult<ToolInvocation> {
        let action = SandboxAction::InvokeTool {
            tool: tool.to_string(),
            input,
        };
        let outcome = self.session(artifact, &action).await?;

        Ok(ToolInvocation {
            sandbox_id: outcome.sandbox_id,
            tool: tool.to_string(),
            output: outcome.payload,
            granted: outcome.granted,
            logs: outcome.logs,
            execution_time_ms: outcome.execution_time_ms,
        })
    }

    /// Runs an action and folds any failure into a failed result carrying
    /// `metadata.errorCode`.
    pub async fn run(&self, artifact: &PluginArtifact, action: SandboxAction) -> ExecutionResult {
        let started = Instant::now();

        let outcome = match &action {
            SandboxAction::Activate => self.validate_activation(artifact).await.and_then(|r| {
                Ok((
                    r.sandbox_id,
                    serde_json::to_value(&r.manifest)?,
                    r.granted,
                ))
            }),
            SandboxAction::InvokeTool { tool, input } => self
                .invoke_tool(artifact, tool, input.clone())
                .await
                .map(|r| (r.sandbox_id, r.output, r.granted)),
        };

        let elapsed = started.elapsed().as_millis() as u64;
        match outcome {
            Ok((sandbox_id, output, granted)) => ExecutionResult::ok(Some(output), elapsed)
                .with_metadata("sandboxId", json!(sandbox_id.to_string()))
                .with_metadata("granted", json!(granted)),
            Err(e) => {
                e.log();
                let mut result = ExecutionResult::failed(e.to_string(), elapsed)
                    .with_metadata("errorCode", json!(e.error_code()));
                if let Some(id) = sandbox_id_of(&e) {
                    result = result.with_metadata("sandboxId", json!(id.to_string()));
                }
                result
            }
        }
    }

    async fn session(
        &self,
        artifact: &PluginArtifact,
        action: &SandboxAction,
    ) -> KairoResult<SessionOutcome> {
        let _live = LiveSession::enter(&self.live);
        let sandbox_id = Uuid::new_v4();
        let started = Instant::now();

        let scratch = tempfile::Builder::new()
            .prefix("kairo-sandbox-")
            .tempdir()?;

        let mut child = spawn_guest(artifact, sandbox_id, scratch.path(), self.limits)?;
        let mut group = ProcessGroup::of(&child, sandbox_id);
        debug!(sandbox_id = %sandbox_id, program = %artifact.program.display(), scratch = ?scratch.path(), "Sandbox session started");

        let (Some(mut stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            reap(&mut child, &mut group, sandbox_id).await;
            return Err(KairoError::SandboxProtocol(
                "guest stdio was not captured".to_string(),
            ));
        };
        let mut reader = BufReader::new(stdout);

        let (request, expect) = match action {
            SandboxAction::Activate => (HostMessage::Activate { sandbox_id }, Expect::Manifest),
            SandboxAction::InvokeTool { tool, input } => {
                (HostMessage::InvokeTool { tool, input }, Expect::Result)
            }
        };

        let mut granted = Vec::new();
        let mut logs = Vec::new();

        let conversation = self.converse(
            sandbox_id,
            &mut stdin,
            &mut reader,
            &request,
            expect,
            &mut granted,
            &mut logs,
        );
        let outcome = tokio::time::timeout(self.timeout, conversation).await;

        // Kill before closing stdin so a denied guest never sees EOF and
        // carries on.
        reap(&mut child, &mut group, sandbox_id).await;
        drop(stdin);

        let path = scratch.path().to_path_buf();
        if let Err(e) = scratch.close() {
            warn!(sandbox_id = %sandbox_id, "Failed to remove scratch directory {:?}: {}", path, e);
        }

        let payload = match outcome {
            Ok(result) => result?,
            Err(_) => {
                warn!(sandbox_id = %sandbox_id, timeout_ms = self.timeout.as_millis() as u64, "Sandbox session timed out");
                return Err(KairoError::SandboxTimeout {
                    sandbox_id,
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        };

        Ok(SessionOutcome {
            sandbox_id,
            payload,
            granted,
            logs,
            execution_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn converse(
        &self,
        sandbox_id: Uuid,
        stdin: &mut ChildStdin,
        reader: &mut BufReader<ChildStdout>,
        request: &HostMessage<'_>,
        expect: Expect,
        granted: &mut Vec<String>,
        logs: &mut Vec<GuestLog>,
    ) -> KairoResult<Value> {
        let logger = PluginLogger::new(&format!("sandbox:{}", sandbox_id));
        send(stdin, request).await?;

        loop {
            let line = self.read_line(reader).await?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let message: GuestMessage = serde_json::from_str(trimmed).map_err(|e| {
                KairoError::SandboxProtocol(format!("unreadable guest message: {}", e))
            })?;

            match message {
                GuestMessage::Require { module } => {
                    if !self.allow_list.permits(&module) {
                        warn!(sandbox_id = %sandbox_id, capability = %module, "Capability denied");
                        return Err(KairoError::CapabilityDenied {
                            sandbox_id,
                            capability: module,
                        });
                    }
                    send(stdin, &HostMessage::Granted { module: &module }).await?;
                    granted.push(module);
                }
                GuestMessage::Log { level, message } => {
                    logger.log(&level, &message);
                    logs.push(GuestLog { level, message });
                }
                GuestMessage::Manifest { manifest } if expect == Expect::Manifest => {
                    return Ok(manifest);
                }
                GuestMessage::Result { output } if expect == Expect::Result => {
                    return Ok(output);
                }
                GuestMessage::Error { message } => {
                    return Err(KairoError::execution(format!("sandbox:{}", sandbox_id), message));
                }
                GuestMessage::Manifest { .. } | GuestMessage::Result { .. } => {
                    return Err(KairoError::SandboxProtocol(format!(
                        "unexpected reply while waiting for {:?}",
                        expect
                    )));
                }
            }
        }
    }

    async fn read_line(&self, reader: &mut BufReader<ChildStdout>) -> KairoResult<String> {
        let mut line = String::new();
        let limit = self.max_line_bytes as u64 + 1;
        let read = (&mut *reader).take(limit).read_line(&mut line).await?;

        if read == 0 {
            return Err(KairoError::SandboxProtocol(
                "guest exited before replying".to_string(),
            ));
        }
        if line.len() > self.max_line_bytes && !line.ends_with('\n') {
            return Err(KairoError::SandboxProtocol(format!(
                "guest message exceeds {} bytes",
                self.max_line_bytes
            )));
        }
        Ok(line)
    }
}

fn spawn_guest(
    artifact: &PluginArtifact,
    sandbox_id: Uuid,
    scratch: &Path,
    limits: ResourceLimits,
) -> KairoResult<Child> {
    let mut command = Command::new(&artifact.program);
    command
        .args(&artifact.args)
        .env_clear()
        .env("PATH", SAFE_PATH)
        .env("HOME", scratch)
        .env("TMPDIR", scratch)
        .env("KAIRO_SANDBOX_ID", sandbox_id.to_string())
        .current_dir(scratch)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    // SAFETY: the hook runs between fork and exec and only makes the
    // setpgid, getrlimit and setrlimit syscalls, which are async-signal-safe.
    #[cfg(unix)]
    unsafe {
        command.pre_exec(move || confine(&limits));
    }
    #[cfg(not(unix))]
    let _ = limits;

    command.spawn().map_err(|e| KairoError::SandboxSpawn {
        program: artifact.program.display().to_string(),
        message: e.to_string(),
    })
}

/// Runs in the forked guest: leads a new process group and, on Linux,
/// lowers its resource limits. Limits above the inherited hard limit are
/// clamped to it.
#[cfg(unix)]
#[cfg_attr(not(target_os = "linux"), allow(unused_variables))]
fn confine(limits: &ResourceLimits) -> std::io::Result<()> {
    use nix::unistd::{setpgid, Pid};

    setpgid(Pid::from_raw(0), Pid::from_raw(0))?;

    #[cfg(target_os = "linux")]
    {
        use nix::sys::resource::{getrlimit, setrlimit, Resource};

        let wanted = [
            (Resource::RLIMIT_AS, limits.max_memory_bytes),
            (Resource::RLIMIT_CPU, limits.max_cpu_secs),
            (Resource::RLIMIT_NOFILE, limits.max_open_files),
            (Resource::RLIMIT_NPROC, limits.max_processes),
        ];
        for (resource, limit) in wanted {
            let Some(limit) = limit else {
                continue;
            };
            let (_, hard) = getrlimit(resource)?;
            let value = limit.min(hard);
            setrlimit(resource, value, value)?;
        }
    }

    Ok(())
}

async fn send(stdin: &mut ChildStdin, message: &HostMessage<'_>) -> KairoResult<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    stdin.write_all(&line).await.map_err(|e| {
        KairoError::SandboxProtocol(format!("failed to write to guest: {}", e))
    })?;
    stdin.flush().await.map_err(|e| {
        KairoError::SandboxProtocol(format!("failed to write to guest: {}", e))
    })?;
    Ok(())
}

async fn reap(child: &mut Child, group: &mut ProcessGroup, sandbox_id: Uuid) {
    group.kill();
    if let Err(e) = child.start_kill() {
        debug!(sandbox_id = %sandbox_id, "Guest already exited: {}", e);
    }
    if let Err(e) = child.wait().await {
        warn!(sandbox_id = %sandbox_id, "Failed to reap guest: {}", e);
    }
}

fn sandbox_id_of(error: &KairoError) -> Option<Uuid> {
    match error {
        KairoError::CapabilityDenied { sandbox_id, .. }
        | KairoError::SandboxTimeout { sandbox_id, .. } => Some(*sandbox_id),
        _ => None,
    }
}
