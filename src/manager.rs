//! The supervisor core: owns every tool's runtime state, spawns and
//! reaps child processes, ingests their output, and fans out change
//! notifications.
//!
//! Generalizes the teacher's `runner::ProcessManager` (which drove a TUI
//! via an `mpsc` event channel and polled `try_wait` from an external
//! render loop) into a handle-style manager: state lives behind a
//! `tokio::sync::RwLock` so any number of HTTP handlers, stream readers,
//! and exit watchers can reach it concurrently, and each tool's exit is
//! awaited directly (`child.wait()`) by its own background task rather
//! than polled from a central loop.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::RwLock;

use crate::ansi::segment_line;
use crate::bus::{SubscriptionBus, SubscriptionHandle, SubscriptionKeyPublic, ToolChanged};
use crate::config::{self, ToolConfig};
use crate::deps;
use crate::error::ManagerError;
use crate::pidfile::{PidFileEntry, PidRegistry};
use crate::procutil::{self, Signal};
use crate::process::{LogLine, LogRing, ToolSnapshot, ToolStatus};
use crate::stream::LineDecoder;

/// Maximum log lines retained per tool before the oldest are evicted.
pub const DEFAULT_MAX_LOG_LINES: usize = 100_000;
/// How long `stop_tool` waits for a graceful exit before giving up on it
/// (force-killing stragglers is `cleanup`'s job, not `stop_tool`'s).
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
/// Default bound on how long `start_all_with_dependencies` waits for a
/// dependency to become ready before starting its dependent anyway.
pub const DEFAULT_DEPENDENCY_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll interval used while waiting on a dependency's readiness.
pub const DEPENDENCY_POLL_INTERVAL: Duration = Duration::from_millis(500);

struct ManagedTool {
    config: ToolConfig,
    pid: Option<i32>,
    start_time: Option<i64>,
    status: ToolStatus,
    exit_code: Option<i32>,
    logs: LogRing,
}

impl ManagedTool {
    fn new(config: ToolConfig, max_log_lines: usize, status: ToolStatus) -> Self {
        Self {
            config,
            pid: None,
            start_time: None,
            status,
            exit_code: None,
            logs: LogRing::new(max_log_lines),
        }
    }

    fn snapshot(&self, index: usize, is_virtual: bool) -> ToolSnapshot {
        ToolSnapshot {
            index,
            config: self.config.clone(),
            status: self.status.clone(),
            pid: self.pid,
            start_time: self.start_time,
            exit_code: self.exit_code,
            logs: self.logs.iter().cloned().collect(),
            log_trim_count: self.logs.trim_count(),
            log_version: self.logs.version(),
            is_virtual,
        }
    }
}

struct ManagerState {
    tools: Vec<ManagedTool>,
    virtual_indices: HashSet<usize>,
    recently_stopped: HashSet<usize>,
    is_shutting_down: bool,
    config_path: Option<PathBuf>,
    max_log_lines: usize,
}

/// Handle to the supervisor core. Cheaply `Clone`-able: every clone
/// shares the same underlying state via `Arc`.
#[derive(Clone)]
pub struct ProcessManager {
    state: Arc<RwLock<ManagerState>>,
    bus: Arc<std::sync::Mutex<SubscriptionBus>>,
}

/// Outcome of a successful [`ProcessManager::reload`].
pub struct ReloadOutcome {
    pub tool_names: Vec<String>,
    pub tools: Vec<ToolConfig>,
    pub warnings: Vec<String>,
}

impl ProcessManager {
    pub fn new(config_path: Option<PathBuf>, max_log_lines: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(ManagerState {
                tools: Vec::new(),
                virtual_indices: HashSet::new(),
                recently_stopped: HashSet::new(),
                is_shutting_down: false,
                config_path,
                max_log_lines,
            })),
            bus: Arc::new(std::sync::Mutex::new(SubscriptionBus::new())),
        }
    }

    fn publish(&self, index: usize) {
        self.bus.lock().expect("subscription bus poisoned").publish(index);
    }

    async fn registry(&self) -> PidRegistry {
        let state = self.state.read().await;
        PidRegistry::new(state.config_path.as_deref())
    }

    /// Seeds tool state from `configs`, one [`ToolStatus::Stopped`] slot
    /// per config, after reaping any processes left behind by a previous
    /// session at the same configuration path.
    pub async fn initialize(&self, configs: Vec<ToolConfig>) -> Result<(), ManagerError> {
        self.reap_orphans().await?;

        let mut state = self.state.write().await;
        let max_log_lines = state.max_log_lines;
        state.tools = configs
            .into_iter()
            .map(|c| ManagedTool::new(c, max_log_lines, ToolStatus::Stopped))
            .collect();
        state.virtual_indices.clear();
        state.recently_stopped.clear();
        Ok(())
    }

    async fn reap_orphans(&self) -> Result<(), ManagerError> {
        let registry = self.registry().await;
        let Some(data) = registry.load().await else {
            return Ok(());
        };
        for entry in data.processes {
            if procutil::is_process_running(entry.pid) {
                let killed =
                    procutil::kill_process_gracefully(entry.pid, procutil::DEFAULT_GRACEFUL_TIMEOUT)
                        .await;
                tracing::info!(
                    tool = %entry.tool_name,
                    pid = entry.pid,
                    killed,
                    "reaped orphaned process from previous session"
                );
            } else {
                tracing::debug!(
                    tool = %entry.tool_name,
                    pid = entry.pid,
                    "orphan pid from previous session already dead"
                );
            }
        }
        registry.delete().await?;
        Ok(())
    }

    /// Starts tool `index`'s child process. A no-op if the index is
    /// invalid, the tool is virtual, or it is already running. Spawn
    /// failures are captured on the tool (`ToolStatus::Error`) and never
    /// propagated to the caller.
    pub async fn start_tool(&self, index: usize) -> Result<(), ManagerError> {
        let config = {
            let state = self.state.read().await;
            let Some(tool) = state.tools.get(index) else {
                return Ok(());
            };
            if tool.status == ToolStatus::Running || tool.config.is_virtual() {
                return Ok(());
            }
            tool.config.clone()
        };

        let mut command = Command::new(&config.command);
        command.args(&config.args);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }
        if !config.env.is_empty() {
            command.envs(&config.env);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let message = format!("failed to start: {err}");
                {
                    let mut state = self.state.write().await;
                    if let Some(tool) = state.tools.get_mut(index) {
                        tool.status = ToolStatus::Error {
                            message: message.clone(),
                        };
                        tool.logs.append(LogLine::plain(format!("[{message}]")));
                    }
                }
                self.publish(index);
                return Ok(());
            }
        };

        let pid = child.id().map(|p| p as i32).unwrap_or(0);
        let start_time = now_millis();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        {
            let mut state = self.state.write().await;
            if let Some(tool) = state.tools.get_mut(index) {
                tool.status = ToolStatus::Running;
                tool.pid = Some(pid);
                tool.start_time = Some(start_time);
                tool.exit_code = None;
            }
        }
        self.publish(index);

        self.registry()
            .await
            .update(PidFileEntry {
                tool_index: index,
                tool_name: config.name.clone(),
                pid,
                start_time,
                command: config.command.clone(),
                args: config.args.clone(),
                cwd: config.cwd.clone(),
            })
            .await;

        if let Some(stdout) = stdout {
            let manager = self.clone();
            tokio::spawn(async move { manager.pump_stream(index, false, stdout).await });
        }
        if let Some(stderr) = stderr {
            let manager = self.clone();
            tokio::spawn(async move { manager.pump_stream(index, true, stderr).await });
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(_) => None,
            };
            manager.handle_exit(index, code).await;
        });

        Ok(())
    }

    async fn pump_stream<R>(&self, index: usize, is_stderr: bool, mut reader: R)
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut decoder = LineDecoder::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for line in decoder.feed(&buf[..n]) {
                self.ingest_line(index, line.text, line.is_replacement, is_stderr)
                    .await;
            }
        }
        if let Some(line) = decoder.finish() {
            self.ingest_line(index, line.text, line.is_replacement, is_stderr)
                .await;
        }
    }

    async fn ingest_line(&self, index: usize, text: String, is_replacement: bool, is_stderr: bool) {
        {
            let mut state = self.state.write().await;
            let Some(tool) = state.tools.get_mut(index) else {
                return;
            };
            let log_line = LogLine {
                segments: segment_line(&text),
                is_stderr,
            };
            if is_replacement && !tool.logs.is_empty() {
                tool.logs.replace_last(log_line);
            } else {
                tool.logs.append(log_line);
            }
        }
        self.publish(index);
    }

    async fn handle_exit(&self, index: usize, code: Option<i32>) {
        {
            let mut state = self.state.write().await;
            let manager_shutting_down = state.is_shutting_down;
            if let Some(tool) = state.tools.get_mut(index) {
                let stop_was_requested = matches!(tool.status, ToolStatus::ShuttingDown);
                tool.status = if stop_was_requested {
                    ToolStatus::Stopped
                } else {
                    match code {
                        Some(0) => ToolStatus::Stopped,
                        Some(c) => ToolStatus::Error {
                            message: format!("process exited with code {c}"),
                        },
                        None => ToolStatus::Error {
                            message: "process exited without a status code".to_string(),
                        },
                    }
                };
                tool.pid = None;
                tool.start_time = None;
                tool.exit_code = code;
                let message = match code {
                    Some(c) => format!("[Process exited with code {c}]"),
                    None => "[Process exited]".to_string(),
                };
                tool.logs.append(LogLine::plain(message));
                if manager_shutting_down {
                    state.recently_stopped.insert(index);
                }
            }
        }
        self.registry().await.remove(index).await;
        self.publish(index);
    }

    /// Sends `term` to tool `index`, then waits up to
    /// [`GRACEFUL_SHUTDOWN_TIMEOUT`] for its exit watcher to observe the
    /// child's death. A no-op if the tool is not currently running. Does
    /// not force-kill: a straggler is left in `ShuttingDown` for
    /// [`ProcessManager::cleanup`] to finish off.
    pub async fn stop_tool(&self, index: usize) -> Result<(), ManagerError> {
        let pid = {
            let mut state = self.state.write().await;
            let Some(tool) = state.tools.get_mut(index) else {
                return Ok(());
            };
            if tool.status != ToolStatus::Running {
                return Ok(());
            }
            tool.status = ToolStatus::ShuttingDown;
            tool.pid
        };
        self.publish(index);

        let Some(pid) = pid else {
            return Ok(());
        };
        procutil::kill_process(pid, Signal::Term);

        let deadline = tokio::time::Instant::now() + GRACEFUL_SHUTDOWN_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            let still_shutting_down = {
                let state = self.state.read().await;
                matches!(
                    state.tools.get(index).map(|t| &t.status),
                    Some(ToolStatus::ShuttingDown)
                )
            };
            if !still_shutting_down {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    /// Stops a running tool (force-killing it if graceful shutdown
    /// doesn't land within a couple of seconds) and starts it again.
    pub async fn restart_tool(&self, index: usize) -> Result<(), ManagerError> {
        let was_running = {
            let state = self.state.read().await;
            matches!(
                state.tools.get(index).map(|t| &t.status),
                Some(ToolStatus::Running)
            )
        };
        if was_running {
            self.stop_tool(index).await?;
            let straggler_pid = {
                let state = self.state.read().await;
                state.tools.get(index).and_then(|t| t.pid)
            };
            if let Some(pid) = straggler_pid {
                procutil::kill_process(pid, Signal::Kill);
                let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
                while tokio::time::Instant::now() < deadline {
                    let still_tracked = {
                        let state = self.state.read().await;
                        state.tools.get(index).and_then(|t| t.pid).is_some()
                    };
                    if !still_tracked {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
        self.start_tool(index).await
    }

    /// Empties tool `index`'s log ring. A no-op on an invalid index.
    pub async fn clear_logs(&self, index: usize) -> Result<(), ManagerError> {
        {
            let mut state = self.state.write().await;
            let Some(tool) = state.tools.get_mut(index) else {
                return Ok(());
            };
            tool.logs.clear();
        }
        self.publish(index);
        Ok(())
    }

    /// Gracefully shuts down every running, non-virtual tool in
    /// parallel, force-kills any that don't exit in time, runs each
    /// tool's declared cleanup commands in parallel, and deletes the PID
    /// file. Sets and clears the shutdown flag around the whole
    /// operation.
    pub async fn cleanup(&self) -> Result<(), ManagerError> {
        {
            let mut state = self.state.write().await;
            state.is_shutting_down = true;
        }

        let (running_indices, cleanup_work): (Vec<usize>, Vec<(String, Option<String>)>) = {
            let state = self.state.read().await;
            let running = state
                .tools
                .iter()
                .enumerate()
                .filter(|(_, t)| {
                    !t.config.is_virtual()
                        && matches!(t.status, ToolStatus::Running | ToolStatus::ShuttingDown)
                })
                .map(|(i, _)| i)
                .collect();
            let cleanup_work = state
                .tools
                .iter()
                .flat_map(|t| {
                    t.config
                        .cleanup
                        .iter()
                        .map(|cmd| (cmd.clone(), t.config.cwd.clone()))
                })
                .collect();
            (running, cleanup_work)
        };

        let stop_futures = running_indices.iter().map(|&idx| self.stop_tool(idx));
        futures::future::join_all(stop_futures).await;

        for &idx in &running_indices {
            let pid = {
                let state = self.state.read().await;
                state.tools.get(idx).and_then(|t| t.pid)
            };
            if let Some(pid) = pid {
                procutil::kill_process(pid, Signal::Kill);
            }
        }

        let cleanup_futures = cleanup_work.into_iter().map(|(cmd, cwd)| run_cleanup_command(cmd, cwd));
        futures::future::join_all(cleanup_futures).await;

        self.registry().await.delete().await?;

        {
            let mut state = self.state.write().await;
            state.is_shutting_down = false;
        }

        for idx in running_indices {
            self.publish(idx);
        }
        Ok(())
    }

    /// Sends `term` to every tool with a known pid without waiting for
    /// any of them to exit. Intended for unexpected-exit hooks where
    /// blocking on the async lock would be unsafe; uses a non-blocking
    /// lock attempt and simply does nothing if the lock is contended.
    pub fn kill_all_sync(&self) {
        let Ok(state) = self.state.try_read() else {
            return;
        };
        for tool in &state.tools {
            if let Some(pid) = tool.pid {
                procutil::kill_process(pid, Signal::Term);
            }
        }
    }

    /// Re-parses configuration (from `path`, or the previously configured
    /// path if `path` is `None`), stops and replaces every non-virtual
    /// tool, and re-appends the preserved virtual tools at the end.
    pub async fn reload(&self, path: Option<PathBuf>) -> Result<ReloadOutcome, ManagerError> {
        let effective_path = {
            let state = self.state.read().await;
            path.or_else(|| state.config_path.clone())
                .ok_or(ManagerError::NoConfigPath)?
        };
        let loaded = config::load_config(&effective_path)?;
        if loaded.tools.is_empty() {
            return Err(ManagerError::Config(crate::error::ConfigError::Empty));
        }

        let stoppable: Vec<usize> = {
            let mut state = self.state.write().await;
            state.is_shutting_down = true;
            let indices: Vec<usize> = state
                .tools
                .iter()
                .enumerate()
                .filter(|(i, t)| {
                    !state.virtual_indices.contains(i)
                        && matches!(t.status, ToolStatus::Running | ToolStatus::ShuttingDown)
                })
                .map(|(i, _)| i)
                .collect();
            for &idx in &indices {
                state.tools[idx].status = ToolStatus::ShuttingDown;
            }
            indices
        };
        for &idx in &stoppable {
            self.publish(idx);
        }
        futures::future::join_all(stoppable.iter().map(|&idx| self.stop_tool(idx))).await;

        let tool_names: Vec<String> = loaded.tools.iter().map(|t| t.name.clone()).collect();
        let tools_for_outcome = loaded.tools.clone();
        {
            let mut state = self.state.write().await;
            let max_log_lines = state.max_log_lines;
            let preserved_virtual: Vec<ManagedTool> = state
                .virtual_indices
                .iter()
                .filter_map(|&idx| {
                    if idx < state.tools.len() {
                        Some(idx)
                    } else {
                        None
                    }
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|idx| {
                    let old = &state.tools[idx];
                    ManagedTool {
                        config: old.config.clone(),
                        pid: old.pid,
                        start_time: old.start_time,
                        status: old.status.clone(),
                        exit_code: old.exit_code,
                        logs: old.logs.clone(),
                    }
                })
                .collect();

            let mut new_tools: Vec<ManagedTool> = loaded
                .tools
                .into_iter()
                .map(|c| ManagedTool::new(c, max_log_lines, ToolStatus::Stopped))
                .collect();
            let mut new_virtual_indices = HashSet::new();
            for virt in preserved_virtual {
                new_virtual_indices.insert(new_tools.len());
                new_tools.push(virt);
            }

            state.tools = new_tools;
            state.virtual_indices = new_virtual_indices;
            state.config_path = Some(effective_path);
            state.is_shutting_down = false;
        }

        self.bus
            .lock()
            .expect("subscription bus poisoned")
            .clear_tool_subscriptions();

        Ok(ReloadOutcome {
            tool_names,
            tools: tools_for_outcome,
            warnings: loaded.warnings,
        })
    }

    /// Starts every configured tool, respecting `depends_on`: tools with
    /// no dependencies start immediately, and each subsequent dependency
    /// level waits (up to `timeout`, default [`DEFAULT_DEPENDENCY_TIMEOUT`])
    /// for `is_ready` to report every dependency ready before starting,
    /// proceeding with a logged warning on timeout rather than blocking
    /// forever.
    pub async fn start_all_with_dependencies(
        &self,
        is_ready: impl Fn(&str) -> bool,
        timeout: Option<Duration>,
    ) -> Result<(), ManagerError> {
        let timeout = timeout.unwrap_or(DEFAULT_DEPENDENCY_TIMEOUT);
        let configs: Vec<ToolConfig> = {
            let state = self.state.read().await;
            state.tools.iter().map(|t| t.config.clone()).collect()
        };
        let levels = deps::resolve_levels(&configs);

        {
            let mut state = self.state.write().await;
            for (idx, config) in configs.iter().enumerate() {
                if !config.depends_on.is_empty() {
                    if let Some(tool) = state.tools.get_mut(idx) {
                        tool.status = ToolStatus::Waiting;
                    }
                }
            }
        }

        for level in &levels.levels {
            for (idx, config) in level {
                for dep in &config.depends_on {
                    let deadline = tokio::time::Instant::now() + timeout;
                    loop {
                        if is_ready(dep) {
                            break;
                        }
                        if tokio::time::Instant::now() >= deadline {
                            tracing::warn!(
                                tool = %config.name,
                                dependency = %dep,
                                "timed out waiting for dependency; starting anyway"
                            );
                            self.add_log_to_tool(
                                *idx,
                                format!("[warning: dependency '{dep}' did not become ready in time]"),
                            )
                            .await;
                            break;
                        }
                        tokio::time::sleep(DEPENDENCY_POLL_INTERVAL).await;
                    }
                }
            }
            futures::future::join_all(level.iter().map(|(idx, _)| self.start_tool(*idx))).await;
        }
        Ok(())
    }

    /// Appends a new virtual tool (empty command, perpetually `running`)
    /// and returns its index.
    pub async fn create_virtual_tool(&self, name: impl Into<String>) -> usize {
        let mut state = self.state.write().await;
        let max_log_lines = state.max_log_lines;
        let tool = ManagedTool::new(ToolConfig::virtual_tool(name), max_log_lines, ToolStatus::Running);
        let index = state.tools.len();
        state.tools.push(tool);
        state.virtual_indices.insert(index);
        drop(state);
        self.publish(index);
        index
    }

    /// Appends a single plain-text log line to tool `index`. Used by the
    /// HTTP API (and other in-process producers) to narrate their own
    /// activity onto a virtual tool's stream.
    pub async fn add_log_to_tool(&self, index: usize, message: impl Into<String>) {
        {
            let mut state = self.state.write().await;
            let Some(tool) = state.tools.get_mut(index) else {
                return;
            };
            tool.logs.append(LogLine::plain(message.into()));
        }
        self.publish(index);
    }

    /// Looks up a tool by name (indices shift across reloads, so name is
    /// the stable key for external callers).
    pub async fn get_tool_by_name(&self, name: &str) -> Option<ToolSnapshot> {
        let state = self.state.read().await;
        let (index, tool) = state
            .tools
            .iter()
            .enumerate()
            .find(|(_, t)| t.config.name == name)?;
        Some(tool.snapshot(index, state.virtual_indices.contains(&index)))
    }

    /// Returns a clone-able snapshot of tool `index`, or `None` if the
    /// index is out of range.
    pub async fn get_tool(&self, index: usize) -> Option<ToolSnapshot> {
        let state = self.state.read().await;
        let tool = state.tools.get(index)?;
        Some(tool.snapshot(index, state.virtual_indices.contains(&index)))
    }

    /// Returns a snapshot of every tool, in index order.
    pub async fn get_tools(&self) -> Vec<ToolSnapshot> {
        let state = self.state.read().await;
        state
            .tools
            .iter()
            .enumerate()
            .map(|(i, t)| t.snapshot(i, state.virtual_indices.contains(&i)))
            .collect()
    }

    /// Registers a callback for changes to one tool (or every tool, via
    /// [`SubscriptionKeyPublic::All`]). The callback runs synchronously
    /// and must not block.
    pub fn subscribe(
        &self,
        key: SubscriptionKeyPublic,
        callback: impl Fn(ToolChanged) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.bus
            .lock()
            .expect("subscription bus poisoned")
            .subscribe(key, callback)
    }

    /// Deregisters a subscription previously returned by [`Self::subscribe`].
    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.bus.lock().expect("subscription bus poisoned").unsubscribe(handle);
    }
}

async fn run_cleanup_command(command: String, cwd: Option<String>) {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&command);
    if let Some(cwd) = &cwd {
        cmd.current_dir(cwd);
    }
    match cmd.status().await {
        Ok(status) if status.success() => {}
        Ok(status) => {
            tracing::error!(command = %command, code = ?status.code(), "cleanup command exited non-zero");
        }
        Err(err) => {
            tracing::error!(command = %command, error = %err, "failed to run cleanup command");
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
