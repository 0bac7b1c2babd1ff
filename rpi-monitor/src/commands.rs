//! Whitelisted remote commands
//!
//! Inbound messages on `{base}/command/{slug}/{name}` are matched against the
//! `[commands]` whitelist. A match substitutes the message payload for every
//! `{}` in the shell template and runs it with `sh -c` on its own task, so the
//! receive loop never waits on a long-running action. The outcome is published
//! to `{base}/command/{slug}/{name}/attributes`.
//!
//! Invocations of the same command are not serialised: two quick presses of a
//! button run the template twice, concurrently. Running invocations belong to
//! the dispatcher and are aborted (killing the child) on shutdown.

use crate::error::StartupError;
use crate::topics::{TopicLayout, STATUS_SEGMENT};
use crate::transport::Outbox;
use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat};
use rumqttc::QoS;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const PAYLOAD_PLACEHOLDER: &str = "{}";

const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub trait ShellRunner: Send + Sync + 'static {
    fn run(&self, command_line: String) -> impl Future<Output = Result<CommandOutput>> + Send;
}

/// `sh -c <command line>` with a deadline
#[derive(Debug, Clone)]
pub struct SystemShell {
    shell: PathBuf,
    timeout: Duration,
}

impl SystemShell {
    /// Find `sh` on `PATH`; without it no command can ever run
    pub fn locate() -> Result<Self, StartupError> {
        let path = std::env::var_os("PATH").unwrap_or_default();
        std::env::split_paths(&path)
            .chain([PathBuf::from("/bin"), PathBuf::from("/usr/bin")])
            .map(|dir| dir.join("sh"))
            .find(|candidate| candidate.is_file())
            .map(|shell| {
                debug!("Using shell {}", shell.display());
                Self {
                    shell,
                    timeout: COMMAND_TIMEOUT,
                }
            })
            .ok_or(StartupError::MissingShell)
    }
}

impl ShellRunner for SystemShell {
    fn run(&self, command_line: String) -> impl Future<Output = Result<CommandOutput>> + Send {
        async move {
            let output = tokio::time::timeout(
                self.timeout,
                AsyncCommand::new(&self.shell)
                    .arg("-c")
                    .arg(&command_line)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .output(),
            )
            .await
            .context("Command timed out")?
            .context("Failed to execute command")?;

            Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Spawned,
    /// The synthetic `status` topic
    Ignored,
    /// Not in the whitelist
    Rejected,
    /// Outside the command namespace
    Foreign,
}

#[derive(Debug, Serialize)]
struct CommandReport<'a> {
    command: &'a str,
    success: bool,
    exit_code: Option<i32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    error: String,
    timestamp: String,
}

pub struct CommandDispatcher<R: ShellRunner> {
    topics: TopicLayout,
    commands: BTreeMap<String, String>,
    runner: Arc<R>,
    outbox: Outbox,
    running: JoinSet<()>,
}

impl<R: ShellRunner> CommandDispatcher<R> {
    pub fn new(topics: TopicLayout, commands: BTreeMap<String, String>, runner: R, outbox: Outbox) -> Self {
        Self {
            topics,
            commands,
            runner: Arc::new(runner),
            outbox,
            running: JoinSet::new(),
        }
    }

    /// Invocations still in flight
    pub fn running(&mut self) -> usize {
        while self.running.try_join_next().is_some() {}
        self.running.len()
    }

    /// Wait for every in-flight invocation to publish its result
    pub async fn wait_idle(&mut self) {
        while let Some(finished) = self.running.join_next().await {
            if let Err(e) = finished {
                if e.is_panic() {
                    error!("Command task panicked: {}", e);
                }
            }
        }
    }

    /// Abort in-flight invocations; their results are never published
    pub async fn abort_running(&mut self) {
        let pending = self.running.len();
        if pending > 0 {
            info!("Aborting {} running command(s)", pending);
        }
        self.running.shutdown().await;
    }

    /// Wildcard to subscribe to, `None` when no command is whitelisted
    pub fn subscription(&self) -> Option<String> {
        (!self.commands.is_empty()).then(|| self.topics.command_wildcard())
    }

    pub fn dispatch(&mut self, topic: &str, payload: &[u8]) -> DispatchOutcome {
        let Some(name) = self.topics.command_name(topic) else {
            return DispatchOutcome::Foreign;
        };
        let payload = String::from_utf8_lossy(payload);
        debug!("on_message() topic = [{}] payload = [{}] command = [{}]", topic, payload, name);

        if name == STATUS_SEGMENT {
            return DispatchOutcome::Ignored;
        }

        let Some(template) = self.commands.get(name) else {
            warn!("Invalid command received: {}", name);
            return DispatchOutcome::Rejected;
        };

        let command_line = template.replace(PAYLOAD_PLACEHOLDER, &payload);
        info!("Command \"{}\" received, running: {}", name, command_line);

        let runner = Arc::clone(&self.runner);
        let outbox = self.outbox.clone();
        let attributes_topic = self.topics.command_attributes(name);
        let name = name.to_string();

        while self.running.try_join_next().is_some() {}
        self.running.spawn(async move {
            let result = runner.run(command_line).await;
            let report = match &result {
                Ok(output) => {
                    let stderr = output.stderr.trim();
                    if !stderr.is_empty() {
                        warn!("Command {} says: errors=[{}]", name, stderr);
                    }
                    CommandReport {
                        command: &name,
                        success: output.exit_code == 0,
                        exit_code: Some(output.exit_code),
                        error: stderr.to_string(),
                        timestamp: Local::now().to_rfc3339_opts(SecondsFormat::Secs, false),
                    }
                }
                Err(e) => {
                    error!("Command {} failed: {:#}", name, e);
                    CommandReport {
                        command: &name,
                        success: false,
                        exit_code: None,
                        error: format!("{:#}", e),
                        timestamp: Local::now().to_rfc3339_opts(SecondsFormat::Secs, false),
                    }
                }
            };

            match serde_json::to_vec(&report) {
                Ok(body) => {
                    if let Err(e) = outbox.publish(attributes_topic, QoS::AtLeastOnce, false, body).await {
                        warn!("Failed to publish command result: {:#}", e);
                    }
                }
                Err(e) => warn!("Failed to serialize command result: {}", e),
            }
        });
        DispatchOutcome::Spawned
    }
}
