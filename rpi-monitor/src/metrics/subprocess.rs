//! External tool invocation with a deadline
//!
//! `vcgencmd`, `hostname -f` and `apt-get -s` occasionally hang (firmware
//! mailbox busy, resolver timeouts, dpkg lock). The child is terminated once
//! `timeout` elapses so a stuck tool never outlives the reporting cycle.

use crate::error::{MetricError, MetricResult};
use process_control::{ChildExt, Control};
use std::process::{Command, Stdio};
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `cmd args..` and return its stdout when it exits successfully
pub fn run_with_timeout(cmd: &str, args: &[&str], timeout: Duration) -> MetricResult<String> {
    let command_line = describe(cmd, args);
    let failed = |detail: String| MetricError::Command {
        command: command_line.clone(),
        detail,
    };

    let child = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| failed(e.to_string()))?;

    let output = child
        .controlled_with_output()
        .time_limit(timeout)
        .terminate_for_timeout()
        .wait()
        .map_err(|e| failed(e.to_string()))?;

    match output {
        Some(output) if output.status.success() => {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Some(output) => Err(failed(format!(
            "exit code {}: {}",
            output.status.code().map_or(-1, i64::from),
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
        None => Err(MetricError::Timeout {
            command: command_line.clone(),
            seconds: timeout.as_secs(),
        }),
    }
}

fn describe(cmd: &str, args: &[&str]) -> String {
    std::iter::once(cmd).chain(args.iter().copied()).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Instant;

    #[test]
    fn test_successful_command() {
        let out = run_with_timeout("echo", &["hello"], Duration::from_secs(2)).unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn test_failed_command() {
        let err = run_with_timeout("false", &[], Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, MetricError::Command { .. }));
    }

    #[test]
    fn test_missing_command() {
        let err = run_with_timeout("rpi_monitor_no_such_tool", &[], Duration::from_secs(2)).unwrap_err();
        match err {
            MetricError::Command { command, .. } => assert_eq!(command, "rpi_monitor_no_such_tool"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_timeout() {
        let start = Instant::now();
        let err = run_with_timeout("sleep", &["10"], Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, MetricError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_timed_out_child_is_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let script = format!("echo $$ > {}; exec sleep 30", pid_file.display());

        let err = run_with_timeout("sh", &["-c", &script], Duration::from_millis(300)).unwrap_err();
        assert!(matches!(err, MetricError::Timeout { .. }));

        let pid = std::fs::read_to_string(&pid_file).unwrap();
        let stat = Path::new("/proc").join(pid.trim()).join("stat");
        // Gone entirely, or at worst a zombie awaiting reaping: never still sleeping
        if let Ok(stat) = std::fs::read_to_string(&stat) {
            let state = stat.rsplit(')').next().unwrap().split_whitespace().next().unwrap();
            assert_eq!(state, "Z", "child still alive after timeout: {}", stat);
        }
    }
}
