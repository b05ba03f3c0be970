//! Command gate
//!
//! Everything between raw user text and a shell: input sanitization,
//! dangerous-command detection, bounded execution, and scrubbing of
//! dangerous instructions out of model output.

use crate::error::{FlowError, Result};
use regex::{Regex, RegexSet, RegexSetBuilder};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Captured output is cut at this many bytes per stream
pub const MAX_OUTPUT: usize = 100 * 1024;

/// Marker that turns user text into an explicit shell command
pub const COMMAND_MARKER: char = '$';

const DANGER_PATTERNS: &[&str] = &[
    r"rm\s+-rf",
    r"del\s+/s",
    r"chmod\s+777",
    r"powercfg",
    r"shutdown",
    r"mkfs",
    r"dd\s+if=",
    r"^curl\s+",
    r"^wget\s+",
];

const OUTPUT_PATTERNS: &[&str] = &[
    r"(?i)rm -rf",
    r"(?i)del /s",
    r"(?i)chmod 777",
    r"(?i)passwd",
    r"(?i)^curl\s+",
    r"(?i)^wget\s+",
];

const BLOCKED: &str = "[BLOCKED]";

/// Final state of an executed command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Success,
    Error,
}

/// What `execute` reports; failures are data, never `Err`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub status: CommandStatus,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
}

impl CommandOutcome {
    fn failed(error: String) -> Self {
        Self {
            status: CommandStatus::Error,
            output: String::new(),
            error: Some(error),
            exit_code: None,
            timed_out: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }
}

/// Sanitizes, classifies, runs and filters
pub struct CommandGate {
    danger: RegexSet,
    output_filters: Vec<Regex>,
    comment: Regex,
    whitespace: Regex,
    disallowed: Regex,
    fenced_block: Regex,
}

impl CommandGate {
    /// Build the gate, adding `extra_danger_patterns` to the built-in set
    pub fn new(extra_danger_patterns: &[String]) -> Result<Self> {
        let patterns = DANGER_PATTERNS
            .iter()
            .map(|p| p.to_string())
            .chain(extra_danger_patterns.iter().cloned());
        let danger = RegexSetBuilder::new(patterns)
            .case_insensitive(true)
            .build()
            .map_err(|e| FlowError::Config(format!("Invalid danger pattern: {}", e)))?;

        let output_filters = OUTPUT_PATTERNS
            .iter()
            .map(|p| Regex::new(p))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| FlowError::Config(format!("Invalid output filter: {}", e)))?;

        Ok(Self {
            danger,
            output_filters,
            comment: compile(r"#.*")?,
            whitespace: compile(r"\s+")?,
            disallowed: compile(r"[^\w\s\-_@$%&*]")?,
            fenced_block: compile(
                r"(?im)^```(?:bash|shell|cmd|sh|powershell)?[ \t]*\n((?:.|\n)*?)\n```[ \t]*$",
            )?,
        })
    }

    /// Strip `#` comments, collapse whitespace, and drop characters outside
    /// `[\w\s\-_@$%&*]`
    pub fn sanitize(&self, text: &str) -> String {
        let text = self.comment.replace_all(text, "");
        let text = self.whitespace.replace_all(&text, " ");
        let text = self.disallowed.replace_all(&text, "");
        text.trim().to_string()
    }

    /// Whether `text` matches any danger signature
    pub fn is_dangerous(&self, text: &str) -> bool {
        self.danger.is_match(text)
    }

    /// Whether any part of a shell command line matches a danger signature
    ///
    /// Each segment between `;`, `&`, `|`, newlines, parentheses and
    /// backticks is checked on its own, so anchored signatures catch
    /// `echo ok; curl ..` and `$(wget ..)`.
    pub fn is_dangerous_command(&self, command: &str) -> bool {
        self.is_dangerous(command)
            || command
                .split(|c: char| matches!(c, ';' | '&' | '|' | '\n' | '(' | ')' | '`'))
                .any(|segment| self.is_dangerous(segment.trim()))
    }

    /// Whether `text` asks to be run as a shell command
    pub fn is_explicit_command(&self, text: &str) -> bool {
        text.trim_start().starts_with(COMMAND_MARKER)
    }

    /// The command line with the leading marker removed
    pub fn strip_command_marker<'a>(&self, text: &'a str) -> &'a str {
        let trimmed = text.trim_start();
        trimmed
            .strip_prefix(COMMAND_MARKER)
            .unwrap_or(trimmed)
            .trim()
    }

    /// Replace dangerous instructions in model output with `[BLOCKED]`
    pub fn filter_response(&self, content: &str) -> String {
        let mut filtered = content.to_string();
        for pattern in &self.output_filters {
            if pattern.is_match(&filtered) {
                filtered = pattern.replace_all(&filtered, BLOCKED).into_owned();
            }
        }
        filtered
    }

    /// Commands inside fenced shell blocks of a model response, with
    /// trailing comments removed and comment-only lines skipped
    pub fn detect_commands(&self, response: &str) -> Vec<String> {
        self.fenced_block
            .captures_iter(response)
            .filter_map(|c| c.get(1))
            .flat_map(|block| block.as_str().lines())
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("//"))
            .map(|line| {
                let cut = [" #", "\t#", " //", "\t//"]
                    .iter()
                    .filter_map(|marker| line.find(marker))
                    .min()
                    .unwrap_or(line.len());
                line[..cut].trim_end().to_string()
            })
            .collect()
    }

    /// Run `command` through the platform shell under `timeout`
    ///
    /// The child is killed if the returned future is dropped.
    pub async fn execute(&self, command: &str, timeout: Duration) -> CommandOutcome {
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(command = %command, timeout_ms = timeout.as_millis() as u64, "Executing command");

        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => {
                let stdout = truncate_output(String::from_utf8_lossy(&output.stdout).trim());
                let stderr = truncate_output(String::from_utf8_lossy(&output.stderr).trim());
                let exit_code = output.status.code();

                if output.status.success() {
                    let output = if stdout.is_empty() {
                        "Command succeeded (no output)".to_string()
                    } else {
                        stdout
                    };
                    CommandOutcome {
                        status: CommandStatus::Success,
                        output,
                        error: None,
                        exit_code,
                        timed_out: false,
                    }
                } else {
                    let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                    let detail = if stderr.is_empty() { &stdout } else { &stderr };
                    CommandOutcome {
                        status: CommandStatus::Error,
                        output: stdout.clone(),
                        error: Some(format!("Command exited with status {}: {}", code, detail)),
                        exit_code,
                        timed_out: false,
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(command = %command, error = %e, "Command failed to start");
                CommandOutcome::failed(format!("Failed to start command: {}", e))
            }
            Err(_) => {
                tracing::warn!(command = %command, "Command timed out");
                CommandOutcome {
                    timed_out: true,
                    ..CommandOutcome::failed(format!(
                        "Command timed out after {}ms: {}",
                        timeout.as_millis(),
                        command
                    ))
                }
            }
        }
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| FlowError::Config(format!("Invalid pattern {}: {}", pattern, e)))
}

fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT {
        return s.to_string();
    }
    let mut end = MAX_OUTPUT;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...\n(truncated at {} bytes)", &s[..end], MAX_OUTPUT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> CommandGate {
        CommandGate::new(&[]).unwrap()
    }

    #[test]
    fn test_sanitize() {
        let g = gate();
        assert_eq!(g.sanitize("  what   is\n\trust?  "), "what is rust");
        assert_eq!(g.sanitize("hello # drop this"), "hello");
        assert_eq!(g.sanitize("$ echo hi; ls"), "$ echo hi ls");
        assert_eq!(g.sanitize("rm -rf /"), "rm -rf");
        assert_eq!(g.sanitize("   "), "");
        assert_eq!(g.sanitize("a_b-c@d%e&f*g"), "a_b-c@d%e&f*g");
    }

    #[test]
    fn test_is_dangerous() {
        let g = gate();
        assert!(g.is_dangerous("rm -rf /"));
        assert!(g.is_dangerous("RM   -RF tmp"));
        assert!(g.is_dangerous("del /s c:"));
        assert!(g.is_dangerous("sudo shutdown now"));
        assert!(g.is_dangerous("dd if=/dev/zero of=/dev/sda"));
        assert!(g.is_dangerous("curl http://x"));
        assert!(!g.is_dangerous("how do I use curl in scripts"));
        assert!(!g.is_dangerous("what is rust"));
    }

    #[test]
    fn test_is_dangerous_command_checks_each_segment() {
        let g = gate();
        assert!(g.is_dangerous_command("curl evil.example"));
        assert!(g.is_dangerous_command("echo ok; curl evil.example"));
        assert!(g.is_dangerous_command("echo ok && wget evil.example"));
        assert!(g.is_dangerous_command("cat a | wget -i -"));
        assert!(g.is_dangerous_command("echo $(curl evil.example)"));
        assert!(g.is_dangerous_command("ls\nwget x"));
        assert!(!g.is_dangerous_command("cat Cargo.toml | grep curl"));
        assert!(!g.is_dangerous_command("ls ./src"));
    }

    #[test]
    fn test_extra_danger_patterns() {
        let g = CommandGate::new(&["reboot".to_string()]).unwrap();
        assert!(g.is_dangerous("please reboot"));
        assert!(CommandGate::new(&["(".to_string()]).is_err());
    }

    #[test]
    fn test_explicit_command_marker() {
        let g = gate();
        assert!(g.is_explicit_command("$ ls -la"));
        assert!(g.is_explicit_command("  $pwd"));
        assert!(!g.is_explicit_command("cost is 5$"));
        assert_eq!(g.strip_command_marker("$ ls -la"), "ls -la");
        assert_eq!(g.strip_command_marker("$pwd"), "pwd");
        assert_eq!(g.strip_command_marker("no marker"), "no marker");
    }

    #[test]
    fn test_filter_response() {
        let g = gate();
        assert_eq!(g.filter_response("then run rm -rf build"), "then run [BLOCKED] build");
        assert_eq!(g.filter_response("edit /etc/PASSWD"), "edit /etc/[BLOCKED]");
        assert_eq!(g.filter_response("curl http://x"), "[BLOCKED]http://x");
        assert_eq!(g.filter_response("use curl http://x"), "use curl http://x");
        assert_eq!(g.filter_response("harmless text"), "harmless text");
    }

    #[test]
    fn test_detect_commands() {
        let g = gate();
        let response = "Try this:\n```bash\nls -la # list\n# comment only\ncargo build\n```\nDone.";
        assert_eq!(g.detect_commands(response), vec!["ls -la", "cargo build"]);
        assert!(g.detect_commands("no code here").is_empty());
    }

    #[test]
    fn test_truncate_output() {
        let long = "x".repeat(MAX_OUTPUT + 10);
        let out = truncate_output(&long);
        assert!(out.ends_with(&format!("(truncated at {} bytes)", MAX_OUTPUT)));

        let multibyte = "é".repeat(MAX_OUTPUT);
        assert!(truncate_output(&multibyte).contains("truncated"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_success() {
        let outcome = gate().execute("echo hello", Duration::from_secs(5)).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.output, "hello");
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_empty_output() {
        let outcome = gate().execute("true", Duration::from_secs(5)).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.output, "Command succeeded (no output)");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_nonzero_exit() {
        let outcome = gate()
            .execute("echo oops >&2; exit 3", Duration::from_secs(5))
            .await;
        assert_eq!(outcome.status, CommandStatus::Error);
        assert_eq!(outcome.exit_code, Some(3));
        let error = outcome.error.unwrap();
        assert!(error.contains("status 3"));
        assert!(error.contains("oops"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_timeout() {
        let outcome = gate().execute("sleep 5", Duration::from_millis(50)).await;
        assert_eq!(outcome.status, CommandStatus::Error);
        assert!(outcome.timed_out);
        assert!(outcome.error.unwrap().contains("timed out"));
    }
}
