//! External-process adapter used by the CLI backends and trust discovery.
//!
//! Everything that shells out goes through [`CommandRunner`], so tests can
//! script tool output without the tools being installed.

use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::debug;

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `None` if killed by a signal.
    pub code: Option<i32>,
    /// Captured stdout.
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    /// Whether the process exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stderr decoded lossily.
    #[must_use]
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Runs external programs.
pub trait CommandRunner: Send + Sync + std::fmt::Debug {
    /// Locates `program` on `PATH`.
    fn locate(&self, program: &str) -> Option<PathBuf>;

    /// Runs `program` with `args` and extra environment, waiting for exit.
    ///
    /// # Errors
    ///
    /// Returns an IO error when the process cannot be spawned.
    fn run(&self, program: &str, args: &[String], env: &[(String, String)])
    -> io::Result<ProcessOutput>;
}

/// [`CommandRunner`] backed by [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }

    fn run(
        &self,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> io::Result<ProcessOutput> {
        let path = self
            .locate(program)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{program} not found on PATH")))?;
        debug!(program = %path.display(), args = ?redact(args), "running external command");
        let output = Command::new(path)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .output()?;
        Ok(ProcessOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Hides values following credential flags in logged argument lists.
fn redact(args: &[String]) -> Vec<&str> {
    let mut out = Vec::with_capacity(args.len());
    let mut hide_next = false;
    for arg in args {
        if hide_next {
            out.push("<redacted>");
            hide_next = false;
            continue;
        }
        if arg.starts_with("--proxy-password") {
            out.push("--proxy-password=<redacted>");
            continue;
        }
        hide_next = matches!(arg.as_str(), "--proxy-user" | "-U");
        out.push(arg.as_str());
    }
    out
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_hides_credentials() {
        let args: Vec<String> = ["--proxy-user", "bob:secret", "--proxy-password=hunter2", "-s"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        let shown = redact(&args).join(" ");
        assert!(!shown.contains("secret"), "{shown}");
        assert!(!shown.contains("hunter2"), "{shown}");
        assert!(shown.contains("-s"));
    }

    #[test]
    fn test_process_output_helpers() {
        let output = ProcessOutput {
            code: Some(0),
            stdout: Vec::new(),
            stderr: b"warning".to_vec(),
        };
        assert!(output.success());
        assert_eq!(output.stderr_text(), "warning");
    }
}
