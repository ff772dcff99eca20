//! External command execution.
//!
//! Every build action, formatter, assembler, disassembler and emulator run goes
//! through [`Cmd`]. The pipeline never executes anything in-process: a command
//! is an opaque description (program, arguments, working directory, environment)
//! and its result is a [`CommandResult`] with the exit status and captured text.
//!
//! # Example
//!
//! ```rust,ignore
//! use bootstage::process::Cmd;
//!
//! let result = Cmd::new("nasm")
//!     .args(["-f", "bin", "-o"])
//!     .arg_path(&output)
//!     .arg_path(&source)
//!     .error_msg("nasm failed to assemble the AP trampoline")
//!     .run()?;
//! ```

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

/// Builder for an external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    dir: Option<PathBuf>,
    envs: Vec<(OsString, OsString)>,
    error_msg: Option<String>,
    allow_fail: bool,
    interactive: bool,
}

/// Outcome of a finished command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, or `None` if the process was killed by a signal.
    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

impl Cmd {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            dir: None,
            envs: Vec::new(),
            error_msg: None,
            allow_fail: false,
            interactive: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_os_string());
        self
    }

    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Message used as the error headline when the command exits non-zero.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the result instead of failing on a non-zero exit.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Mark a long-running tool whose output the operator should see live.
    /// Build actions run it with [`run_interactive`](Self::run_interactive).
    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn program(&self) -> &OsString {
        &self.program
    }

    pub fn arg_list(&self) -> &[OsString] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Replace every argument equal to `placeholder` with `value`.
    ///
    /// Returns true if at least one argument was substituted.
    pub fn substitute(&mut self, placeholder: &str, value: &Path) -> bool {
        let mut hit = false;
        for arg in &mut self.args {
            if arg.to_str() == Some(placeholder) {
                *arg = value.as_os_str().to_os_string();
                hit = true;
            }
        }
        hit
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        cmd
    }

    /// Run with stdout and stderr captured.
    pub fn run(&self) -> Result<CommandResult> {
        let output = self
            .to_command()
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to execute {}", self.program.to_string_lossy()))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        self.check(result)
    }

    /// Run with the caller's stdio inherited, so the operator sees progress.
    pub fn run_interactive(&self) -> Result<CommandResult> {
        let status = self
            .to_command()
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .with_context(|| format!("Failed to execute {}", self.program.to_string_lossy()))?;

        self.check(CommandResult {
            status,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    fn check(&self, result: CommandResult) -> Result<CommandResult> {
        if result.success() || self.allow_fail {
            return Ok(result);
        }
        let headline = self
            .error_msg
            .clone()
            .unwrap_or_else(|| format!("{} failed", self.program.to_string_lossy()));
        bail!(
            "{}\n  Command: {}\n  Exit code: {}\n  stderr: {}",
            headline,
            self,
            result.code().unwrap_or(-1),
            result.stderr.trim()
        )
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            if arg.contains(' ') {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let result = Cmd::new("sh").args(["-c", "echo hello"]).run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[test]
    fn test_failure_carries_stderr() {
        let err = Cmd::new("sh")
            .args(["-c", "echo broken >&2; exit 3"])
            .error_msg("stand-in build failed")
            .run()
            .unwrap_err();
        let msg = format!("{:#}", err);
        assert!(msg.contains("stand-in build failed"));
        assert!(msg.contains("Exit code: 3"));
        assert!(msg.contains("broken"));
    }

    #[test]
    fn test_allow_fail_returns_status() {
        let result = Cmd::new("sh")
            .args(["-c", "exit 7"])
            .allow_fail()
            .run()
            .unwrap();
        assert_eq!(result.code(), Some(7));
    }

    #[test]
    fn test_working_dir_and_env() {
        let temp = tempfile::TempDir::new().unwrap();
        let result = Cmd::new("sh")
            .args(["-c", "pwd; echo $BOOTSTAGE_TEST"])
            .dir(temp.path())
            .env("BOOTSTAGE_TEST", "yes")
            .run()
            .unwrap();
        let canonical = temp.path().canonicalize().unwrap();
        assert!(result.stdout.contains(canonical.to_str().unwrap()));
        assert!(result.stdout.contains("yes"));
    }

    #[test]
    fn test_substitute_placeholder() {
        let mut cmd = Cmd::new("nasm").args(["-o", "{out}", "src.asm"]);
        assert!(cmd.substitute("{out}", Path::new("/tmp/x.bin")));
        assert_eq!(cmd.to_string(), "nasm -o /tmp/x.bin src.asm");
        assert!(!cmd.substitute("{out}", Path::new("/tmp/y.bin")));
    }

    #[test]
    fn test_interactive_flag() {
        let cmd = Cmd::new("cargo").arg("build");
        assert!(!cmd.is_interactive());
        assert!(cmd.interactive().is_interactive());

        let result = Cmd::new("sh")
            .args(["-c", "exit 4"])
            .allow_fail()
            .run_interactive()
            .unwrap();
        assert_eq!(result.code(), Some(4));
        assert!(result.stderr.is_empty());
    }

    #[test]
    fn test_missing_program_is_error() {
        assert!(Cmd::new("definitely_not_a_real_command_12345").run().is_err());
    }
}
