//! External neuroimaging tools
//!
//! FSL and MRtrix programs are invoked as child processes through the
//! [`CommandRunner`] trait, so the stages that build command lines can be
//! tested with a recording runner instead of the real tools.
//!
//! - `fsl`: brain extraction, tensor fit and rigid registration
//! - `mrtrix`: response estimation, CSD and peak extraction
//! - `brain_mask`: in-process brain mask from the b0 images

pub mod brain_mask;
pub mod fsl;
pub mod mrtrix;

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::error::{Error, Result};

/// Lines of stderr kept in a [`Error::ToolFailed`]
const STDERR_TAIL_LINES: usize = 20;

/// One invocation of an external program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    program: String,
    args: Vec<OsString>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// `-fslgrad <bvecs> <bvals>`
    pub fn fslgrad(self, bvecs: &Path, bvals: &Path) -> Self {
        self.arg("-fslgrad").arg(bvecs).arg(bvals)
    }

    /// `-nthreads <n>`
    pub fn nthreads(self, n: usize) -> Self {
        self.arg("-nthreads").arg(n.to_string())
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Arguments as lossy UTF-8 strings
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Value following `flag`, if present
    pub fn flag_value(&self, flag: &str) -> Option<&OsStr> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(OsString::as_os_str)
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            if arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Captured output of a successful run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Executes external commands
pub trait CommandRunner {
    /// Run `cmd` to completion
    ///
    /// A non-zero exit is an error.
    fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput>;

    /// Fail early when `program` cannot be run
    fn ensure_available(&self, _program: &str) -> Result<()> {
        Ok(())
    }
}

/// Runs commands as child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &ToolCommand) -> Result<ToolOutput> {
        info!(command = %cmd, "running external tool");

        let output = Command::new(&cmd.program)
            .args(&cmd.args)
            .output()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::ToolNotFound {
                        program: cmd.program.clone(),
                    }
                } else {
                    Error::io(&cmd.program, e)
                }
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(Error::ToolFailed {
                command: cmd.to_string(),
                status: output.status.to_string(),
                stderr: tail_lines(&stderr, STDERR_TAIL_LINES),
            });
        }

        debug!(program = cmd.program, stdout_bytes = stdout.len(), "tool finished");
        Ok(ToolOutput { stdout, stderr })
    }

    fn ensure_available(&self, program: &str) -> Result<()> {
        find_on_path(program)
            .map(|_| ())
            .ok_or_else(|| Error::ToolNotFound {
                program: program.to_string(),
            })
    }
}

/// Locate an executable in `PATH`
pub fn find_on_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    std::env::var_os("PATH").and_then(|paths| {
        std::env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|p| p.is_file())
    })
}

/// Last `n` lines of `text`
fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}
