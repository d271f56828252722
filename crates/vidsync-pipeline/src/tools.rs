//! External tool invocation.
//!
//! Every subprocess the pipeline starts (mount, ffprobe, ffmpeg, the merge
//! utility, the stabilizer) goes through a `ToolRunner`, so stages can be
//! exercised against a scripted runner.

use futures::future::BoxFuture;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

use vidsync_core::{PipelineError, PipelineResult, ToolFailureKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        ToolCommand {
            program: program.into(),
            args: Vec::new(),
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

    /// Executable file name, e.g. `mp4_merge` for `/usr/local/bin/mp4_merge`.
    pub fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.to_string_lossy());
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code; `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        ToolOutput {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        ToolOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

pub trait ToolRunner: Send + Sync {
    fn run<'a>(&'a self, cmd: &'a ToolCommand) -> BoxFuture<'a, std::io::Result<ToolOutput>>;
}

/// Runs commands as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl ToolRunner for SystemRunner {
    fn run<'a>(&'a self, cmd: &'a ToolCommand) -> BoxFuture<'a, std::io::Result<ToolOutput>> {
        Box::pin(async move {
            tracing::debug!(cmd = %cmd.display(), "spawning tool");
            let output = Command::new(&cmd.program)
                .args(&cmd.args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output()
                .await?;
            Ok(ToolOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

const GPU_SIGNATURES: &[&str] = &[
    "no gpu",
    "gpu not found",
    "no compatible gpu",
    "no suitable adapter",
    "no compatible device",
    "cuda error",
    "opencl error",
    "failed to initialize wgpu",
    "no vulkan",
];

const LENS_SIGNATURES: &[&str] = &[
    "lens profile",
    "no lens",
    "missing lens",
    "lens not found",
];

/// Classify a tool failure from its stderr.
pub fn classify_failure(stderr: &str) -> ToolFailureKind {
    let lower = stderr.to_lowercase();
    if GPU_SIGNATURES.iter().any(|s| lower.contains(s)) {
        ToolFailureKind::GpuUnavailable
    } else if LENS_SIGNATURES.iter().any(|s| lower.contains(s)) {
        ToolFailureKind::LensProfileMissing
    } else {
        ToolFailureKind::Generic
    }
}

/// Last non-empty stderr lines, enough to explain a failure in a log line.
pub fn stderr_tail(stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(5);
    lines[start..].join("\n")
}

/// Run a tool and turn spawn errors or a non-zero exit into a classified
/// `ToolInvocationFailure`.
pub async fn run_checked(runner: &dyn ToolRunner, cmd: &ToolCommand) -> PipelineResult<ToolOutput> {
    let output = runner
        .run(cmd)
        .await
        .map_err(|e| PipelineError::ToolInvocationFailure {
            tool: cmd.tool_name(),
            classification: ToolFailureKind::Generic,
            detail: format!("could not start {}: {e}", cmd.program.display()),
        })?;

    if output.success() {
        return Ok(output);
    }

    let exit = output
        .code
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".into());
    Err(PipelineError::ToolInvocationFailure {
        tool: cmd.tool_name(),
        classification: classify_failure(&output.stderr),
        detail: format!("exit {exit}: {}", stderr_tail(&output.stderr)),
    })
}
