use crate::{
    config::{ResourceLimits, SandboxPolicy, ServiceConfig},
    engine::{EngineCapabilities, ExecutionOptions, PythonEngine, RenderOutput},
    errors::{ExecError, Result},
    preprocess::FALLBACK_IMAGE_NAME,
    workspace::IsolatedWorkspace,
};
use async_trait::async_trait;
use base64::Engine as _;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

const REPORT_START: &str = "OUTPUT_JSON_START";
const REPORT_END: &str = "OUTPUT_JSON_END";
const SYNTAX_MARKER: &str = "SYNTAX_ERROR: ";

const VALIDATION_SCRIPT: &str = r#"
import ast
import sys
import traceback

source = sys.stdin.read()
try:
    ast.parse(source, "<submission>")
    print("OK")
except SyntaxError as e:
    print("SYNTAX_ERROR: " + str(e))
    sys.stdout.write("".join(traceback.format_exception_only(type(e), e)))
"#;

/// Native Python engine: one fresh interpreter process per render
///
/// Every call gets its own process and scratch workspace, so matplotlib's
/// global figure registry is never shared between requests.
pub struct NativePythonEngine {
    python_path: PathBuf,
    limits: ResourceLimits,
    workspace_base: PathBuf,
    keep_workspaces: bool,
}

impl NativePythonEngine {
    /// Create a new native Python engine (finds Python in PATH)
    pub fn new() -> Result<Self> {
        let python_path = which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|_| ExecError::PythonNotFound)?;

        Ok(Self::with_resolved_path(python_path))
    }

    /// Create with an explicit interpreter, either a path or a name looked up in PATH
    pub fn with_python_path(python_path: PathBuf) -> Result<Self> {
        let resolved = which::which(&python_path).map_err(|_| ExecError::PythonNotFound)?;
        Ok(Self::with_resolved_path(resolved))
    }

    /// Create from service configuration
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let engine = match &config.python_path {
            Some(path) => Self::with_python_path(path.clone())?,
            None => Self::new()?,
        };
        Ok(engine
            .with_limits(config.limits.clone())
            .with_workspace_base(config.workspace_base.clone())
            .keep_workspaces(config.keep_workspaces))
    }

    fn with_resolved_path(python_path: PathBuf) -> Self {
        Self {
            python_path,
            limits: ResourceLimits::default(),
            workspace_base: std::env::temp_dir().join("plotrun-workspaces"),
            keep_workspaces: false,
        }
    }

    /// Set custom resource limits
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the directory per-render workspaces are created in
    pub fn with_workspace_base(mut self, base: PathBuf) -> Self {
        self.workspace_base = base;
        self
    }

    /// Leave workspaces on disk after each render
    pub fn keep_workspaces(mut self, keep: bool) -> Self {
        self.keep_workspaces = keep;
        self
    }

    /// Get the Python executable path being used
    pub fn python_path(&self) -> &Path {
        &self.python_path
    }

    /// Generate the restricted builtin table
    fn generate_builtin_table(&self, policy: &SandboxPolicy) -> String {
        format!(
            r#"
_ALLOWED_BUILTINS = {allowed}
_safe_builtins = {{
    name: getattr(builtins, name) for name in _ALLOWED_BUILTINS if hasattr(builtins, name)
}}
"#,
            allowed = py_list(&policy.allowed_builtins)
        )
    }

    /// Generate the binding table injected into the submission's namespace
    fn generate_bindings(&self, policy: &SandboxPolicy) -> String {
        let mut out = String::from(
            r#"
def _bind(module, attr=None):
    try:
        mod = importlib.import_module(module)
        if attr is None:
            return mod
        try:
            return getattr(mod, attr)
        except AttributeError:
            return importlib.import_module(module + "." + attr)
    except ImportError:
        return None

_scope = {"__builtins__": _safe_builtins, "__name__": "__main__"}
"#,
        );
        for binding in &policy.bindings {
            let attr = match &binding.attr {
                Some(attr) => py_str(attr),
                None => "None".to_string(),
            };
            out.push_str(&format!(
                "_scope[{}] = _bind({}, {})\n",
                py_str(&binding.name),
                py_str(&binding.module),
                attr
            ));
        }
        out
    }

    /// Generate matplotlib font configuration
    fn generate_font_setup(&self, policy: &SandboxPolicy) -> String {
        if policy.font_families.is_empty() {
            return String::new();
        }
        format!(
            r#"
plt.rcParams["font.family"] = "sans-serif"
plt.rcParams["font.sans-serif"] = {fonts}
plt.rcParams["axes.unicode_minus"] = False
"#,
            fonts = py_list(&policy.font_families)
        )
    }

    /// Build the runner program passed to the interpreter with `-c`
    pub(crate) fn runner_script(&self, options: &ExecutionOptions) -> String {
        format!(
            r#"
import base64
import builtins
import importlib
import io
import json
import os
import sys
import traceback
from contextlib import redirect_stdout, redirect_stderr

import matplotlib
matplotlib.use("Agg")
import matplotlib.pyplot as plt

# Font setup
{fonts}

# Builtin allow-list
{builtins}

# Library bindings
{bindings}

_output = {{
    "stdout": None,
    "stderr": None,
    "png": None,
    "figures": 0,
    "fallback": False,
    "error": None,
    "error_kind": None,
    "trace": None,
}}
_captured_stdout = io.StringIO()
_captured_stderr = io.StringIO()

try:
    with open(os.environ["PLOTRUN_SUBMISSION"], encoding="utf-8") as _f:
        _source = _f.read()
    _code = compile(_source, "<submission>", "exec")
    with redirect_stdout(_captured_stdout), redirect_stderr(_captured_stderr):
        exec(_code, _scope)
    _nums = plt.get_fignums()
    _output["figures"] = len(_nums)
    if _nums:
        _buf = io.BytesIO()
        plt.gcf().savefig(_buf, format="png", dpi={dpi}, bbox_inches="tight")
        _output["png"] = base64.b64encode(_buf.getvalue()).decode("ascii")
    elif os.path.isfile({fallback}):
        with open({fallback}, "rb") as _f:
            _output["png"] = base64.b64encode(_f.read()).decode("ascii")
        _output["fallback"] = True
except SyntaxError as e:
    _output["error_kind"] = "syntax"
    _output["error"] = f"{{type(e).__name__}}: {{e}}"
    _output["trace"] = "".join(traceback.format_exception_only(type(e), e))
except (Exception, SystemExit) as e:
    _output["error_kind"] = "runtime"
    _output["error"] = f"{{type(e).__name__}}: {{e}}"
    _output["trace"] = traceback.format_exc()
finally:
    plt.close("all")

_output["stdout"] = _captured_stdout.getvalue() or None
_output["stderr"] = _captured_stderr.getvalue() or None

sys.stdout = sys.__stdout__
print("{start}")
print(json.dumps(_output))
print("{end}")
"#,
            fonts = self.generate_font_setup(&options.policy),
            builtins = self.generate_builtin_table(&options.policy),
            bindings = self.generate_bindings(&options.policy),
            dpi = options.dpi,
            fallback = py_str(FALLBACK_IMAGE_NAME),
            start = REPORT_START,
            end = REPORT_END,
        )
    }

    /// Apply resource limits to the command
    #[cfg(unix)]
    fn apply_resource_limits(&self, cmd: &mut Command, limits: &ResourceLimits, cpu_seconds: u64) {
        #[cfg(not(target_os = "macos"))]
        let memory_bytes = limits.memory_bytes();
        #[cfg(not(target_os = "macos"))]
        let max_processes = limits.max_processes;

        unsafe {
            cmd.pre_exec(move || {
                // New process group so a timeout can kill everything the submission spawned
                libc::setpgid(0, 0);

                // macOS doesn't support RLIMIT_AS properly, skip it
                #[cfg(not(target_os = "macos"))]
                if let Some(memory_bytes) = memory_bytes {
                    let rlimit = libc::rlimit {
                        rlim_cur: memory_bytes as libc::rlim_t,
                        rlim_max: memory_bytes as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_AS, &rlimit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                let rlimit = libc::rlimit {
                    rlim_cur: cpu_seconds as libc::rlim_t,
                    rlim_max: cpu_seconds as libc::rlim_t,
                };
                if libc::setrlimit(libc::RLIMIT_CPU, &rlimit) != 0 {
                    return Err(std::io::Error::last_os_error());
                }

                #[cfg(not(target_os = "macos"))]
                if let Some(max_processes) = max_processes {
                    let rlimit = libc::rlimit {
                        rlim_cur: max_processes as libc::rlim_t,
                        rlim_max: max_processes as libc::rlim_t,
                    };
                    if libc::setrlimit(libc::RLIMIT_NPROC, &rlimit) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }

                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    fn apply_resource_limits(&self, _cmd: &mut Command, _limits: &ResourceLimits, _cpu_seconds: u64) {
        // Only the wall-clock deadline applies off unix
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.python_path);
        cmd.env("PYTHONIOENCODING", "utf-8")
            .env("MPLBACKEND", "Agg")
            .kill_on_drop(true);
        cmd
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!("[ENGINE] killpg({}) failed: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// CPU-time ceiling for one render
///
/// Never below the wall-clock deadline, so a busy loop runs into the deadline
/// first and is reported as a timeout.
fn cpu_limit_secs(limits: &ResourceLimits, timeout: Duration) -> u64 {
    let deadline_secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    limits.cpu_seconds.max(deadline_secs + 1)
}

/// Map an interpreter that exited without a report to an error
fn classify_exit(signal: Option<i32>, stderr: &str, timeout: Duration) -> ExecError {
    if stderr.contains("MemoryError") {
        return ExecError::MemoryLimitExceeded;
    }
    match signal {
        #[cfg(unix)]
        Some(libc::SIGXCPU) => ExecError::Timeout(timeout),
        Some(_) => ExecError::ProcessKilled,
        None => ExecError::RuntimeError {
            message: last_line(stderr).to_string(),
            trace: stderr.to_string(),
        },
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

impl NativePythonEngine {
    async fn check_syntax(&self, code: &str, deadline: Instant, timeout: Duration) -> Result<()> {
        let mut cmd = self.base_command();
        cmd.arg("-c")
            .arg(VALIDATION_SCRIPT)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(code.as_bytes()).await?;
        }

        let output = tokio::time::timeout_at(deadline, child.wait_with_output())
            .await
            .map_err(|_| ExecError::Timeout(timeout))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_validation(&stdout)
    }
}

#[async_trait]
impl PythonEngine for NativePythonEngine {
    async fn validate(&self, code: &str, options: &ExecutionOptions) -> Result<()> {
        self.check_syntax(code, Instant::now() + options.timeout, options.timeout)
            .await
    }

    async fn execute(&self, code: &str, options: &ExecutionOptions) -> Result<RenderOutput> {
        // One deadline covers validation and the render
        let deadline = Instant::now() + options.timeout;
        self.check_syntax(code, deadline, options.timeout).await?;

        let mut workspace = IsolatedWorkspace::new(&self.workspace_base)?;
        if self.keep_workspaces {
            workspace.keep();
        }
        let submission = workspace.write_submission(code)?;

        let mut cmd = self.base_command();
        cmd.arg("-c")
            .arg(self.runner_script(options))
            .current_dir(&workspace.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PLOTRUN_SUBMISSION", &submission);

        // Set thread limits
        cmd.env("OMP_NUM_THREADS", self.limits.max_threads.to_string())
            .env("OPENBLAS_NUM_THREADS", self.limits.max_threads.to_string())
            .env("MKL_NUM_THREADS", self.limits.max_threads.to_string());
        for (key, value) in &options.env_vars {
            cmd.env(key, value);
        }

        self.apply_resource_limits(
            &mut cmd,
            &self.limits,
            cpu_limit_secs(&self.limits, options.timeout),
        );

        // Execute with timeout
        let child = cmd.spawn()?;
        let pid = child.id();

        match tokio::time::timeout_at(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);

                if let Some(report) = parse_report(&stdout) {
                    let rendered = report?;
                    if rendered.png.is_none() {
                        debug!(
                            "[ENGINE] No image produced; workspace files: {:?}",
                            workspace.list_files().unwrap_or_default()
                        );
                    }
                    return Ok(rendered);
                }

                // The runner never got to report: interpreter crashed or was killed
                if !output.status.success() {
                    let err = classify_exit(exit_signal(&output.status), &stderr, options.timeout);
                    if matches!(err, ExecError::Timeout(_)) {
                        kill_process_group(pid);
                    }
                    return Err(err);
                }

                Err(ExecError::InternalError(
                    "interpreter exited without a report".to_string(),
                ))
            }
            Ok(Err(e)) => Err(ExecError::IoError(e)),
            Err(_) => {
                warn!(
                    "[ENGINE] Render exceeded {:?}, killing process group",
                    options.timeout
                );
                kill_process_group(pid);
                Err(ExecError::Timeout(options.timeout))
            }
        }
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities {
            name: "Native Python (process per request)".to_string(),
            python: self.python_path.display().to_string(),
            limits: self.limits.clone(),
            process_per_request: true,
        }
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// JSON document the runner prints between the report markers
#[derive(Debug, Deserialize)]
struct RunnerReport {
    stdout: Option<String>,
    stderr: Option<String>,
    png: Option<String>,
    #[serde(default)]
    figures: usize,
    #[serde(default)]
    fallback: bool,
    error: Option<String>,
    error_kind: Option<String>,
    trace: Option<String>,
}

/// Extract the runner report from interpreter stdout
///
/// Returns `None` when no complete report is present.
fn parse_report(stdout: &str) -> Option<Result<RenderOutput>> {
    let start = stdout.rfind(REPORT_START)?;
    let body = &stdout[start + REPORT_START.len()..];
    let end = body.find(REPORT_END)?;
    let report: RunnerReport = match serde_json::from_str(body[..end].trim()) {
        Ok(r) => r,
        Err(e) => return Some(Err(e.into())),
    };

    if let Some(error) = report.error.filter(|e| !e.is_empty()) {
        let trace = report.trace.unwrap_or_default();
        return Some(Err(match report.error_kind.as_deref() {
            Some("syntax") => ExecError::SyntaxError {
                message: error,
                trace,
            },
            _ => ExecError::RuntimeError {
                message: error,
                trace,
            },
        }));
    }

    let png = match report.png {
        Some(data) => match base64::engine::general_purpose::STANDARD.decode(data) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                return Some(Err(ExecError::InternalError(format!(
                    "undecodable image payload: {}",
                    e
                ))))
            }
        },
        None => None,
    };

    Some(Ok(RenderOutput {
        png,
        figures: report.figures,
        from_fallback: report.fallback,
        stdout: report.stdout,
        stderr: report.stderr,
    }))
}

fn parse_validation(stdout: &str) -> Result<()> {
    match stdout.strip_prefix(SYNTAX_MARKER) {
        Some(rest) => {
            let (message, trace) = rest.split_once('\n').unwrap_or((rest, ""));
            Err(ExecError::SyntaxError {
                message: message.trim().to_string(),
                trace: trace.to_string(),
            })
        }
        None => Ok(()),
    }
}

fn last_line(text: &str) -> &str {
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("interpreter exited abnormally")
}

/// Render a string as a Python literal
fn py_str(value: &str) -> String {
    // JSON string syntax is a subset of Python's
    serde_json::Value::String(value.to_string()).to_string()
}

fn py_list(values: &[String]) -> String {
    format!(
        "[{}]",
        values
            .iter()
            .map(|v| py_str(v))
            .collect::<Vec<_>>()
            .join(", ")
    )
}
