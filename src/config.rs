use crate::errors::{ExecError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Longest wall-clock deadline a request may ask for
pub const MAX_TIMEOUT_SECS: u64 = 600;

/// Resource limits applied to every interpreter process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum address space in MB
    pub memory_mb: usize,
    /// Maximum CPU time in seconds
    pub cpu_seconds: u64,
    /// Maximum number of processes for the service user (unset leaves the inherited limit)
    pub max_processes: Option<u64>,
    /// Maximum number of threads for scientific libraries
    pub max_threads: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 2048,
            cpu_seconds: 60,
            max_processes: None,
            max_threads: 4,
        }
    }
}

impl ResourceLimits {
    /// Address-space limit in bytes, `None` when it does not fit the platform
    pub fn memory_bytes(&self) -> Option<u64> {
        u64::try_from(self.memory_mb).ok()?.checked_mul(1024 * 1024)
    }
}

/// A library handle pre-bound as a name visible to the submission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Binding {
    /// Name the submission sees
    pub name: String,
    /// Module to import
    pub module: String,
    /// Attribute taken from the module (`from module import attr`)
    pub attr: Option<String>,
}

impl Binding {
    pub fn module(name: &str, module: &str) -> Self {
        Self {
            name: name.to_string(),
            module: module.to_string(),
            attr: None,
        }
    }

    pub fn attr(name: &str, module: &str, attr: &str) -> Self {
        Self {
            name: name.to_string(),
            module: module.to_string(),
            attr: Some(attr.to_string()),
        }
    }
}

/// What the submission can reach without importing anything
///
/// The builtin allow-list is a convenience restriction, not a security boundary:
/// `__import__`, `exec`, `eval` and `open` stay available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPolicy {
    /// Builtins exposed to the submission; everything else is absent
    pub allowed_builtins: Vec<String>,
    /// Library handles injected before evaluation
    pub bindings: Vec<Binding>,
    /// matplotlib `font.sans-serif` preference list
    pub font_families: Vec<String>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            allowed_builtins: Self::default_builtins(),
            bindings: Self::default_bindings(),
            font_families: ["Arial", "Helvetica", "DejaVu Sans"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl SandboxPolicy {
    pub fn default_builtins() -> Vec<String> {
        [
            "__import__",
            // class statements
            "__build_class__",
            "print",
            "len",
            "range",
            "list",
            "dict",
            "tuple",
            "set",
            "str",
            "int",
            "float",
            "bool",
            "exec",
            "eval",
            "enumerate",
            "zip",
            "map",
            "filter",
            "sorted",
            "reversed",
            "min",
            "max",
            "sum",
            "abs",
            "round",
            "any",
            "all",
            "isinstance",
            "hasattr",
            "getattr",
            "setattr",
            "dir",
            "open",
            "type",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    pub fn default_bindings() -> Vec<Binding> {
        vec![
            Binding::module("plt", "matplotlib.pyplot"),
            Binding::module("np", "numpy"),
            Binding::attr("Image", "PIL", "Image"),
            Binding::module("io", "io"),
            Binding::module("base64", "base64"),
            Binding::module("time", "time"),
            Binding::module("matplotlib", "matplotlib"),
        ]
    }
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    /// Explicit interpreter; `None` searches PATH
    pub python_path: Option<PathBuf>,
    /// Directory receiving one PNG per successful request
    pub picture_dir: PathBuf,
    /// Base directory for per-request scratch workspaces
    pub workspace_base: PathBuf,
    /// Leave workspaces on disk after each render, for debugging
    pub keep_workspaces: bool,
    pub log_file: PathBuf,
    pub log_max_bytes: u64,
    pub log_backup_count: usize,
    /// Deadline applied when a request does not carry one
    pub default_timeout_secs: u64,
    pub dpi: u32,
    pub max_concurrent_renders: usize,
    pub limits: ResourceLimits,
    pub policy: SandboxPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            python_path: None,
            picture_dir: PathBuf::from("picture"),
            workspace_base: std::env::temp_dir().join("plotrun-workspaces"),
            keep_workspaces: false,
            log_file: PathBuf::from("api.log"),
            log_max_bytes: 10 * 1024 * 1024,
            log_backup_count: 5,
            default_timeout_secs: 30,
            dpi: 150,
            max_concurrent_renders: 4,
            limits: ResourceLimits::default(),
            policy: SandboxPolicy::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from `PLOTRUN_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut cfg = Self::default();

        if let Some(v) = get("PLOTRUN_HOST") {
            cfg.host = v;
        }
        if let Some(v) = get("PLOTRUN_PORT") {
            cfg.port = parse_var("PLOTRUN_PORT", &v)?;
        }
        if let Some(v) = get("PLOTRUN_PYTHON_PATH") {
            cfg.python_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("PLOTRUN_PICTURE_DIR") {
            cfg.picture_dir = PathBuf::from(v);
        }
        if let Some(v) = get("PLOTRUN_WORKSPACE_DIR") {
            cfg.workspace_base = PathBuf::from(v);
        }
        if let Some(v) = get("PLOTRUN_KEEP_WORKSPACES") {
            cfg.keep_workspaces = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = get("PLOTRUN_LOG_FILE") {
            cfg.log_file = PathBuf::from(v);
        }
        if let Some(v) = get("PLOTRUN_LOG_MAX_BYTES") {
            cfg.log_max_bytes = parse_var("PLOTRUN_LOG_MAX_BYTES", &v)?;
        }
        if let Some(v) = get("PLOTRUN_LOG_BACKUPS") {
            cfg.log_backup_count = parse_var("PLOTRUN_LOG_BACKUPS", &v)?;
        }
        if let Some(v) = get("PLOTRUN_DEFAULT_TIMEOUT") {
            cfg.default_timeout_secs = parse_var("PLOTRUN_DEFAULT_TIMEOUT", &v)?;
        }
        if let Some(v) = get("PLOTRUN_DPI") {
            cfg.dpi = parse_var("PLOTRUN_DPI", &v)?;
        }
        if let Some(v) = get("PLOTRUN_MAX_CONCURRENT") {
            cfg.max_concurrent_renders = parse_var("PLOTRUN_MAX_CONCURRENT", &v)?;
        }
        if let Some(v) = get("PLOTRUN_MEMORY_MB") {
            cfg.limits.memory_mb = parse_var("PLOTRUN_MEMORY_MB", &v)?;
        }
        if let Some(v) = get("PLOTRUN_CPU_SECONDS") {
            cfg.limits.cpu_seconds = parse_var("PLOTRUN_CPU_SECONDS", &v)?;
        }
        if let Some(v) = get("PLOTRUN_MAX_PROCESSES") {
            cfg.limits.max_processes = Some(parse_var("PLOTRUN_MAX_PROCESSES", &v)?);
        }
        if let Some(v) = get("PLOTRUN_FONTS") {
            cfg.policy.font_families = split_list(&v);
        }
        if let Some(v) = get("PLOTRUN_ALLOWED_BUILTINS") {
            cfg.policy.allowed_builtins = split_list(&v);
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dpi == 0 {
            return Err(ExecError::InternalError("dpi must be positive".to_string()));
        }
        if self.max_concurrent_renders == 0 {
            return Err(ExecError::InternalError(
                "max_concurrent_renders must be positive".to_string(),
            ));
        }
        if self.limits.memory_mb == 0 || self.limits.memory_bytes().is_none() {
            return Err(ExecError::InternalError(format!(
                "memory limit of {} MB is out of range",
                self.limits.memory_mb
            )));
        }
        if self.default_timeout_secs == 0 || self.default_timeout_secs > MAX_TIMEOUT_SECS {
            return Err(ExecError::InternalError(format!(
                "default timeout must be between 1 and {} seconds",
                MAX_TIMEOUT_SECS
            )));
        }
        Ok(())
    }

    /// Wall-clock deadline for a request, clamped to the accepted range
    pub fn request_timeout(&self, requested_secs: Option<u64>) -> Duration {
        let secs = requested_secs
            .unwrap_or(self.default_timeout_secs)
            .clamp(1, MAX_TIMEOUT_SECS);
        Duration::from_secs(secs)
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| ExecError::InternalError(format!("invalid value for {}: {:?}", key, value)))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let cfg = ServiceConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.dpi, 150);
        assert_eq!(cfg.picture_dir, PathBuf::from("picture"));
        assert_eq!(cfg.log_file, PathBuf::from("api.log"));
        assert_eq!(cfg.log_backup_count, 5);
        assert!(cfg.python_path.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let cfg = ServiceConfig::from_lookup(lookup(&[
            ("PLOTRUN_PORT", "9100"),
            ("PLOTRUN_DPI", " 72 "),
            ("PLOTRUN_FONTS", "SimHei, DejaVu Sans,"),
            ("PLOTRUN_MAX_PROCESSES", "64"),
            ("PLOTRUN_HOST", ""),
            ("PLOTRUN_KEEP_WORKSPACES", "True"),
        ]))
        .unwrap();
        assert!(cfg.keep_workspaces);
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.dpi, 72);
        assert_eq!(cfg.policy.font_families, vec!["SimHei", "DejaVu Sans"]);
        assert_eq!(cfg.limits.max_processes, Some(64));
        assert_eq!(cfg.host, "0.0.0.0");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ServiceConfig::from_lookup(lookup(&[("PLOTRUN_PORT", "http")])).is_err());
        assert!(ServiceConfig::from_lookup(lookup(&[("PLOTRUN_DPI", "0")])).is_err());
        assert!(ServiceConfig::from_lookup(lookup(&[("PLOTRUN_DEFAULT_TIMEOUT", "9999")])).is_err());
    }

    #[test]
    fn test_memory_limit_range() {
        assert!(ServiceConfig::from_lookup(lookup(&[("PLOTRUN_MEMORY_MB", "0")])).is_err());
        let huge = usize::MAX.to_string();
        assert!(ServiceConfig::from_lookup(lookup(&[("PLOTRUN_MEMORY_MB", huge.as_str())])).is_err());

        let cfg = ServiceConfig::from_lookup(lookup(&[("PLOTRUN_MEMORY_MB", "512")])).unwrap();
        assert_eq!(cfg.limits.memory_bytes(), Some(512 * 1024 * 1024));
    }

    #[test]
    fn test_request_timeout_clamped() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.request_timeout(None), Duration::from_secs(30));
        assert_eq!(cfg.request_timeout(Some(0)), Duration::from_secs(1));
        assert_eq!(cfg.request_timeout(Some(5)), Duration::from_secs(5));
        assert_eq!(
            cfg.request_timeout(Some(100_000)),
            Duration::from_secs(MAX_TIMEOUT_SECS)
        );
    }

    #[test]
    fn test_default_policy_omits_unlisted_builtins() {
        let policy = SandboxPolicy::default();
        assert!(policy.allowed_builtins.iter().any(|b| b == "print"));
        assert!(policy.allowed_builtins.iter().any(|b| b == "open"));
        assert!(!policy.allowed_builtins.iter().any(|b| b == "compile"));
        assert!(!policy.allowed_builtins.iter().any(|b| b == "globals"));
        let names: Vec<_> = policy.bindings.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["plt", "np", "Image", "io", "base64", "time", "matplotlib"]
        );
    }
}
