use crate::config::{ResourceLimits, SandboxPolicy};
use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options for one render
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Wall clock timeout
    pub timeout: Duration,
    /// Rasterization resolution
    pub dpi: u32,
    /// Builtins, bindings and fonts visible to the submission
    pub policy: SandboxPolicy,
    /// Environment variables to set
    pub env_vars: std::collections::HashMap<String, String>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            dpi: 150,
            policy: SandboxPolicy::default(),
            env_vars: std::collections::HashMap::new(),
        }
    }
}

/// What a render produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderOutput {
    /// PNG bytes of the most recent figure, if any
    pub png: Option<Vec<u8>>,
    /// Figures open when evaluation finished
    pub figures: usize,
    /// Image was read from the show-to-save fallback file
    pub from_fallback: bool,
    /// Captured standard output of the submission
    pub stdout: Option<String>,
    /// Captured standard error of the submission
    pub stderr: Option<String>,
}

/// Capabilities of a Python execution engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineCapabilities {
    /// Engine name
    pub name: String,
    /// Interpreter in use
    pub python: String,
    /// Limits applied to each render
    pub limits: ResourceLimits,
    /// Whether each render gets its own interpreter process
    pub process_per_request: bool,
}

/// Trait for engines that turn plotting code into an image
///
/// Implementations must not share plotting state between concurrent calls.
#[async_trait]
pub trait PythonEngine: Send + Sync {
    /// Validate code before execution
    async fn validate(&self, code: &str, options: &ExecutionOptions) -> Result<()>;

    /// Execute normalized code and rasterize the current figure
    async fn execute(&self, code: &str, options: &ExecutionOptions) -> Result<RenderOutput>;

    /// Get engine capabilities
    fn capabilities(&self) -> EngineCapabilities;

    /// Shutdown the engine
    async fn shutdown(&self) -> Result<()>;
}
