//! Render matplotlib code submissions to PNG.
//!
//! A submission goes through [`normalize`], runs in its own interpreter
//! process via a [`PythonEngine`], and the resulting figure is persisted by
//! the [`FigureEmitter`].
//!
//! ```rust,no_run
//! use plotrun::{normalize, ExecutionOptions, NativePythonEngine, PythonEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = NativePythonEngine::new()?;
//!     let source = normalize("```python\nplt.plot([1, 2, 3])\nplt.show()\n```").source;
//!     let output = engine.execute(&source, &ExecutionOptions::default()).await?;
//!     println!("{} bytes", output.png.map(|p| p.len()).unwrap_or(0));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod emitter;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod logview;
pub mod native;
pub mod preprocess;
pub mod server;
pub mod workspace;

pub use config::{Binding, ResourceLimits, SandboxPolicy, ServiceConfig};
pub use emitter::{Artifact, Emitted, FigureEmitter};
pub use engine::{EngineCapabilities, ExecutionOptions, PythonEngine, RenderOutput};
pub use errors::{ExecError, Result};
pub use native::NativePythonEngine;
pub use preprocess::{normalize, Normalized, Rule};
pub use server::{build_router, serve, AppState};
