use anyhow::Context;
use clap::Parser;
use plotrun::{logging, AppState, NativePythonEngine, PythonEngine, ServiceConfig};
use std::path::PathBuf;
use std::sync::Arc;

/// HTTP service that renders matplotlib code to PNG
#[derive(Debug, Parser)]
#[command(name = "plotrun-server", version)]
struct Args {
    /// Listen address (overrides PLOTRUN_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides PLOTRUN_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Python interpreter to run submissions with
    #[arg(long)]
    python: Option<PathBuf>,

    /// Directory receiving rendered images
    #[arg(long)]
    picture_dir: Option<PathBuf>,

    /// Service log file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    fn apply(self, config: &mut ServiceConfig) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(python) = self.python {
            config.python_path = Some(python);
        }
        if let Some(dir) = self.picture_dir {
            config.picture_dir = dir;
        }
        if let Some(file) = self.log_file {
            config.log_file = file;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = ServiceConfig::from_env().context("invalid PLOTRUN_* configuration")?;
    args.apply(&mut config);

    logging::init_logging(&config).context("failed to initialize logging")?;

    let engine = NativePythonEngine::from_config(&config)
        .context("no usable Python interpreter (set PLOTRUN_PYTHON_PATH or --python)")?;
    tracing::info!(
        "plotrun-server starting (python={}, picture_dir={:?}, max_concurrent={})",
        engine.python_path().display(),
        config.picture_dir,
        config.max_concurrent_renders
    );
    tracing::debug!("Engine capabilities: {:?}", engine.capabilities());

    let state = AppState::new(config, Arc::new(engine));
    plotrun::serve(state).await?;

    tracing::info!("plotrun-server stopped");
    Ok(())
}
