use crate::engine::RenderOutput;
use crate::errors::{ExecError, Result};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// First eight bytes of every PNG file
pub const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Persisted image file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    /// Bare file name, also used for `Content-Disposition`
    pub file_name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// A persisted render and the bytes to send back
#[derive(Debug, Clone)]
pub struct Emitted {
    pub artifact: Artifact,
    pub png: Vec<u8>,
}

/// Writes rendered figures into the picture directory
#[derive(Debug, Clone)]
pub struct FigureEmitter {
    output_dir: PathBuf,
}

impl FigureEmitter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Persist a render as `output_<timestamp>.png`
    ///
    /// The timestamp is the one sampled when the request arrived. When the
    /// name is already taken, `output_<timestamp>_<n>.png` with the smallest
    /// free `n` is used instead.
    pub fn emit(&self, output: RenderOutput, timestamp: i64) -> Result<Emitted> {
        let png = match output.png {
            Some(png) => png,
            None => return Err(ExecError::NoImageProduced),
        };
        if !png.starts_with(PNG_SIGNATURE) {
            return Err(ExecError::InvalidImage);
        }

        std::fs::create_dir_all(&self.output_dir)?;

        let mut attempt = 0u32;
        loop {
            let file_name = artifact_name(timestamp, attempt);
            let path = self.output_dir.join(&file_name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(&png)?;
                    file.flush()?;
                    if output.from_fallback {
                        debug!("[EMITTER] Image taken from show-to-save fallback");
                    }
                    info!("[EMITTER] Image saved: {:?} ({} bytes)", path, png.len());
                    return Ok(Emitted {
                        artifact: Artifact {
                            file_name,
                            path,
                            size: png.len() as u64,
                        },
                        png,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn artifact_name(timestamp: i64, attempt: u32) -> String {
    match attempt {
        0 => format!("output_{}.png", timestamp),
        n => format!("output_{}_{}.png", timestamp, n),
    }
}
