//! Format normalization for images the embedding model cannot decode.
//!
//! HEIC/HEIF is handed to an external tool configured by the user; the
//! converted JPEG is what gets embedded and filed.

use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

use crate::config::ConverterConfig;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("no converter available for .{format} files")]
    Unavailable { format: String },

    #[error("converter failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub trait FormatConverter: Send + Sync {
    /// Convert `src` into a decodable file placed inside `workdir`.
    fn convert(&self, src: &Path, workdir: &Path) -> Result<PathBuf, ConvertError>;
}

/// Converter used when none is configured.
pub struct NoConverter;

impl FormatConverter for NoConverter {
    fn convert(&self, src: &Path, _workdir: &Path) -> Result<PathBuf, ConvertError> {
        Err(ConvertError::Unavailable {
            format: extension_of(src),
        })
    }
}

/// Runs an external program, substituting `{input}` and `{output}` in its
/// argument list.
#[derive(Debug, Clone)]
pub struct CommandConverter {
    program: String,
    args: Vec<String>,
    extensions: Vec<String>,
    output_extension: String,
}

impl CommandConverter {
    pub fn new(command: &[String], extensions: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            extensions: extensions.iter().map(|e| e.to_lowercase()).collect(),
            output_extension: "jpg".to_string(),
        })
    }

    fn handles(&self, src: &Path) -> bool {
        self.extensions.contains(&extension_of(src))
    }
}

impl FormatConverter for CommandConverter {
    fn convert(&self, src: &Path, workdir: &Path) -> Result<PathBuf, ConvertError> {
        if !self.handles(src) {
            return Err(ConvertError::Unavailable {
                format: extension_of(src),
            });
        }

        let stem = src
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "converted".to_string());

        // Reserve a unique name so same-named sources never clobber each other.
        let output = tempfile::Builder::new()
            .prefix(&format!("{}-", stem))
            .suffix(&format!(".{}", self.output_extension))
            .tempfile_in(workdir)?
            .into_temp_path()
            .keep()
            .map_err(|e| ConvertError::Io(e.error))?;

        let args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &src.to_string_lossy())
                    .replace("{output}", &output.to_string_lossy())
            })
            .collect();

        tracing::debug!(program = %self.program, src = ?src, "Converting image");

        let result = Command::new(&self.program).args(&args).output();
        let outcome = match result {
            Ok(out) if out.status.success() => {
                let written = std::fs::metadata(&output).map(|m| m.len()).unwrap_or(0);
                if written > 0 {
                    Ok(output.clone())
                } else {
                    Err(ConvertError::Failed(format!(
                        "{} produced no output",
                        self.program
                    )))
                }
            }
            Ok(out) => Err(ConvertError::Failed(format!(
                "{} exited with {}: {}",
                self.program,
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ))),
            Err(e) => Err(ConvertError::Failed(format!(
                "could not run {}: {}",
                self.program, e
            ))),
        };

        if outcome.is_err() {
            let _ = std::fs::remove_file(&output);
        }
        outcome
    }
}

/// Converter described by the configuration, or [`NoConverter`].
pub fn from_config(config: &ConverterConfig) -> Box<dyn FormatConverter> {
    match config
        .heic_command
        .as_deref()
        .and_then(|cmd| CommandConverter::new(cmd, &config.extensions))
    {
        Some(converter) => Box::new(converter),
        None => Box::new(NoConverter),
    }
}

/// Whether files with this extension must be converted before embedding.
pub fn needs_conversion(path: &Path, config: &ConverterConfig) -> bool {
    let ext = extension_of(path);
    config.extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext))
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}
