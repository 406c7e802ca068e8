//! The boundary to the external, untrusted processor that edits masked documents.
//!
//! The processor is opaque: it gets text and optional instructions and returns text, or fails.
//! Retries are its own business.

use crate::config::TransformConfig;
use crate::error::{Error, ErrorType, Res};
use crate::{Config, Result};
use anyhow::{bail, Context};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Environment variable that carries the instructions to a transform command.
pub const INSTRUCTIONS_ENV: &str = "RECONCILE_INSTRUCTIONS";

/// Runs an external transform over a masked document.
#[async_trait::async_trait]
pub trait Transform: Send + Sync {
    /// A short name for logs.
    fn name(&self) -> &str;

    async fn transform(&self, document: &str, instructions: Option<&str>) -> Res<String>;
}

/// This allows for testing the program without an external processor. When
/// `RECONCILE_IN_TEST_MODE` is set and non-zero in length, the mode is `Mode::Test` and the
/// document passes through unchanged.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Mode {
    Live,
    Test,
}

impl Mode {
    pub fn from_env() -> Self {
        match std::env::var("RECONCILE_IN_TEST_MODE") {
            Ok(v) if !v.is_empty() => Mode::Test,
            _ => Mode::Live,
        }
    }
}

/// Builds the transform selected by `mode` and the configuration.
pub fn transform(config: &Config, mode: Mode) -> Result<Box<dyn Transform>> {
    match mode {
        Mode::Test => Ok(Box::new(IdentityTransform)),
        Mode::Live => match config.transform() {
            Some(t) => Ok(Box::new(CommandTransform::new(t.clone()))),
            None => Err(Error::msg(
                ErrorType::Config,
                format!(
                    "No transform is configured, add a \"transform\" section to {}",
                    config.config_path().display()
                ),
            )),
        },
    }
}

/// Returns the document unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

#[async_trait::async_trait]
impl Transform for IdentityTransform {
    fn name(&self) -> &str {
        "identity"
    }

    async fn transform(&self, document: &str, _instructions: Option<&str>) -> Res<String> {
        Ok(document.to_string())
    }
}

/// Spawns a program, writes the document to its stdin and reads the result from its stdout.
/// Instructions are passed in the `RECONCILE_INSTRUCTIONS` environment variable.
#[derive(Debug, Clone)]
pub struct CommandTransform {
    config: TransformConfig,
}

impl CommandTransform {
    pub fn new(config: TransformConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl Transform for CommandTransform {
    fn name(&self) -> &str {
        &self.config.program
    }

    async fn transform(&self, document: &str, instructions: Option<&str>) -> Res<String> {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(instructions) = instructions {
            command.env(INSTRUCTIONS_ENV, instructions);
        }

        debug!("Spawning transform '{}'", self.config.program);
        let mut child = command
            .spawn()
            .with_context(|| format!("Unable to start '{}'", self.config.program))?;

        let mut stdin = child
            .stdin
            .take()
            .context("The transform's stdin is not available")?;
        // The child may start writing before it has read everything, so feed stdin while
        // draining stdout and stderr.
        let write = async move {
            stdin.write_all(document.as_bytes()).await?;
            stdin.shutdown().await
        };
        let (written, output) = tokio::join!(write, child.wait_with_output());
        let output = output.context("The transform did not finish")?;
        match written {
            // A child that stops reading closes the pipe; its exit status decides.
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                debug!("'{}' did not read the whole document", self.config.program)
            }
            Err(e) if output.status.success() => {
                return Err(
                    anyhow::Error::new(e).context("Unable to write the document to the transform")
                )
            }
            _ => {}
        }
        if !output.status.success() {
            bail!(
                "'{}' exited with {}: {}",
                self.config.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        String::from_utf8(output.stdout).context("The transform returned invalid UTF-8")
    }
}
