//! Staging a missing runtime dependency next to the test executable.
//!
//! Used once per cycle, after a test launch failed with an
//! [`QtcovError::Environment`] error. The stager either copies the library
//! the loader named from a configured runtime directory, or runs the
//! configured deploy tool (e.g. `windeployqt`) against the executable.

use crate::error::{QtcovError, Result};
use crate::process::{CommandRunner, CommandSpec};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Places runtime dependencies where the executable's loader finds them.
#[async_trait]
pub trait RuntimeStager: Send + Sync {
    /// Stage what `failure` says is missing; returns the staged paths.
    ///
    /// # Errors
    ///
    /// [`QtcovError::Environment`] when nothing could be staged.
    async fn stage(&self, executable: &Path, failure: &QtcovError) -> Result<Vec<PathBuf>>;
}

/// Default stager: copy from runtime directories, then fall back to a
/// deploy tool.
pub struct DependencyStager {
    runtime_dirs: Vec<PathBuf>,
    deploy_tool: Option<PathBuf>,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl DependencyStager {
    pub fn new(
        runtime_dirs: Vec<PathBuf>,
        deploy_tool: Option<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        timeout: Duration,
    ) -> Self {
        Self {
            runtime_dirs,
            deploy_tool,
            runner,
            timeout,
        }
    }

    fn copy_library(&self, library: &str, target_dir: &Path) -> Option<PathBuf> {
        let source = self
            .runtime_dirs
            .iter()
            .map(|dir| dir.join(library))
            .find(|candidate| candidate.is_file())?;
        let dest = target_dir.join(library);

        match std::fs::copy(&source, &dest) {
            Ok(_) => {
                info!("Staged {} from {}", library, source.display());
                Some(dest)
            }
            Err(e) => {
                warn!("Could not copy {} to {}: {}", source.display(), dest.display(), e);
                None
            }
        }
    }

    async fn run_deploy_tool(&self, tool: &Path, executable: &Path, target_dir: &Path) -> Result<bool> {
        let spec = CommandSpec::new(tool, target_dir, self.timeout).arg(executable.display().to_string());
        info!("Running deploy tool: {}", spec);
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            warn!(
                "Deploy tool exited with {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(output.success())
    }
}

#[async_trait]
impl RuntimeStager for DependencyStager {
    async fn stage(&self, executable: &Path, failure: &QtcovError) -> Result<Vec<PathBuf>> {
        let target_dir = executable
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let library = failure.missing_library();

        if let Some(library) = library {
            if let Some(staged) = self.copy_library(library, &target_dir) {
                return Ok(vec![staged]);
            }
            debug!("{} not found in any runtime directory", library);
        }

        if let Some(tool) = &self.deploy_tool {
            if self.run_deploy_tool(tool, executable, &target_dir).await? {
                return Ok(vec![target_dir]);
            }
        }

        Err(QtcovError::environment(
            executable.display().to_string(),
            format!("no runtime dependency could be staged ({})", failure),
            library.map(str::to_string),
        ))
    }
}
