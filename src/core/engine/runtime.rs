//! Isolated execution environments for engine builds
//!
//! Engines run inside containers created from their configured image. The
//! runtime is a trait so the orchestrator never depends on Docker directly.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use crate::core::error::{Error, Result};

/// A host path bound into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: true,
        }
    }

    pub fn read_write(host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            container: container.into(),
            read_only: false,
        }
    }
}

/// Container lifecycle operations needed by graph builders
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Create a stopped container and return its id
    async fn create(&self, image: &str, mounts: &[Mount]) -> Result<String>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Run `cmd` in a started container, returning exit code and combined output
    async fn exec(&self, id: &str, cmd: &[String]) -> Result<(i32, String)>;

    /// Stop a container; succeeds if it is already stopped or gone
    async fn stop(&self, id: &str) -> Result<()>;

    /// Remove a container; succeeds if it is already gone
    async fn remove(&self, id: &str) -> Result<()>;
}

/// Runtime driving the `docker` command line client
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn docker(&self, args: &[String]) -> Result<std::process::Output> {
        debug!("Running {} {}", self.binary.display(), args.join(" "));
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(output)
    }

    async fn docker_checked(&self, args: &[String]) -> Result<String> {
        let output = self.docker(args).await?;
        if !output.status.success() {
            return Err(Error::Runtime(format!(
                "docker {} failed: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Like `docker_checked`, but a missing container is not an error
    async fn docker_idempotent(&self, args: &[String]) -> Result<()> {
        let output = self.docker(args).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() || stderr.contains("No such container") {
            return Ok(());
        }
        Err(Error::Runtime(format!(
            "docker {} failed: {}",
            args.first().map(String::as_str).unwrap_or_default(),
            stderr.trim()
        )))
    }
}

/// `-v` argument for a mount, with the host side made absolute
fn volume_arg(mount: &Mount) -> Result<String> {
    let host = absolute(&mount.host)?;
    let mode = if mount.read_only { "ro" } else { "rw" };
    Ok(format!("{}:{}:{mode}", host.display(), mount.container))
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        let args = ["image", "inspect", "--format", "{{.Id}}", image].map(String::from);
        Ok(self.docker(&args).await?.status.success())
    }

    async fn create(&self, image: &str, mounts: &[Mount]) -> Result<String> {
        // Keep the container alive so build commands can be exec'd into it
        let mut args = vec![
            "create".to_string(),
            "--entrypoint".to_string(),
            "tail".to_string(),
        ];
        for mount in mounts {
            args.push("-v".to_string());
            args.push(volume_arg(mount)?);
        }
        args.extend([image, "-f", "/dev/null"].map(String::from));

        self.docker_checked(&args).await
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker_checked(&["start".to_string(), id.to_string()])
            .await
            .map(|_| ())
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<(i32, String)> {
        let mut args = vec!["exec".to_string(), id.to_string()];
        args.extend(cmd.iter().cloned());

        let output = self.docker(&args).await?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.code().unwrap_or(-1), text))
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.docker_idempotent(&["stop".to_string(), id.to_string()])
            .await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.docker_idempotent(&["rm".to_string(), "-f".to_string(), id.to_string()])
            .await
    }
}
