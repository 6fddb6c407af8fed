//! Proxy binary invocation
//!
//! Validation and reload are delegated to the proxy binary itself; success
//! is the process exit status.

use crate::error::ProxyError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Syntax check and in-place reload of a proxy process
#[async_trait]
pub trait ProxyProcess: Send + Sync {
    /// Run the proxy's own configuration checker on `config`
    async fn validate(&self, config: &Path) -> Result<(), ProxyError>;

    /// Reload the running proxy with `config`
    async fn reload(&self, config: &Path) -> Result<(), ProxyError>;
}

/// HAProxy started in daemon mode, old processes finish gracefully (`-sf`)
#[derive(Debug, Clone)]
pub struct HaproxyBinary {
    binary: PathBuf,
    pid_file: PathBuf,
}

impl HaproxyBinary {
    pub fn new(binary: impl Into<PathBuf>, pid_file: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            pid_file: pid_file.into(),
        }
    }

    async fn running_pids(&self) -> Vec<String> {
        match tokio::fs::read_to_string(&self.pid_file).await {
            Ok(content) => parse_pids(&content),
            Err(_) => Vec::new(),
        }
    }
}

#[async_trait]
impl ProxyProcess for HaproxyBinary {
    async fn validate(&self, config: &Path) -> Result<(), ProxyError> {
        let config = config.to_string_lossy().to_string();
        run(&self.binary, &["-c".to_string(), "-f".to_string(), config]).await
    }

    async fn reload(&self, config: &Path) -> Result<(), ProxyError> {
        let mut args = vec![
            "-D".to_string(),
            "-f".to_string(),
            config.to_string_lossy().to_string(),
            "-p".to_string(),
            self.pid_file.to_string_lossy().to_string(),
        ];
        let pids = self.running_pids().await;
        if !pids.is_empty() {
            args.push("-sf".to_string());
            args.extend(pids.iter().cloned());
        }

        run(&self.binary, &args).await?;
        info!(old_pids = ?pids, "HAProxy reloaded");
        Ok(())
    }
}

/// NGINX signalled through its master process
#[derive(Debug, Clone)]
pub struct NginxBinary {
    binary: PathBuf,
}

impl NginxBinary {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl ProxyProcess for NginxBinary {
    async fn validate(&self, config: &Path) -> Result<(), ProxyError> {
        let config = config.to_string_lossy().to_string();
        run(&self.binary, &["-t".to_string(), "-c".to_string(), config]).await
    }

    async fn reload(&self, config: &Path) -> Result<(), ProxyError> {
        let config = config.to_string_lossy().to_string();
        run(
            &self.binary,
            &["-s".to_string(), "reload".to_string(), "-c".to_string(), config],
        )
        .await?;
        info!("NGINX reloaded");
        Ok(())
    }
}

async fn run(binary: &Path, args: &[String]) -> Result<(), ProxyError> {
    let command = format!("{} {}", binary.display(), args.join(" "));
    debug!(command = %command, "Running proxy command");

    let output = Command::new(binary)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ProxyError::Spawn {
            command: command.clone(),
            source,
        })?;

    if output.status.success() {
        Ok(())
    } else {
        Err(ProxyError::Command {
            command,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// PIDs from a pid file, one or more per line
fn parse_pids(content: &str) -> Vec<String> {
    content
        .split_whitespace()
        .filter(|pid| pid.parse::<u32>().is_ok())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pids() {
        assert_eq!(parse_pids("123\n456\n"), vec!["123", "456"]);
        assert!(parse_pids("").is_empty());
        assert_eq!(parse_pids("12 junk 34"), vec!["12", "34"]);
    }

    #[tokio::test]
    async fn test_exit_status_decides_outcome() {
        let ok = NginxBinary::new("true");
        assert!(ok.validate(Path::new("/tmp/nginx.conf")).await.is_ok());

        let failing = NginxBinary::new("false");
        let err = failing.validate(Path::new("/tmp/nginx.conf")).await.unwrap_err();
        assert!(matches!(err, ProxyError::Command { .. }));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let missing = HaproxyBinary::new("/nonexistent/haproxy", "/tmp/haproxy.pid");
        let err = missing.validate(Path::new("/tmp/haproxy.cfg")).await.unwrap_err();
        assert!(matches!(err, ProxyError::Spawn { .. }));
    }
}
