//! HAProxy runtime API client
//!
//! One text command per connection over the stats socket. The runtime API
//! answers an empty line on success and a human readable message on
//! failure, so responses are inspected for known error markers.
//!
//! Every exchange is bounded by a timeout. A proxy that stops answering
//! fails the command, which sends the pass down the reload path instead of
//! stalling the reconciliation loop.

use crate::error::ProxyError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

const ERROR_MARKERS: &[&str] = &["No such", "Unknown", "Require", "invalid", "Invalid", "Can't", "cannot"];

/// Channel for live commands to the running proxy
#[async_trait]
pub trait RuntimeApi: Send + Sync {
    /// Execute one command, returning the proxy's response
    async fn execute(&self, command: &str) -> Result<String, ProxyError>;
}

/// Runtime API over a Unix stream socket
#[derive(Debug, Clone)]
pub struct UnixSocketRuntime {
    socket: PathBuf,
    timeout: Duration,
}

impl UnixSocketRuntime {
    pub fn new(socket: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket: socket.into(),
            timeout,
        }
    }

    fn error(&self, message: impl Into<String>) -> ProxyError {
        ProxyError::Runtime {
            socket: self.socket.display().to_string(),
            message: message.into(),
        }
    }

    async fn exchange(&self, command: &str) -> Result<String, ProxyError> {
        let mut stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|e| self.error(format!("connect failed: {e}")))?;

        stream
            .write_all(format!("{command}\n").as_bytes())
            .await
            .map_err(|e| self.error(format!("write failed: {e}")))?;
        stream
            .shutdown()
            .await
            .map_err(|e| self.error(format!("shutdown failed: {e}")))?;

        let mut response = String::new();
        stream
            .read_to_string(&mut response)
            .await
            .map_err(|e| self.error(format!("read failed: {e}")))?;
        Ok(response)
    }
}

#[async_trait]
impl RuntimeApi for UnixSocketRuntime {
    async fn execute(&self, command: &str) -> Result<String, ProxyError> {
        let response = tokio::time::timeout(self.timeout, self.exchange(command))
            .await
            .map_err(|_| self.error(format!("timed out after {:?}", self.timeout)))??;

        let response = response.trim().to_string();
        debug!(command = %command, response = %response, "Runtime command executed");

        if is_error_response(&response) {
            return Err(self.error(format!("{command}: {response}")));
        }
        Ok(response)
    }
}

pub(crate) fn is_error_response(response: &str) -> bool {
    ERROR_MARKERS.iter().any(|marker| response.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::UnixListener;

    /// Answer each connection with `reply`, returning the received lines
    fn serve(listener: UnixListener, reply: &'static str) -> tokio::task::JoinHandle<Vec<String>> {
        tokio::spawn(async move {
            let mut received = Vec::new();
            while let Ok(Ok((stream, _))) =
                tokio::time::timeout(Duration::from_millis(200), listener.accept()).await
            {
                let (read, mut write) = stream.into_split();
                let mut line = String::new();
                tokio::io::BufReader::new(read).read_line(&mut line).await.unwrap();
                received.push(line.trim().to_string());
                write.write_all(reply.as_bytes()).await.unwrap();
            }
            received
        })
    }

    #[test]
    fn test_error_markers() {
        assert!(is_error_response("No such server."));
        assert!(is_error_response("Require 'backend/server'."));
        assert!(!is_error_response(""));
        assert!(!is_error_response("IP changed from '10.0.0.1' to '10.0.0.2'"));
    }

    #[tokio::test]
    async fn test_command_round_trip() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("haproxy.sock");
        let server = serve(UnixListener::bind(&socket).unwrap(), "\n");

        let runtime = UnixSocketRuntime::new(&socket, Duration::from_secs(1));
        let response = runtime.execute("set server b/srv0 weight 3").await.unwrap();
        assert_eq!(response, "");

        let received = server.await.unwrap();
        assert_eq!(received, vec!["set server b/srv0 weight 3"]);
    }

    #[tokio::test]
    async fn test_error_reply_is_failure() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("haproxy.sock");
        let _server = serve(UnixListener::bind(&socket).unwrap(), "No such server.\n");

        let runtime = UnixSocketRuntime::new(&socket, Duration::from_secs(1));
        let err = runtime.execute("enable server b/srv9").await.unwrap_err();
        assert!(matches!(err, ProxyError::Runtime { .. }));
    }

    #[tokio::test]
    async fn test_missing_socket_is_failure() {
        let runtime = UnixSocketRuntime::new("/nonexistent/haproxy.sock", Duration::from_secs(1));
        assert!(runtime.execute("show info").await.is_err());
    }

    #[tokio::test]
    async fn test_silent_proxy_times_out() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("haproxy.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let _server = tokio::spawn(async move {
            // Accept and hold the connection without answering
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let runtime = UnixSocketRuntime::new(&socket, Duration::from_millis(100));
        let err = runtime.execute("set server b/srv0 weight 3").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
