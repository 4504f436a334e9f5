//! Control-socket client used by the CLI.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::net::UnixStream;

use super::messages::{DaemonStatus, IpcRequest, IpcResponse};
use super::transport::JsonLines;
use super::IpcError;
use crate::session::SessionInfo;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct IpcClient {
    transport: JsonLines,
    timeout: Duration,
}

impl IpcClient {
    /// Connects to a running daemon. Fails fast when none is listening.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, DEFAULT_TIMEOUT).await
    }

    /// Connects with `timeout` applied to the connect and to every request.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connect timed out"))??;

        Ok(Self {
            transport: JsonLines::new(stream),
            timeout,
        })
    }

    /// Sends one request and waits for its response.
    pub async fn request(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let timeout = self.timeout;
        let exchange = async {
            self.transport.send(&request).await?;
            match self.transport.recv::<IpcResponse>().await? {
                Some(response) => Ok(response),
                None => Err(IpcError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "daemon closed the connection",
                ))),
            }
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| timed_out("request timed out"))?
    }

    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        Ok(matches!(self.request(IpcRequest::Ping).await?, IpcResponse::Pong))
    }

    pub async fn status(&mut self) -> Result<DaemonStatus, IpcError> {
        match self.request(IpcRequest::Status).await? {
            IpcResponse::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn stop(&mut self) -> Result<(), IpcError> {
        match self.request(IpcRequest::Stop).await? {
            IpcResponse::Stopping => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_sessions(&mut self) -> Result<Vec<SessionInfo>, IpcError> {
        match self.request(IpcRequest::ListSessions).await? {
            IpcResponse::Sessions { sessions } => Ok(sessions),
            other => Err(unexpected(other)),
        }
    }

    pub async fn kill_session(&mut self, session_id: &str) -> Result<(), IpcError> {
        let request = IpcRequest::KillSession {
            session_id: session_id.to_string(),
        };
        match self.request(request).await? {
            IpcResponse::SessionKilled { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn managed_pids(&mut self) -> Result<Vec<u32>, IpcError> {
        match self.request(IpcRequest::ManagedPids).await? {
            IpcResponse::Pids { pids } => Ok(pids),
            other => Err(unexpected(other)),
        }
    }
}

fn timed_out(message: &'static str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, message))
}

fn unexpected(response: IpcResponse) -> IpcError {
    match response {
        IpcResponse::Error { message } => IpcError::Daemon(message),
        other => IpcError::UnexpectedResponse(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::server::IpcServer;
    use tempfile::tempdir;
    use tokio_util::sync::CancellationToken;

    async fn serve_fixture(socket_path: &Path) -> CancellationToken {
        let server = IpcServer::bind(socket_path).await.unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.serve(
            |request| async move {
                match request {
                    IpcRequest::Ping => IpcResponse::Pong,
                    IpcRequest::Status => IpcResponse::Status(DaemonStatus {
                        pid: 1,
                        uptime_secs: 100,
                        listen_addr: "127.0.0.1:7681".to_string(),
                        session_count: 2,
                        connection_count: 1,
                    }),
                    IpcRequest::Stop => IpcResponse::Stopping,
                    IpcRequest::ListSessions => IpcResponse::Sessions { sessions: vec![] },
                    IpcRequest::KillSession { session_id } if session_id == "live" => {
                        IpcResponse::SessionKilled { session_id }
                    }
                    IpcRequest::KillSession { session_id } => {
                        IpcResponse::error(format!("session not found: {session_id}"))
                    }
                    IpcRequest::ManagedPids => IpcResponse::Pids { pids: vec![10, 20] },
                }
            },
            cancel.clone(),
        ));
        cancel
    }

    #[tokio::test]
    async fn test_connect_fails_without_daemon() {
        let temp_dir = tempdir().unwrap();
        let result = IpcClient::connect(&temp_dir.path().join("missing.sock")).await;
        assert!(matches!(result, Err(IpcError::Io(_))));
    }

    #[tokio::test]
    async fn test_requests_over_one_connection() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let cancel = serve_fixture(&socket_path).await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        assert!(client.ping().await.unwrap());

        let status = client.status().await.unwrap();
        assert_eq!(status.uptime_secs, 100);
        assert_eq!(status.session_count, 2);

        assert!(client.list_sessions().await.unwrap().is_empty());
        assert_eq!(client.managed_pids().await.unwrap(), vec![10, 20]);
        client.kill_session("live").await.unwrap();
        client.stop().await.unwrap();

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_daemon_error_surfaces() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let cancel = serve_fixture(&socket_path).await;

        let mut client = IpcClient::connect(&socket_path).await.unwrap();
        match client.kill_session("gone").await {
            Err(IpcError::Daemon(message)) => assert!(message.contains("gone")),
            other => panic!("expected daemon error, got {other:?}"),
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_request_times_out() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let _silent = tokio::spawn(async move {
            let _conn = server.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let mut client = IpcClient::connect_with_timeout(&socket_path, Duration::from_millis(100))
            .await
            .unwrap();
        match client.ping().await {
            Err(IpcError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::TimedOut),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
