//! Control-socket listener.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use super::messages::{IpcRequest, IpcResponse};
use super::transport::JsonLines;
use super::IpcError;

pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Binds the socket, creating a private parent directory if needed and
    /// replacing any stale socket left by a previous run.
    pub async fn bind(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            create_private_dir(parent)?;
        }

        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed stale control socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn accept(&self) -> io::Result<IpcConnection> {
        let (stream, _) = self.listener.accept().await?;
        Ok(IpcConnection {
            transport: JsonLines::new(stream),
        })
    }

    /// Answers requests with `handler` until `cancel` fires. Each client gets
    /// its own task and may send any number of requests.
    pub async fn serve<H, Fut>(self, handler: H, cancel: CancellationToken)
    where
        H: Fn(IpcRequest) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = IpcResponse> + Send,
    {
        tracing::info!(path = %self.path.display(), "Control socket listening");

        loop {
            let mut conn = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "Control socket accept failed");
                        continue;
                    }
                },
            };

            let handler = handler.clone();
            tokio::spawn(async move {
                loop {
                    let request = match conn.read_request().await {
                        Ok(Some(request)) => request,
                        Ok(None) => break,
                        Err(IpcError::Json(e)) => {
                            let reply = IpcResponse::error(format!("malformed request: {e}"));
                            if conn.send_response(&reply).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        Err(e) => {
                            tracing::debug!(error = %e, "Control client read failed");
                            break;
                        }
                    };

                    tracing::debug!(?request, "Control request");
                    let response = handler(request).await;
                    if let Err(e) = conn.send_response(&response).await {
                        tracing::debug!(error = %e, "Control client write failed");
                        break;
                    }
                }
            });
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// One connected control client.
pub struct IpcConnection {
    transport: JsonLines,
}

impl IpcConnection {
    /// `None` once the client disconnects.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        self.transport.recv().await
    }

    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        self.transport.send(response).await
    }
}

fn create_private_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
    }

    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn test_bind_creates_private_parent() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("nested").join("daemon.sock");

        let server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(socket_path.parent().unwrap())
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o700);
        }
        drop(server);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        std::fs::write(&socket_path, b"stale").unwrap();

        let _server = IpcServer::bind(&socket_path).await.unwrap();
        assert!(socket_path.exists());
    }

    #[tokio::test]
    async fn test_serve_answers_requests_and_malformed_lines() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();
        let cancel = CancellationToken::new();

        let serve = tokio::spawn(server.serve(
            |request| async move {
                match request {
                    IpcRequest::Ping => IpcResponse::Pong,
                    _ => IpcResponse::error("unsupported"),
                }
            },
            cancel.clone(),
        ));

        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_half.write_all(b"\"Ping\"\nnot json\n\"Status\"\n").await.unwrap();

        let mut replies = Vec::new();
        for _ in 0..3 {
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            replies.push(serde_json::from_str::<IpcResponse>(line.trim()).unwrap());
        }

        assert_eq!(replies[0], IpcResponse::Pong);
        assert!(matches!(&replies[1], IpcResponse::Error { message } if message.contains("malformed")));
        assert_eq!(replies[2], IpcResponse::error("unsupported"));

        cancel.cancel();
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_request_none_on_disconnect() {
        let temp_dir = tempdir().unwrap();
        let socket_path = temp_dir.path().join("daemon.sock");
        let server = IpcServer::bind(&socket_path).await.unwrap();

        let client = UnixStream::connect(&socket_path).await.unwrap();
        let mut conn = server.accept().await.unwrap();
        drop(client);

        assert!(conn.read_request().await.unwrap().is_none());
    }
}
