/// Minimal MPD status-socket client.
///
/// Exchange:
///
/// ```text
///   ← OK MPD <version>
///   → status
///   ← volume: 40
///   ← state: play
///   ← ...
///   ← OK
/// ```
///
/// The local unix socket is tried first, TCP on localhost second.  Every
/// failure collapses to "unavailable" (`None`) for callers.
use mynd_proto::config::MoodeConfig;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use tracing::debug;

/// Connect and per-read timeout.
pub const MPD_TIMEOUT: Duration = Duration::from_secs(2);

const GREETING_PREFIX: &str = "OK MPD";
const TCP_HOST: &str = "localhost";

#[derive(Debug, thiserror::Error)]
enum MpdError {
    #[error("timed out")]
    Timeout,
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected greeting: {0:?}")]
    Greeting(String),
    #[error("server replied {0:?}")]
    Ack(String),
    #[error("status response did not contain a state line")]
    MissingState,
}

impl From<tokio::time::error::Elapsed> for MpdError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        MpdError::Timeout
    }
}

pub struct MpdStatusClient {
    socket_path: PathBuf,
    tcp_port: u16,
    timeout: Duration,
}

impl MpdStatusClient {
    pub fn new(config: &MoodeConfig) -> Self {
        Self {
            socket_path: config.mpd_socket.clone(),
            tcp_port: config.mpd_port,
            timeout: MPD_TIMEOUT,
        }
    }

    pub async fn playback_state(&self) -> Option<String> {
        match self.query_unix().await {
            Ok(state) => return Some(state),
            Err(e) => debug!("MPD unix socket {}: {}", self.socket_path.display(), e),
        }
        match self.query_tcp().await {
            Ok(state) => Some(state),
            Err(e) => {
                debug!("MPD tcp {}:{}: {}", TCP_HOST, self.tcp_port, e);
                None
            }
        }
    }

    async fn query_unix(&self) -> Result<String, MpdError> {
        let stream = timeout(self.timeout, UnixStream::connect(&self.socket_path)).await??;
        query_status(stream, self.timeout).await
    }

    async fn query_tcp(&self) -> Result<String, MpdError> {
        let stream = timeout(self.timeout, TcpStream::connect((TCP_HOST, self.tcp_port))).await??;
        query_status(stream, self.timeout).await
    }
}

async fn query_status<S>(stream: S, limit: Duration) -> Result<String, MpdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    timeout(limit, reader.read_line(&mut line)).await??;
    if !line.starts_with(GREETING_PREFIX) {
        return Err(MpdError::Greeting(line.trim().chars().take(50).collect()));
    }

    timeout(limit, write_half.write_all(b"status\n")).await??;

    let mut state = None;
    loop {
        line.clear();
        if timeout(limit, reader.read_line(&mut line)).await?? == 0 {
            break;
        }
        let field = line.trim();
        if field == "OK" {
            break;
        }
        if field.starts_with("ACK") {
            return Err(MpdError::Ack(field.to_string()));
        }
        if let Some(value) = field.strip_prefix("state:") {
            let value = value.trim();
            if !value.is_empty() {
                state = Some(value.to_lowercase());
            }
        }
    }

    state.ok_or(MpdError::MissingState)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, UnixListener};

    /// Serve one scripted exchange per accepted connection.
    async fn serve_unix(listener: UnixListener, greeting: &'static str, reply: &'static str) {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = stream.write_all(greeting.as_bytes()).await;
                let mut buf = [0u8; 64];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(reply.as_bytes()).await;
            });
        }
    }

    fn client(socket_path: PathBuf, tcp_port: u16) -> MpdStatusClient {
        let config = MoodeConfig {
            mpd_socket: socket_path,
            mpd_port: tcp_port,
            ..MoodeConfig::default()
        };
        MpdStatusClient::new(&config)
    }

    /// A port with no listener behind it.
    fn dead_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn reads_state_from_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mpd.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve_unix(
            listener,
            "OK MPD 0.23.5\n",
            "volume: 40\nrepeat: 0\nstate: PLAY\nsong: 3\nOK\n",
        ));

        assert_eq!(
            client(path, dead_port()).playback_state().await.as_deref(),
            Some("play")
        );
    }

    #[tokio::test]
    async fn falls_back_to_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let _ = stream.write_all(b"OK MPD 0.23.5\n").await;
                    let mut buf = [0u8; 64];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream.write_all(b"state: pause\nOK\n").await;
                });
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.sock");
        assert_eq!(
            client(missing, port).playback_state().await.as_deref(),
            Some("pause")
        );
    }

    #[tokio::test]
    async fn bad_greeting_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mpd.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve_unix(listener, "HELLO\n", "state: play\nOK\n"));

        assert_eq!(client(path, dead_port()).playback_state().await, None);
    }

    #[tokio::test]
    async fn missing_state_or_ack_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();

        let path = dir.path().join("nostate.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve_unix(listener, "OK MPD 0.23.5\n", "volume: 40\nOK\n"));
        assert_eq!(client(path, dead_port()).playback_state().await, None);

        let path = dir.path().join("ack.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve_unix(
            listener,
            "OK MPD 0.23.5\n",
            "ACK [4@0] {status} you don't have permission\n",
        ));
        assert_eq!(client(path, dead_port()).playback_state().await, None);
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silent.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let mut client = client(path, dead_port());
        client.timeout = Duration::from_millis(100);
        assert_eq!(client.playback_state().await, None);
    }
}
