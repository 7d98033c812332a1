//! Fakes shared by the unit tests.

use crate::backend::{BackendError, Playback};
use async_trait::async_trait;
use mynd_proto::codec;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// In-memory MCU writer.  Clones share one buffer.
#[derive(Clone, Default)]
pub struct Recorder {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Recorder {
    pub fn raw(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().unwrap()).into_owned()
    }

    /// Command bodies in the order they were written, ids stripped.
    pub fn commands(&self) -> Vec<String> {
        self.raw()
            .lines()
            .filter_map(|line| codec::decode_command(line).map(|(_, cmd)| cmd.to_string()))
            .collect()
    }

    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| *c == command).count()
    }

    pub fn position(&self, command: &str) -> Option<usize> {
        self.commands().iter().position(|c| c == command)
    }
}

impl Write for Recorder {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Scripted playback backend that records every command it receives.
#[derive(Default)]
pub struct FakePlayback {
    pub commands: Mutex<Vec<String>>,
    pub states: Mutex<VecDeque<Option<String>>>,
    pub volume: Mutex<Option<i64>>,
    pub reject_commands: bool,
}

impl FakePlayback {
    pub fn with_volume(volume: Option<i64>) -> Self {
        Self {
            volume: Mutex::new(volume),
            ..Self::default()
        }
    }

    /// Queue playback states; once drained, the backend reports unavailable.
    pub fn push_states<'a>(&self, states: impl IntoIterator<Item = Option<&'a str>>) {
        self.states
            .lock()
            .unwrap()
            .extend(states.into_iter().map(|s| s.map(str::to_string)));
    }

    pub fn sent(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl Playback for FakePlayback {
    async fn command(&self, command: &str) -> Result<(), BackendError> {
        self.commands.lock().unwrap().push(command.to_string());
        if self.reject_commands {
            return Err(BackendError::Rejected("error".into()));
        }
        Ok(())
    }

    async fn volume(&self) -> Option<i64> {
        *self.volume.lock().unwrap()
    }

    async fn playback_state(&self) -> Option<String> {
        self.states.lock().unwrap().pop_front().flatten()
    }
}

/// Serve `app` on an ephemeral localhost port.
pub async fn spawn_http(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}
