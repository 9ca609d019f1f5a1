//! Unix-domain-socket control server.
//!
//! ## Connection Flow
//!
//! 1. The daemon binds the control socket path (stale sockets removed)
//! 2. A control peer connects; the server allocates a peer id
//! 3. Frames are decoded from the stream and dispatched one by one; reply
//!    frames are written back in request order
//! 4. Disconnect (or shutdown) aborts the peer's open transaction and
//!    removes its binds

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use kzorp::engine::Engine;
use kzorp_proto::Decoder;

use crate::error::Result;
use crate::session::PeerSession;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Serves the control protocol for one engine.
pub struct ControlServer {
    engine: Arc<Engine>,
    socket_path: PathBuf,
}

impl ControlServer {
    pub fn new(engine: Arc<Engine>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            socket_path: socket_path.into(),
        }
    }

    /// Accept control peers until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        // Clean up a stale socket from a previous run
        let _ = std::fs::remove_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "control socket listening");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    let engine = self.engine.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(error) = serve_peer(engine, stream, shutdown).await {
                            debug!(%error, "control peer ended with error");
                        }
                    });
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

/// Drive one control connection to completion.
pub async fn serve_peer(
    engine: Arc<Engine>,
    stream: UnixStream,
    shutdown: CancellationToken,
) -> Result<()> {
    let session = PeerSession::new(engine);
    debug!(peer = session.peer(), "control peer connected");
    let result = drive_peer(&session, stream, shutdown).await;
    // Implicit abort + bind removal, also on errors
    session.close();
    debug!(peer = session.peer(), "control peer disconnected");
    result
}

async fn drive_peer(
    session: &PeerSession,
    mut stream: UnixStream,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            read = stream.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    return Ok(());
                }
                let messages = decoder.decode(buf.get(..n).unwrap_or_default())?;
                for msg in messages {
                    let reply = session.handle(&msg);
                    stream.write_all(&reply).await?;
                }
            }
        }
    }
}
