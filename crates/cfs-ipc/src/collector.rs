//! Minimal collector: accepts interposer connections and forwards every
//! decoded message to a channel. Used by the harness and tests; a real build
//! system brings its own.

use crate::{CollectorMessage, IpcError, MAX_FRAME_SIZE};
use cfs_config::{log_collector_debug, log_collector_info, log_collector_warn};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

pub struct Collector {
    listener: UnixListener,
    path: PathBuf,
}

impl Collector {
    /// Bind the collector socket, replacing a stale socket file.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, IpcError> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        log_collector_info!("Collector listening", path = tracing::field::display(path.display()));
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections forever, one task per connection.
    ///
    /// Returns when the receiving side of `tx` is dropped.
    pub async fn run(self, tx: mpsc::UnboundedSender<CollectorMessage>) -> Result<(), IpcError> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, _) = accepted?;
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = read_connection(stream, &tx).await {
                            log_collector_warn!("Connection error", error = tracing::field::display(&e));
                        }
                    });
                }
                _ = tx.closed() => return Ok(()),
            }
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Read frames until the peer closes the connection.
pub async fn read_connection(
    mut stream: UnixStream,
    tx: &mpsc::UnboundedSender<CollectorMessage>,
) -> Result<(), IpcError> {
    loop {
        let mut len_buf = [0u8; 4];
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(IpcError::FrameTooLarge(len));
        }

        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        let message = crate::decode_payload(&payload)?;
        log_collector_debug!("Frame received", len = len);

        if tx.send(message).is_err() {
            return Ok(());
        }
    }
}
