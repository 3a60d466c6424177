use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::protocol::UiEvent;
use crate::transfer::TransferEvent;

/// Delivery collaborator: hands a fully assembled file to the platform.
pub trait FileSink: Send + Sync {
    fn deliver(&self, name: &str, bytes: &[u8]) -> anyhow::Result<PathBuf>;
}

/// Writes received files into a downloads directory, creating it on demand.
/// Only the final path component of the advertised name is honored, so a
/// sender cannot steer the write outside the directory.
pub struct DownloadsSink {
    dir: PathBuf,
}

impl DownloadsSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn safe_name(name: &str) -> &str {
        let base = Path::new(name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("");
        if base.is_empty() || base == ".." {
            "received.bin"
        } else {
            base
        }
    }
}

impl FileSink for DownloadsSink {
    fn deliver(&self, name: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(Self::safe_name(name));
        std::fs::write(&path, bytes)?;
        Ok(path)
    }
}

/// Consume assembled-file events, persist each file, and surface it to the UI.
pub fn spawn_delivery_pump(
    mut transfers: mpsc::UnboundedReceiver<TransferEvent>,
    sink: Arc<dyn FileSink>,
    ui: mpsc::UnboundedSender<UiEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(TransferEvent::FileAssembled { name, bytes }) = transfers.recv().await {
            let size = bytes.len() as u64;
            match sink.deliver(&name, &bytes) {
                Ok(path) => {
                    info!(name = %name, size, path = %path.display(), "file received");
                    let _ = ui.send(UiEvent::FileReceived { name, size });
                }
                Err(err) => error!(name = %name, error = %err, "failed to deliver file"),
            }
        }
    })
}

/// UI bridge stand-in: logs every emitted event. A host app replaces this by
/// consuming the channel itself.
pub fn spawn_ui_logger(mut events: mpsc::UnboundedReceiver<UiEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => info!(event = %json, "ui event"),
                Err(err) => error!(error = %err, "unserializable ui event"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_file_to_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DownloadsSink::new(dir.path());

        let path = sink.deliver("a.bin", b"hello").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        assert_eq!(path.file_name().unwrap(), "a.bin");
    }

    #[test]
    fn strips_directory_components_from_name() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DownloadsSink::new(dir.path());

        let path = sink.deliver("../../etc/passwd", b"x").unwrap();
        assert!(path.starts_with(dir.path()));
        assert_eq!(path.file_name().unwrap(), "passwd");

        let fallback = sink.deliver("..", b"y").unwrap();
        assert_eq!(fallback.file_name().unwrap(), "received.bin");
    }

    #[tokio::test]
    async fn pump_persists_and_emits_ui_event() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(DownloadsSink::new(dir.path()));
        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();
        let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();

        let pump = spawn_delivery_pump(transfer_rx, sink, ui_tx);
        transfer_tx
            .send(TransferEvent::FileAssembled {
                name: "b.bin".into(),
                bytes: vec![1, 2, 3],
            })
            .unwrap();
        drop(transfer_tx);
        pump.await.unwrap();

        match ui_rx.try_recv().unwrap() {
            UiEvent::FileReceived { name, size } => {
                assert_eq!(name, "b.bin");
                assert_eq!(size, 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(std::fs::read(dir.path().join("b.bin")).unwrap(), [1, 2, 3]);
    }
}
