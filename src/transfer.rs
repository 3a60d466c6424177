use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::TransferMessage;
use crate::registry::LinkHandle;

/// Fixed chunk size for outbound transfers.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Byte-oriented send primitive the codec emits frames on. Implemented by the
/// signaling link handle and by the negotiation engine's data channel, since
/// transfer messages may legitimately travel over either.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_text(&self, text: String) -> anyhow::Result<()>;
}

#[async_trait]
impl MessageSink for LinkHandle {
    async fn send_text(&self, text: String) -> anyhow::Result<()> {
        if LinkHandle::send_text(self, text) {
            Ok(())
        } else {
            Err(anyhow::anyhow!("signaling link writer is gone"))
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("malformed transfer message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid chunk encoding for transfer {file_id}: {source}")]
    Decode {
        file_id: String,
        source: base64::DecodeError,
    },
    #[error(
        "transfer {file_id} incomplete at completion: \
         {received}/{expected} chunks, {bytes} of {declared} bytes"
    )]
    Incomplete {
        file_id: String,
        received: usize,
        expected: u32,
        bytes: u64,
        declared: u64,
    },
}

/// Emitted when a transfer's chunk set has been reassembled and validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    FileAssembled { name: String, bytes: Vec<u8> },
}

/// One in-flight inbound file, keyed by the sender-generated file id.
struct Transfer {
    name: String,
    declared_size: u64,
    total_chunks: u32,
    chunks: DashMap<u32, Vec<u8>>,
    last_activity: Mutex<Instant>,
}

impl Transfer {
    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }
}

/// Stateless-per-message chunked transfer codec: splits outbound payloads
/// into bounded JSON frames and reassembles inbound payloads from chunks that
/// may arrive out of order, keyed by file id independent of transport.
pub struct TransferCodec {
    incoming: DashMap<String, Transfer>,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl TransferCodec {
    pub fn new(events: mpsc::UnboundedSender<TransferEvent>) -> Self {
        Self {
            incoming: DashMap::new(),
            events,
        }
    }

    /// Send path: one `file_meta`, then `totalChunks` `file_chunk` frames in
    /// sequence order, then one `file_complete`. Returns the generated file id.
    pub async fn send_file(
        &self,
        name: &str,
        bytes: &[u8],
        sink: &dyn MessageSink,
    ) -> anyhow::Result<String> {
        let file_id = Uuid::new_v4().to_string();
        let total_chunks = bytes.len().div_ceil(CHUNK_SIZE) as u32;

        debug!(
            %file_id,
            name,
            size = bytes.len(),
            chunks = total_chunks,
            "starting file send"
        );

        let meta = TransferMessage::Meta {
            file_id: file_id.clone(),
            name: name.to_string(),
            size: bytes.len() as u64,
            chunk_size: CHUNK_SIZE as u32,
            total_chunks,
        };
        sink.send_text(serde_json::to_string(&meta)?).await?;

        for (seq, slice) in bytes.chunks(CHUNK_SIZE).enumerate() {
            let chunk = TransferMessage::Chunk {
                file_id: file_id.clone(),
                seq: seq as u32,
                data: BASE64.encode(slice),
            };
            sink.send_text(serde_json::to_string(&chunk)?).await?;
        }

        let complete = TransferMessage::Complete {
            file_id: file_id.clone(),
        };
        sink.send_text(serde_json::to_string(&complete)?).await?;
        debug!(%file_id, "file send complete");

        Ok(file_id)
    }

    /// Receive path: feed one raw transfer frame, from whichever transport
    /// delivered it.
    pub fn handle_incoming(&self, text: &str) -> Result<(), TransferError> {
        match serde_json::from_str::<TransferMessage>(text)? {
            TransferMessage::Meta {
                file_id,
                name,
                size,
                chunk_size: _,
                total_chunks,
            } => {
                debug!(%file_id, %name, size, total_chunks, "incoming file meta");
                // A repeated meta for the same id restarts the transfer.
                self.incoming.insert(
                    file_id,
                    Transfer {
                        name,
                        declared_size: size,
                        total_chunks,
                        chunks: DashMap::new(),
                        last_activity: Mutex::new(Instant::now()),
                    },
                );
                Ok(())
            }
            TransferMessage::Chunk { file_id, seq, data } => {
                let Some(transfer) = self.incoming.get(&file_id) else {
                    // Chunk arrived before its meta; the caller-ordering
                    // contract makes this a drop, not an error.
                    debug!(%file_id, seq, "dropping chunk for unknown transfer");
                    return Ok(());
                };
                let bytes = BASE64
                    .decode(data.as_bytes())
                    .map_err(|source| TransferError::Decode {
                        file_id: file_id.clone(),
                        source,
                    })?;
                transfer.chunks.insert(seq, bytes);
                transfer.touch();
                Ok(())
            }
            TransferMessage::Complete { file_id } => {
                let Some((_, transfer)) = self.incoming.remove(&file_id) else {
                    debug!(%file_id, "completion for unknown transfer ignored");
                    return Ok(());
                };
                self.finish(&file_id, transfer)
            }
        }
    }

    fn finish(&self, file_id: &str, transfer: Transfer) -> Result<(), TransferError> {
        let mut parts: Vec<(u32, Vec<u8>)> = transfer.chunks.into_iter().collect();
        parts.sort_unstable_by_key(|(seq, _)| *seq);

        let received = parts.len();
        // Capacity comes from bytes actually buffered, never from the
        // sender-declared size, which is unvalidated input.
        let buffered: usize = parts.iter().map(|(_, chunk)| chunk.len()).sum();
        let mut assembled = Vec::with_capacity(buffered);
        let mut covers_sequence = received as u32 == transfer.total_chunks;
        for (expected, (seq, chunk)) in parts.into_iter().enumerate() {
            covers_sequence &= seq == expected as u32;
            assembled.extend_from_slice(&chunk);
        }

        if !covers_sequence || assembled.len() as u64 != transfer.declared_size {
            return Err(TransferError::Incomplete {
                file_id: file_id.to_string(),
                received,
                expected: transfer.total_chunks,
                bytes: assembled.len() as u64,
                declared: transfer.declared_size,
            });
        }

        info!(
            %file_id,
            name = %transfer.name,
            size = assembled.len(),
            "file fully assembled"
        );
        let _ = self.events.send(TransferEvent::FileAssembled {
            name: transfer.name,
            bytes: assembled,
        });
        Ok(())
    }

    /// Evict transfers whose `complete` never arrives, so an abandoned send
    /// does not pin its buffers forever.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, idle_after: Duration) -> JoinHandle<()> {
        let codec = Arc::clone(self);
        tokio::spawn(async move {
            let period = (idle_after / 2).max(Duration::from_millis(10));
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let mut stale = Vec::new();
                for entry in codec.incoming.iter() {
                    if entry.last_activity.lock().elapsed() > idle_after {
                        stale.push(entry.key().clone());
                    }
                }
                for file_id in stale {
                    if codec.incoming.remove(&file_id).is_some() {
                        warn!(%file_id, "evicting idle incomplete transfer");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CollectSink {
        frames: Mutex<Vec<String>>,
    }

    impl CollectSink {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut self.frames.lock())
        }
    }

    #[async_trait]
    impl MessageSink for CollectSink {
        async fn send_text(&self, text: String) -> anyhow::Result<()> {
            self.frames.lock().push(text);
            Ok(())
        }
    }

    fn codec() -> (Arc<TransferCodec>, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(TransferCodec::new(tx)), rx)
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn send_emits_meta_chunks_complete() {
        let (codec, _rx) = codec();
        let sink = CollectSink::default();
        let bytes = payload(40_000);

        codec.send_file("a.bin", &bytes, &sink).await.unwrap();
        let frames = sink.take();
        assert_eq!(frames.len(), 5); // meta + 3 chunks + complete

        let mut chunk_sizes = Vec::new();
        let mut seqs = Vec::new();
        for frame in &frames[1..4] {
            match serde_json::from_str::<TransferMessage>(frame).unwrap() {
                TransferMessage::Chunk { seq, data, .. } => {
                    seqs.push(seq);
                    chunk_sizes.push(BASE64.decode(data).unwrap().len());
                }
                other => panic!("expected chunk, got {other:?}"),
            }
        }
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(chunk_sizes, vec![16_384, 16_384, 7_232]);

        match serde_json::from_str::<TransferMessage>(&frames[0]).unwrap() {
            TransferMessage::Meta {
                size, total_chunks, ..
            } => {
                assert_eq!(size, 40_000);
                assert_eq!(total_chunks, 3);
            }
            other => panic!("expected meta, got {other:?}"),
        }
        assert!(matches!(
            serde_json::from_str::<TransferMessage>(&frames[4]).unwrap(),
            TransferMessage::Complete { .. }
        ));
    }

    #[tokio::test]
    async fn reassembly_is_order_independent() {
        let (codec, mut rx) = codec();
        let sink = CollectSink::default();
        let bytes = payload(40_000);

        codec.send_file("a.bin", &bytes, &sink).await.unwrap();
        let frames = sink.take();

        codec.handle_incoming(&frames[0]).unwrap();
        for frame in frames[1..4].iter().rev() {
            codec.handle_incoming(frame).unwrap();
        }
        codec.handle_incoming(&frames[4]).unwrap();

        match rx.try_recv().unwrap() {
            TransferEvent::FileAssembled { name, bytes: got } => {
                assert_eq!(name, "a.bin");
                assert_eq!(got, bytes);
            }
        }
    }

    #[tokio::test]
    async fn chunk_redelivery_is_idempotent() {
        let (codec, mut rx) = codec();
        let sink = CollectSink::default();
        let bytes = payload(20_000);

        codec.send_file("b.bin", &bytes, &sink).await.unwrap();
        let frames = sink.take();

        codec.handle_incoming(&frames[0]).unwrap();
        codec.handle_incoming(&frames[1]).unwrap();
        codec.handle_incoming(&frames[1]).unwrap();
        codec.handle_incoming(&frames[2]).unwrap();
        codec.handle_incoming(&frames[3]).unwrap();

        match rx.try_recv().unwrap() {
            TransferEvent::FileAssembled { bytes: got, .. } => assert_eq!(got, bytes),
        }
    }

    #[tokio::test]
    async fn chunk_before_meta_is_dropped() {
        let (codec, mut rx) = codec();
        let sink = CollectSink::default();
        let bytes = payload(1000);

        codec.send_file("c.bin", &bytes, &sink).await.unwrap();
        let frames = sink.take();

        // Chunk first: dropped without error.
        codec.handle_incoming(&frames[1]).unwrap();
        // Meta arrives afterwards; the dropped chunk must not resurface, so
        // completion now fails validation.
        codec.handle_incoming(&frames[0]).unwrap();
        let err = codec.handle_incoming(&frames[2]).unwrap_err();
        assert!(matches!(err, TransferError::Incomplete { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn repeated_meta_restarts_transfer() {
        let (codec, mut rx) = codec();
        let sink = CollectSink::default();
        let bytes = payload(500);

        codec.send_file("d.bin", &bytes, &sink).await.unwrap();
        let frames = sink.take();

        codec.handle_incoming(&frames[0]).unwrap();
        codec.handle_incoming(&frames[1]).unwrap();
        // Second meta wipes buffered chunks; the transfer starts over.
        codec.handle_incoming(&frames[0]).unwrap();
        codec.handle_incoming(&frames[1]).unwrap();
        codec.handle_incoming(&frames[2]).unwrap();

        match rx.try_recv().unwrap() {
            TransferEvent::FileAssembled { bytes: got, .. } => assert_eq!(got, bytes),
        }
    }

    #[tokio::test]
    async fn completion_for_unknown_transfer_is_ignored() {
        let (codec, mut rx) = codec();
        codec
            .handle_incoming(r#"{"type":"file_complete","fileId":"nope"}"#)
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_frame_is_an_error() {
        let (codec, _rx) = codec();
        assert!(matches!(
            codec.handle_incoming("{not json"),
            Err(TransferError::Malformed(_))
        ));
        assert!(matches!(
            codec.handle_incoming(
                r#"{"type":"file_chunk","fileId":"x","seq":0,"data":"!!"}"#
            ),
            Ok(()) // unknown transfer: dropped before decode
        ));
    }

    #[tokio::test]
    async fn undecodable_chunk_is_an_error() {
        let (codec, _rx) = codec();
        codec
            .handle_incoming(
                r#"{"type":"file_meta","fileId":"x","name":"x.bin","size":4,"chunkSize":16384,"totalChunks":1}"#,
            )
            .unwrap();
        assert!(matches!(
            codec.handle_incoming(r#"{"type":"file_chunk","fileId":"x","seq":0,"data":"!!"}"#),
            Err(TransferError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn absurd_declared_size_fails_validation_without_allocating() {
        let (codec, mut rx) = codec();
        // A meta may declare any size; nothing is reserved from it.
        codec
            .handle_incoming(
                r#"{"type":"file_meta","fileId":"x","name":"x.bin","size":18446744073709551615,"chunkSize":16384,"totalChunks":0}"#,
            )
            .unwrap();
        let err = codec
            .handle_incoming(r#"{"type":"file_complete","fileId":"x"}"#)
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Incomplete { declared, bytes: 0, .. } if declared == u64::MAX
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn idle_transfer_is_evicted() {
        let (codec, mut rx) = codec();
        let sink = CollectSink::default();
        let bytes = payload(100);

        codec.send_file("e.bin", &bytes, &sink).await.unwrap();
        let frames = sink.take();
        codec.handle_incoming(&frames[0]).unwrap();

        let sweeper = codec.spawn_idle_sweeper(Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(120)).await;
        sweeper.abort();

        // The evicted transfer no longer completes.
        codec.handle_incoming(&frames[1]).unwrap();
        codec.handle_incoming(&frames[2]).unwrap();
        assert!(rx.try_recv().is_err());
    }
}
