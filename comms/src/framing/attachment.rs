//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::mpsc,
};

use super::{FramingError, ATTACHMENT_CHUNK_SIZE};

/// Bounded sink for whole-percent progress updates. A bounded channel rather
/// than a direct callback: a slow consumer exerts backpressure instead of
/// stalling inside the sender's write path.
pub type ProgressSink = mpsc::Sender<u8>;

enum StreamSource {
    Buffered(Bytes),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

/// A stream attachment to be written after a frame: an id, an exact byte
/// length and a byte source.
pub struct OutboundStream {
    id: u64,
    length: u64,
    source: StreamSource,
    progress: Option<ProgressSink>,
    last_reported_pct: u8,
}

impl OutboundStream {
    pub fn from_bytes(id: u64, bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self {
            id,
            length: bytes.len() as u64,
            source: StreamSource::Buffered(bytes),
            progress: None,
            last_reported_pct: 0,
        }
    }

    /// Stream `length` bytes from an async reader. The reader must yield
    /// exactly `length` bytes; ending early fails the write.
    pub fn from_reader(id: u64, length: u64, reader: Box<dyn AsyncRead + Send + Unpin>) -> Self {
        Self {
            id,
            length,
            source: StreamSource::Reader(reader),
            progress: None,
            last_reported_pct: 0,
        }
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub(super) async fn next_chunk(&mut self) -> Result<Option<Bytes>, FramingError> {
        match &mut self.source {
            StreamSource::Buffered(bytes) => {
                if bytes.is_empty() {
                    return Ok(None);
                }
                let take = bytes.len().min(ATTACHMENT_CHUNK_SIZE);
                Ok(Some(bytes.split_to(take)))
            },
            StreamSource::Reader(reader) => {
                let mut buf = vec![0u8; ATTACHMENT_CHUNK_SIZE];
                let read = reader.read(&mut buf).await?;
                if read == 0 {
                    return Ok(None);
                }
                buf.truncate(read);
                Ok(Some(buf.into()))
            },
        }
    }

    /// Emit every whole percentage in `(last_reported, pct]`, in order.
    pub(super) async fn report_progress_up_to(&mut self, pct: u8) {
        let sink = match &self.progress {
            Some(sink) => sink,
            None => return,
        };
        while self.last_reported_pct < pct.min(100) {
            self.last_reported_pct += 1;
            if sink.send(self.last_reported_pct).await.is_err() {
                // Consumer went away; stop reporting but keep writing
                self.progress = None;
                return;
            }
        }
    }
}

/// Handler-side view of a received stream attachment. Chunks arrive through a
/// bounded channel fed by the connection task while the handler runs.
pub struct InboundStream {
    id: u64,
    rx: mpsc::Receiver<Bytes>,
}

impl InboundStream {
    pub(crate) fn new(id: u64, rx: mpsc::Receiver<Bytes>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The next chunk of attachment bytes, or `None` once exhausted.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Consume the stream, counting its bytes.
    pub async fn count_bytes(mut self) -> u64 {
        let mut count = 0u64;
        while let Some(chunk) = self.next_chunk().await {
            count += chunk.len() as u64;
        }
        count
    }

    /// Consume the stream into memory.
    pub async fn read_to_end(mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk);
        }
        out
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn buffered_source_chunks() {
        let mut outbound = OutboundStream::from_bytes(3, vec![9u8; ATTACHMENT_CHUNK_SIZE + 10]);
        assert_eq!(outbound.len(), (ATTACHMENT_CHUNK_SIZE + 10) as u64);
        let first = outbound.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.len(), ATTACHMENT_CHUNK_SIZE);
        let second = outbound.next_chunk().await.unwrap().unwrap();
        assert_eq!(second.len(), 10);
        assert!(outbound.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reader_source_reads_to_exhaustion() {
        let data = vec![1u8; 1000];
        let mut outbound = OutboundStream::from_reader(1, 1000, Box::new(std::io::Cursor::new(data)));
        let mut total = 0;
        while let Some(chunk) = outbound.next_chunk().await.unwrap() {
            total += chunk.len();
        }
        assert_eq!(total, 1000);
    }

    #[tokio::test]
    async fn inbound_stream_counts() {
        let (tx, rx) = mpsc::channel(4);
        let inbound = InboundStream::new(8, rx);
        tokio::spawn(async move {
            tx.send(Bytes::from_static(b"hello ")).await.unwrap();
            tx.send(Bytes::from_static(b"fleet")).await.unwrap();
        });
        assert_eq!(inbound.count_bytes().await, 11);
    }
}
