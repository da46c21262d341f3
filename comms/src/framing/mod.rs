//   Copyright 2024 The Tether Project
//   SPDX-License-Identifier: BSD-3-Clause

//! Length-delimited, compressed framing with raw stream attachments.
//!
//! Wire layout of a message:
//!
//! ```text
//! u32_le length || deflate_raw(tagged_object_bytes)
//! ```
//!
//! followed, when the frame declares attached streams, by each attachment in
//! declared order:
//!
//! ```text
//! u64_le attachment_length || attachment_bytes (raw, uncompressed)
//! ```
//!
//! Structured frames are small and pass through raw DEFLATE; attachment bytes
//! bypass compression entirely. A frame cannot be read while a previous
//! frame's attachments are still on the wire.

mod attachment;

pub use attachment::{InboundStream, OutboundStream, ProgressSink};

use std::io::{Read, Write};

use bytes::{Bytes, BytesMut};
use flate2::{read::DeflateDecoder, write::DeflateEncoder, Compression};
use log::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{MessageError, WireFrame};

const LOG_TARGET: &str = "comms::framing";

/// Maximum size of a single structured frame (compressed or inflated).
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Chunk size for attachment reads and writes.
pub(crate) const ATTACHMENT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("frame of {got} bytes exceeds the maximum of {max}")]
    FrameTooLarge { got: usize, max: usize },
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("{0} declared attachment(s) are still unread")]
    UnreadAttachments(usize),
    #[error("attachment source ended {remaining} byte(s) short of its declared length")]
    AttachmentTruncated { remaining: u64 },
    #[error("deflate payload inflated past the maximum frame size")]
    InflateOverrun,
    #[error("expected a {expected} frame, got {got}")]
    UnexpectedFrame {
        expected: &'static str,
        got: &'static str,
    },
}

/// Tracks how much declared attachment data is still on the wire.
#[derive(Debug, Default)]
struct AttachmentReadState {
    /// Declared attachments not yet begun.
    remaining_count: usize,
    /// Bytes left of the attachment currently being read, if any.
    current_remaining: Option<u64>,
}

impl AttachmentReadState {
    fn is_clear(&self) -> bool {
        self.remaining_count == 0 && self.current_remaining.is_none()
    }

    fn pending(&self) -> usize {
        self.remaining_count + usize::from(self.current_remaining.is_some())
    }
}

/// Reads and writes [`WireFrame`]s and their stream attachments over a byte
/// stream.
pub struct FrameCodec<S> {
    stream: S,
    read_buf: BytesMut,
    attachments: AttachmentReadState,
    max_frame_size: usize,
}

impl<S> FrameCodec<S>
where S: AsyncRead + AsyncWrite + Unpin
{
    pub fn new(stream: S) -> Self {
        Self::with_preread(stream, &[])
    }

    /// Create a codec whose first reads are served from `preread` before the
    /// underlying stream. Used when leading bytes were consumed to sniff the
    /// wire mode.
    pub fn with_preread(stream: S, preread: &[u8]) -> Self {
        Self {
            stream,
            read_buf: BytesMut::from(preread),
            attachments: AttachmentReadState::default(),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Serialize, compress and flush a frame. Attachments the frame declares
    /// must be written immediately afterwards with [`write_attachment`] in
    /// declared order.
    ///
    /// [`write_attachment`]: FrameCodec::write_attachment
    pub async fn write_frame(&mut self, frame: &WireFrame) -> Result<(), FramingError> {
        let raw = frame.to_wire_bytes()?;
        if raw.len() > self.max_frame_size {
            return Err(FramingError::FrameTooLarge {
                got: raw.len(),
                max: self.max_frame_size,
            });
        }
        let compressed = deflate(&raw)?;
        if compressed.len() > self.max_frame_size {
            return Err(FramingError::FrameTooLarge {
                got: compressed.len(),
                max: self.max_frame_size,
            });
        }
        self.stream
            .write_all(&(compressed.len() as u32).to_le_bytes())
            .await?;
        self.stream.write_all(&compressed).await?;
        self.stream.flush().await?;
        trace!(
            target: LOG_TARGET,
            "wrote {} frame ({} bytes, {} compressed)",
            frame.variant_name(),
            raw.len(),
            compressed.len()
        );
        Ok(())
    }

    /// Write one stream attachment: `u64_le length || raw bytes`. Progress, if
    /// the stream carries a sink, is reported per whole percent crossed and
    /// ends with 100 exactly when the final byte has been flushed.
    pub async fn write_attachment(&mut self, attachment: &mut OutboundStream) -> Result<(), FramingError> {
        let length = attachment.len();
        self.stream.write_all(&length.to_le_bytes()).await?;

        let mut written = 0u64;
        while written < length {
            let chunk = attachment.next_chunk().await?;
            let mut chunk = match chunk {
                Some(chunk) => chunk,
                None => {
                    return Err(FramingError::AttachmentTruncated {
                        remaining: length - written,
                    })
                },
            };
            // A source longer than the declared length must not bleed into
            // the framing stream
            let remaining = (length - written) as usize;
            if chunk.len() > remaining {
                chunk.truncate(remaining);
            }
            self.stream.write_all(&chunk).await?;
            written += chunk.len() as u64;
            // Hold back 100 until the flush below
            let pct = ((written.saturating_mul(100) / length) as u8).min(99);
            attachment.report_progress_up_to(pct).await;
        }
        self.stream.flush().await?;
        attachment.report_progress_up_to(100).await;
        trace!(
            target: LOG_TARGET,
            "wrote attachment id={} ({} bytes)",
            attachment.id(),
            length
        );
        Ok(())
    }

    /// Read the next structured frame. Declared attachments of the previous
    /// frame must have been fully consumed first.
    pub async fn read_frame(&mut self) -> Result<WireFrame, FramingError> {
        if !self.attachments.is_clear() {
            return Err(FramingError::UnreadAttachments(self.attachments.pending()));
        }
        let mut len_bytes = [0u8; 4];
        self.read_exact_buffered(&mut len_bytes).await?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > self.max_frame_size {
            return Err(FramingError::FrameTooLarge {
                got: len,
                max: self.max_frame_size,
            });
        }
        let mut compressed = vec![0u8; len];
        self.read_exact_buffered(&mut compressed).await?;
        let raw = inflate(&compressed, self.max_frame_size)?;
        let frame = WireFrame::from_wire_bytes(&raw)?;

        let declared = match &frame {
            WireFrame::Request(request) => request.stream_ids.len(),
            WireFrame::Response(response) => response.stream_ids.len(),
            WireFrame::IdentityAnnounce(_) => 0,
        };
        self.attachments.remaining_count = declared;
        trace!(
            target: LOG_TARGET,
            "read {} frame ({} attachments declared)",
            frame.variant_name(),
            declared
        );
        Ok(frame)
    }

    /// Begin reading the next declared attachment, returning its length, or
    /// `None` when all declared attachments have been consumed. The current
    /// attachment must be fully read through [`attachment_chunk`] first.
    ///
    /// [`attachment_chunk`]: FrameCodec::attachment_chunk
    pub async fn begin_attachment(&mut self) -> Result<Option<u64>, FramingError> {
        if let Some(remaining) = self.attachments.current_remaining {
            if remaining > 0 {
                return Err(FramingError::UnreadAttachments(self.attachments.pending()));
            }
            self.attachments.current_remaining = None;
        }
        if self.attachments.remaining_count == 0 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 8];
        self.read_exact_buffered(&mut len_bytes).await?;
        let length = u64::from_le_bytes(len_bytes);
        self.attachments.remaining_count -= 1;
        self.attachments.current_remaining = Some(length);
        Ok(Some(length))
    }

    /// Read the next chunk of the attachment begun with [`begin_attachment`];
    /// `None` once it is exhausted.
    ///
    /// [`begin_attachment`]: FrameCodec::begin_attachment
    pub async fn attachment_chunk(&mut self) -> Result<Option<Bytes>, FramingError> {
        let remaining = match self.attachments.current_remaining {
            None | Some(0) => {
                self.attachments.current_remaining = None;
                return Ok(None);
            },
            Some(remaining) => remaining,
        };
        let want = (remaining.min(ATTACHMENT_CHUNK_SIZE as u64)) as usize;
        let chunk = self.read_chunk_buffered(want).await?;
        self.attachments.current_remaining = Some(remaining - chunk.len() as u64);
        Ok(Some(chunk))
    }

    /// Consume every remaining declared attachment, discarding the bytes.
    /// Returns the number of bytes drained.
    pub async fn drain_attachments(&mut self) -> Result<u64, FramingError> {
        let mut drained = 0u64;
        loop {
            while let Some(chunk) = self.attachment_chunk().await? {
                drained += chunk.len() as u64;
            }
            if self.begin_attachment().await?.is_none() {
                break;
            }
        }
        if drained > 0 {
            debug!(target: LOG_TARGET, "drained {} unread attachment byte(s)", drained);
        }
        Ok(drained)
    }

    pub fn has_pending_attachments(&self) -> bool {
        !self.attachments.is_clear()
    }

    async fn read_exact_buffered(&mut self, out: &mut [u8]) -> Result<(), FramingError> {
        while self.read_buf.len() < out.len() {
            let read = self.stream.read_buf(&mut self.read_buf).await?;
            if read == 0 {
                return Err(FramingError::ConnectionClosed);
            }
        }
        let bytes = self.read_buf.split_to(out.len());
        out.copy_from_slice(&bytes);
        Ok(())
    }

    async fn read_chunk_buffered(&mut self, max: usize) -> Result<Bytes, FramingError> {
        if self.read_buf.is_empty() {
            let read = self.stream.read_buf(&mut self.read_buf).await?;
            if read == 0 {
                return Err(FramingError::ConnectionClosed);
            }
        }
        let take = self.read_buf.len().min(max);
        Ok(self.read_buf.split_to(take).freeze())
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>, FramingError> {
    let mut encoder = DeflateEncoder::new(
        Vec::with_capacity(data.len() / 2 + 16),
        Compression::default(),
    );
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn inflate(data: &[u8], max_size: usize) -> Result<Vec<u8>, FramingError> {
    let mut decoder = DeflateDecoder::new(data).take(max_size as u64 + 1);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    if out.len() > max_size {
        return Err(FramingError::InflateOverrun);
    }
    Ok(out)
}
