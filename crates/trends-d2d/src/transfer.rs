//! File Transfer Engine
//!
//! Chunked file transfer over a connected data channel:
//!
//! ```text
//! sender                               receiver
//!   file-request  ------------------->  Pending (user decides)
//!                 <-------------------  file-accept | file-reject
//!   file-chunk-meta + binary (xN) --->  buffered in order
//!   file-complete ------------------->  artifact materialized
//! ```
//!
//! [`TransferEngine`] is the only place transfer status changes. It is a
//! plain state machine; the connection manager drives it from the channel
//! and publishes the returned snapshots. [`stream_chunks`] is the sender's
//! flow-controlled loop.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::codec::{chunk_envelope_id, complete_envelope_id, Envelope, Message};
use crate::transport::TransportError;
use crate::types::{FileTransferState, TransferDirection, TransferStatus, CHUNK_SIZE};

/// Transfer errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("Unknown transfer {0}")]
    Unknown(String),
    #[error("Transfer {0} already exists")]
    Duplicate(String),
    #[error("Transfer {id} is {status:?}")]
    InvalidState { id: String, status: TransferStatus },
    #[error("Transfer {0} does not go that way")]
    WrongDirection(String),
    #[error("Transfer {id}: expected chunk {expected}, got {got}")]
    OutOfOrder { id: String, expected: u32, got: u32 },
    #[error("Transfer {0} received more bytes than announced")]
    Oversized(String),
    #[error("Transfer {0} aborted: channel closed")]
    Aborted(String),
    #[error("Transfer {0} cancelled")]
    Cancelled(String),
    #[error("Transfer {id} I/O error: {reason}")]
    Io { id: String, reason: String },
}

/// Number of chunks for a file of `size` bytes
pub fn chunk_count(size: u64) -> u32 {
    size.div_ceil(CHUNK_SIZE as u64) as u32
}

/// Progress percentage, capped at 99 until completion
pub fn progress_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = (done.saturating_mul(100) + total / 2) / total;
    pct.min(99) as u8
}

/// Sender flow control
#[derive(Debug, Clone)]
pub struct Backpressure {
    /// Wait while the channel buffers more than this many bytes
    pub high_water_mark: usize,
    pub poll_interval: Duration,
}

impl Default for Backpressure {
    fn default() -> Self {
        Self {
            high_water_mark: 1024 * 1024,
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Contents offered to a peer
#[derive(Debug, Clone)]
pub enum FileSource {
    Memory {
        name: String,
        mime_type: String,
        data: Bytes,
    },
    Path {
        name: String,
        mime_type: String,
        path: PathBuf,
        size: u64,
    },
}

impl FileSource {
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::Memory {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Reference a file on disk. Contents are read lazily while sending.
    pub async fn from_path(path: impl AsRef<Path>, mime_type: impl Into<String>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self::Path {
            name,
            mime_type: mime_type.into(),
            path,
            size: meta.len(),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Memory { name, .. } | Self::Path { name, .. } => name,
        }
    }

    pub fn mime_type(&self) -> &str {
        match self {
            Self::Memory { mime_type, .. } | Self::Path { mime_type, .. } => mime_type,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Self::Memory { data, .. } => data.len() as u64,
            Self::Path { size, .. } => *size,
        }
    }

    pub async fn open(&self) -> std::io::Result<ChunkReader> {
        let inner = match self {
            Self::Memory { data, .. } => ReaderKind::Memory {
                data: data.clone(),
                offset: 0,
            },
            Self::Path { path, .. } => ReaderKind::File(tokio::fs::File::open(path).await?),
        };
        Ok(ChunkReader { inner })
    }
}

enum ReaderKind {
    Memory { data: Bytes, offset: usize },
    File(tokio::fs::File),
}

/// Yields `CHUNK_SIZE` slices of a source; only the last may be shorter.
pub struct ChunkReader {
    inner: ReaderKind,
}

impl ChunkReader {
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        match &mut self.inner {
            ReaderKind::Memory { data, offset } => {
                if *offset >= data.len() {
                    return Ok(None);
                }
                let end = (*offset + CHUNK_SIZE).min(data.len());
                let chunk = data.slice(*offset..end);
                *offset = end;
                Ok(Some(chunk))
            }
            ReaderKind::File(file) => {
                let mut buf = vec![0u8; CHUNK_SIZE];
                let mut filled = 0;
                while filled < CHUNK_SIZE {
                    let n = file.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                if filled == 0 {
                    return Ok(None);
                }
                buf.truncate(filled);
                Ok(Some(Bytes::from(buf)))
            }
        }
    }
}

/// A completely received file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub transfer_id: String,
    pub file_name: String,
    pub mime_type: String,
    pub data: Bytes,
}

/// An accepted outgoing transfer, ready to stream
#[derive(Debug, Clone)]
pub struct OutgoingJob {
    pub transfer_id: String,
    pub source: FileSource,
    pub total_chunks: u32,
    cancelled: Arc<AtomicBool>,
}

impl OutgoingJob {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

struct Transfer {
    state: FileTransferState,
    /// Outgoing: held until accepted
    source: Option<FileSource>,
    /// Incoming: chunks in arrival order, which is chunk order
    chunks: Vec<Bytes>,
    cancelled: Arc<AtomicBool>,
}

impl Transfer {
    fn new(state: FileTransferState, source: Option<FileSource>) -> Self {
        Self {
            state,
            source,
            chunks: Vec::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn expect(&self, status: TransferStatus) -> Result<(), TransferError> {
        if self.state.status == status {
            Ok(())
        } else {
            Err(TransferError::InvalidState {
                id: self.state.transfer_id.clone(),
                status: self.state.status,
            })
        }
    }

    fn expect_direction(&self, direction: TransferDirection) -> Result<(), TransferError> {
        if self.state.direction == direction {
            Ok(())
        } else {
            Err(TransferError::WrongDirection(self.state.transfer_id.clone()))
        }
    }

    /// Move to a terminal status, releasing buffers and stopping any sender
    fn finish(&mut self, status: TransferStatus) {
        self.state.status = status;
        if status == TransferStatus::Completed {
            self.state.progress = 100;
        }
        self.cancelled.store(status != TransferStatus::Completed, Ordering::Relaxed);
        self.source = None;
        self.chunks = Vec::new();
    }
}

/// Per-peer transfer state machine
#[derive(Default)]
pub struct TransferEngine {
    transfers: HashMap<String, Transfer>,
}

impl TransferEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, transfer_id: &str) -> Option<FileTransferState> {
        self.transfers.get(transfer_id).map(|t| t.state.clone())
    }

    pub fn list(&self) -> Vec<FileTransferState> {
        self.transfers.values().map(|t| t.state.clone()).collect()
    }

    fn entry(&mut self, transfer_id: &str) -> Result<&mut Transfer, TransferError> {
        self.transfers
            .get_mut(transfer_id)
            .ok_or_else(|| TransferError::Unknown(transfer_id.to_string()))
    }

    /// Register an outgoing offer. Returns the state and the request to send.
    pub fn offer(
        &mut self,
        transfer_id: String,
        source: FileSource,
    ) -> Result<(FileTransferState, Message), TransferError> {
        if self.transfers.contains_key(&transfer_id) {
            return Err(TransferError::Duplicate(transfer_id));
        }
        let total_chunks = chunk_count(source.size());
        let state = FileTransferState {
            transfer_id: transfer_id.clone(),
            file_name: source.name().to_string(),
            file_size: source.size(),
            mime_type: source.mime_type().to_string(),
            direction: TransferDirection::Outgoing,
            status: TransferStatus::Pending,
            bytes_transferred: 0,
            total_chunks,
            progress: 0,
        };
        let request = Message::FileRequest {
            transfer_id: transfer_id.clone(),
            file_name: state.file_name.clone(),
            file_size: state.file_size,
            mime_type: state.mime_type.clone(),
            total_chunks,
        };
        self.transfers
            .insert(transfer_id, Transfer::new(state.clone(), Some(source)));
        Ok((state, request))
    }

    /// Record an incoming request as Pending
    pub fn on_request(
        &mut self,
        transfer_id: String,
        file_name: String,
        file_size: u64,
        mime_type: String,
        total_chunks: u32,
    ) -> Result<FileTransferState, TransferError> {
        if self.transfers.contains_key(&transfer_id) {
            return Err(TransferError::Duplicate(transfer_id));
        }
        if total_chunks != chunk_count(file_size) {
            warn!(
                transfer = %transfer_id,
                "announced {} chunks for {} bytes", total_chunks, file_size
            );
        }
        let state = FileTransferState {
            transfer_id: transfer_id.clone(),
            file_name,
            file_size,
            mime_type,
            direction: TransferDirection::Incoming,
            status: TransferStatus::Pending,
            bytes_transferred: 0,
            total_chunks,
            progress: 0,
        };
        self.transfers
            .insert(transfer_id, Transfer::new(state.clone(), None));
        Ok(state)
    }

    /// Accept an incoming request
    pub fn accept(&mut self, transfer_id: &str) -> Result<(FileTransferState, Message), TransferError> {
        let t = self.entry(transfer_id)?;
        t.expect_direction(TransferDirection::Incoming)?;
        t.expect(TransferStatus::Pending)?;
        t.state.status = TransferStatus::Transferring;
        let reply = Message::FileAccept {
            transfer_id: transfer_id.to_string(),
        };
        Ok((t.state.clone(), reply))
    }

    /// Reject an incoming request
    pub fn reject(&mut self, transfer_id: &str) -> Result<(FileTransferState, Message), TransferError> {
        let t = self.entry(transfer_id)?;
        t.expect_direction(TransferDirection::Incoming)?;
        t.expect(TransferStatus::Pending)?;
        t.finish(TransferStatus::Rejected);
        let reply = Message::FileReject {
            transfer_id: transfer_id.to_string(),
        };
        Ok((t.state.clone(), reply))
    }

    /// The peer accepted our offer; hand out the job to stream
    pub fn on_accept(&mut self, transfer_id: &str) -> Result<(FileTransferState, OutgoingJob), TransferError> {
        let t = self.entry(transfer_id)?;
        t.expect_direction(TransferDirection::Outgoing)?;
        t.expect(TransferStatus::Pending)?;
        let source = t
            .source
            .take()
            .ok_or_else(|| TransferError::Unknown(transfer_id.to_string()))?;
        t.state.status = TransferStatus::Transferring;
        let job = OutgoingJob {
            transfer_id: transfer_id.to_string(),
            source,
            total_chunks: t.state.total_chunks,
            cancelled: t.cancelled.clone(),
        };
        Ok((t.state.clone(), job))
    }

    /// The peer rejected our offer, possibly after streaming started
    pub fn on_reject(&mut self, transfer_id: &str) -> Result<FileTransferState, TransferError> {
        let t = self.entry(transfer_id)?;
        t.expect_direction(TransferDirection::Outgoing)?;
        if t.state.status.is_terminal() {
            return Err(TransferError::InvalidState {
                id: transfer_id.to_string(),
                status: t.state.status,
            });
        }
        t.finish(TransferStatus::Rejected);
        Ok(t.state.clone())
    }

    /// Sender progress after `bytes_sent` bytes are queued
    pub fn record_sent(&mut self, transfer_id: &str, bytes_sent: u64) -> Option<FileTransferState> {
        let t = self.transfers.get_mut(transfer_id)?;
        if t.state.status != TransferStatus::Transferring {
            return None;
        }
        t.state.bytes_transferred = bytes_sent;
        t.state.progress = progress_percent(bytes_sent, t.state.file_size);
        Some(t.state.clone())
    }

    /// `file-complete` was handed to the channel
    pub fn finish_send(&mut self, transfer_id: &str) -> Option<FileTransferState> {
        let t = self.transfers.get_mut(transfer_id)?;
        if t.state.status != TransferStatus::Transferring {
            return None;
        }
        t.state.bytes_transferred = t.state.file_size;
        t.finish(TransferStatus::Completed);
        Some(t.state.clone())
    }

    /// Store one received chunk
    pub fn on_chunk(
        &mut self,
        transfer_id: &str,
        chunk_index: u32,
        data: Bytes,
    ) -> Result<FileTransferState, TransferError> {
        let t = self.entry(transfer_id)?;
        t.expect_direction(TransferDirection::Incoming)?;
        t.expect(TransferStatus::Transferring)?;
        let expected = t.chunks.len() as u32;
        if chunk_index != expected {
            return Err(TransferError::OutOfOrder {
                id: transfer_id.to_string(),
                expected,
                got: chunk_index,
            });
        }
        let received = t.state.bytes_transferred + data.len() as u64;
        if received > t.state.file_size {
            t.finish(TransferStatus::Failed);
            return Err(TransferError::Oversized(transfer_id.to_string()));
        }
        t.chunks.push(data);
        t.state.bytes_transferred = received;
        t.state.progress = progress_percent(received, t.state.file_size);
        Ok(t.state.clone())
    }

    /// `file-complete` arrived. Returns the artifact when every byte is present;
    /// otherwise the transfer fails and no artifact is produced.
    pub fn on_complete(
        &mut self,
        transfer_id: &str,
        total_chunks: u32,
    ) -> Result<(FileTransferState, Option<ReceivedFile>), TransferError> {
        let t = self.entry(transfer_id)?;
        t.expect_direction(TransferDirection::Incoming)?;
        t.expect(TransferStatus::Transferring)?;

        let chunks = t.chunks.len() as u32;
        if chunks != total_chunks || t.state.bytes_transferred != t.state.file_size {
            warn!(
                transfer = %transfer_id,
                "incomplete: {} of {} chunks, {} of {} bytes",
                chunks, total_chunks, t.state.bytes_transferred, t.state.file_size
            );
            t.finish(TransferStatus::Failed);
            return Ok((t.state.clone(), None));
        }

        let mut data = BytesMut::with_capacity(t.state.file_size as usize);
        for chunk in &t.chunks {
            data.extend_from_slice(chunk);
        }
        t.finish(TransferStatus::Completed);
        let file = ReceivedFile {
            transfer_id: transfer_id.to_string(),
            file_name: t.state.file_name.clone(),
            mime_type: t.state.mime_type.clone(),
            data: data.freeze(),
        };
        Ok((t.state.clone(), Some(file)))
    }

    /// Fail one non-terminal transfer
    pub fn fail(&mut self, transfer_id: &str) -> Option<FileTransferState> {
        let t = self.transfers.get_mut(transfer_id)?;
        if t.state.status.is_terminal() {
            return None;
        }
        t.finish(TransferStatus::Failed);
        Some(t.state.clone())
    }

    /// The channel is gone: fail everything that has not finished
    pub fn fail_active(&mut self) -> Vec<FileTransferState> {
        self.transfers
            .values_mut()
            .filter(|t| !t.state.status.is_terminal())
            .map(|t| {
                t.finish(TransferStatus::Failed);
                t.state.clone()
            })
            .collect()
    }
}

/// Where the sender loop writes
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn buffered_amount(&self) -> usize;

    fn is_open(&self) -> bool;

    /// Write a chunk header and its binary frame back to back
    async fn send_chunk(&self, meta: Envelope, data: Bytes) -> Result<(), TransportError>;

    async fn send_envelope(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// Wait until the sink drains below the high-water mark.
///
/// There is no timeout: a stalled channel keeps the loop waiting until it
/// drains, closes, or the transfer is cancelled.
async fn wait_for_drain<S: ChunkSink + ?Sized>(
    job: &OutgoingJob,
    sink: &S,
    backpressure: &Backpressure,
) -> Result<(), TransferError> {
    loop {
        if job.is_cancelled() {
            return Err(TransferError::Cancelled(job.transfer_id.clone()));
        }
        if !sink.is_open() {
            return Err(TransferError::Aborted(job.transfer_id.clone()));
        }
        if sink.buffered_amount().await <= backpressure.high_water_mark {
            return Ok(());
        }
        tokio::time::sleep(backpressure.poll_interval).await;
    }
}

/// Stream an accepted job: chunks, then `file-complete`.
///
/// `on_progress` is called with the cumulative byte count after each chunk.
/// Returns the number of chunks sent.
pub async fn stream_chunks<S, F>(
    job: &OutgoingJob,
    sink: &S,
    backpressure: &Backpressure,
    mut on_progress: F,
) -> Result<u32, TransferError>
where
    S: ChunkSink + ?Sized,
    F: FnMut(u64) + Send,
{
    let io_err = |e: std::io::Error| TransferError::Io {
        id: job.transfer_id.clone(),
        reason: e.to_string(),
    };
    let mut reader = job.source.open().await.map_err(io_err)?;
    let mut index = 0u32;
    let mut sent = 0u64;

    while let Some(chunk) = reader.next_chunk().await.map_err(io_err)? {
        wait_for_drain(job, sink, backpressure).await?;
        let len = chunk.len() as u64;
        let meta = Envelope::new(
            chunk_envelope_id(&job.transfer_id, index),
            Message::FileChunkMeta {
                transfer_id: job.transfer_id.clone(),
                chunk_index: index,
            },
        );
        sink.send_chunk(meta, chunk)
            .await
            .map_err(|_| TransferError::Aborted(job.transfer_id.clone()))?;
        index += 1;
        sent += len;
        on_progress(sent);
    }

    if job.is_cancelled() {
        return Err(TransferError::Cancelled(job.transfer_id.clone()));
    }
    if index != job.total_chunks {
        warn!(
            transfer = %job.transfer_id,
            "source changed while sending: {} chunks instead of {}", index, job.total_chunks
        );
    }

    let complete = Envelope::new(
        complete_envelope_id(&job.transfer_id),
        Message::FileComplete {
            transfer_id: job.transfer_id.clone(),
            total_chunks: index,
        },
    );
    sink.send_envelope(complete)
        .await
        .map_err(|_| TransferError::Aborted(job.transfer_id.clone()))?;
    debug!(transfer = %job.transfer_id, "sent {} chunks, {} bytes", index, sent);
    Ok(index)
}
