//! Per-connection frame reassembly and packet handling.
//!
//! A [`Session`] owns one socket's read half, a fixed-capacity [`ReadBuffer`]
//! and the client's current name. It turns an arbitrarily fragmented byte
//! stream into whole [`Frame`]s and applies the dispatcher's actions to the
//! sink. Nothing in a session is shared with other connections.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stratos_sink::{FileSink, Record, RecordSink, SinkError};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::dispatch::{self, Action, ClientName, DispatchError, FileWrite};
use crate::framing::{DataType, Frame, FrameConfig, FrameError, HEADER_SIZE, decode_header};

/// Smallest usable read buffer: one full header.
pub const MIN_BUFFER_SIZE: usize = HEADER_SIZE;

/// What to do when a payload fill read returns more bytes than the payload
/// still needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverreadPolicy {
    /// Keep the surplus as the start of the next frame.
    #[default]
    Carry,
    /// Treat the surplus as a protocol violation and close the connection.
    Reject,
}

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of the reusable read buffer. Clamped to at least
    /// [`MIN_BUFFER_SIZE`]. Default: 8 KiB.
    pub buffer_size: usize,
    /// Payload size limits.
    pub frame: FrameConfig,
    /// Surplus handling during payload completion. Default: carry.
    pub overread: OverreadPolicy,
    /// Upper bound on any single read. `None` waits forever.
    pub read_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            frame: FrameConfig::default(),
            overread: OverreadPolicy::Carry,
            read_timeout: None,
        }
    }
}

/// Reasons a session ends other than an orderly disconnect.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The header could not be decoded or was refused.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The peer disconnected partway through a header.
    #[error("connection closed after {received} of 9 header bytes")]
    TruncatedHeader {
        /// Header bytes received before the disconnect.
        received: usize,
    },

    /// The peer disconnected partway through a payload.
    #[error("connection closed after {received} of {expected} payload bytes")]
    TruncatedPayload {
        /// Declared payload length.
        expected: usize,
        /// Payload bytes received before the disconnect.
        received: usize,
    },

    /// A fill read delivered more bytes than the payload needed.
    #[error("read {received} bytes while only {needed} were outstanding")]
    Overread {
        /// Bytes still needed for the payload.
        needed: usize,
        /// Bytes returned by the read.
        received: usize,
    },

    /// No bytes arrived within the configured read timeout.
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    /// The frame was well-formed but could not be handled.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Persisting the frame failed.
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// Transport error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fixed-capacity buffer holding bytes received but not yet consumed.
///
/// The filled region always starts at offset 0; [`ReadBuffer::consume`]
/// compacts the remainder to the front.
pub struct ReadBuffer {
    buf: Box<[u8]>,
    filled: usize,
}

impl ReadBuffer {
    /// Allocate a buffer of `capacity` bytes (at least [`MIN_BUFFER_SIZE`]).
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity.max(MIN_BUFFER_SIZE)].into_boxed_slice(),
            filled: 0,
        }
    }

    /// Number of buffered, unconsumed bytes.
    pub fn len(&self) -> usize {
        self.filled
    }

    /// Whether no bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// The buffered bytes.
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.filled]
    }

    /// Free space after the buffered bytes.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.filled..]
    }

    /// Mark `n` bytes of spare space as filled.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.filled + n <= self.buf.len());
        self.filled += n;
    }

    /// Drop the first `n` buffered bytes and move the rest to the front.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.filled);
        self.buf.copy_within(n..self.filled, 0);
        self.filled -= n;
    }
}

/// Shared destinations for every session spawned by one server.
pub struct SessionContext {
    /// Filesystem sink for images and readings.
    pub sink: FileSink,
    /// Optional structured record sink.
    pub records: Option<Arc<dyn RecordSink>>,
}

impl SessionContext {
    /// Context with only a filesystem sink.
    pub fn new(sink: FileSink) -> Self {
        Self {
            sink,
            records: None,
        }
    }

    /// Attach a record sink.
    pub fn with_records(mut self, records: Arc<dyn RecordSink>) -> Self {
        self.records = Some(records);
        self
    }
}

/// Reassembly and dispatch state for one connection.
pub struct Session<R> {
    reader: R,
    buffer: ReadBuffer,
    config: SessionConfig,
    client: ClientName,
}

impl<R: AsyncRead + Unpin> Session<R> {
    /// Start a session over `reader`.
    pub fn new(reader: R, config: SessionConfig) -> Self {
        Self {
            reader,
            buffer: ReadBuffer::new(config.buffer_size),
            config,
            client: ClientName::default(),
        }
    }

    /// The name bound by the most recent Name frame.
    pub fn client(&self) -> &ClientName {
        &self.client
    }

    /// Bytes already received that belong to the next frame.
    pub fn leftover(&self) -> usize {
        self.buffer.len()
    }

    /// Read the next complete frame.
    ///
    /// Returns `Ok(None)` when the peer disconnects cleanly between frames.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, SessionError> {
        while self.buffer.len() < HEADER_SIZE {
            if self.read_some().await? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(SessionError::TruncatedHeader {
                    received: self.buffer.len(),
                });
            }
        }

        let header = decode_header(self.buffer.filled())?;
        let data_type = header.data_type()?;
        header.check_size(&self.config.frame)?;

        let mut payload = Vec::with_capacity(header.length);
        let buffered = (self.buffer.len() - HEADER_SIZE).min(header.length);
        payload.extend_from_slice(&self.buffer.filled()[HEADER_SIZE..HEADER_SIZE + buffered]);
        self.buffer.consume(HEADER_SIZE + buffered);

        // The buffer is empty here unless the payload is already complete.
        while payload.len() < header.length {
            let needed = header.length - payload.len();
            let received = self.read_some().await?;
            if received == 0 {
                return Err(SessionError::TruncatedPayload {
                    expected: header.length,
                    received: payload.len(),
                });
            }
            if received > needed && self.config.overread == OverreadPolicy::Reject {
                return Err(SessionError::Overread { needed, received });
            }

            let take = received.min(needed);
            payload.extend_from_slice(&self.buffer.filled()[..take]);
            self.buffer.consume(take);
        }

        tracing::trace!(
            ?data_type,
            len = header.length,
            leftover = self.buffer.len(),
            "Frame complete"
        );
        Ok(Some(Frame { data_type, payload }))
    }

    /// Drive the session until the peer disconnects or an error occurs.
    ///
    /// An orderly disconnect returns `Ok(())`. Any error means the connection
    /// must be closed; nothing is written for the frame that caused it.
    pub async fn run(mut self, ctx: &SessionContext) -> Result<(), SessionError> {
        while let Some(frame) = self.next_frame().await? {
            let action = dispatch::dispatch(&frame, &self.client)?;
            self.apply(action, ctx).await?;
        }
        tracing::info!(client = %self.client, "Client disconnected");
        Ok(())
    }

    async fn apply(&mut self, action: Action, ctx: &SessionContext) -> Result<(), SessionError> {
        match action {
            Action::Write(write) => {
                if self.client.is_unknown() {
                    tracing::warn!(data_type = ?write.data_type, "Data received before a Name frame");
                }
                tracing::info!(client = %self.client, data_type = ?write.data_type, "Received data");
                let path = ctx.sink.write(&write.file_name, &write.contents).await?;
                if let Some(records) = &ctx.records
                    && let Some(record) = self.record_for(&write, &path)
                {
                    self.store_record(records, record).await;
                }
            }
            Action::Rename(name) => {
                tracing::info!(from = %self.client, to = %name, "Updated client name");
                self.client = name;
            }
            Action::Log(text) => {
                tracing::info!(client = %self.client, "{text}");
            }
        }
        Ok(())
    }

    fn record_for(&self, write: &FileWrite, path: &std::path::Path) -> Option<Record> {
        let client = self.client.as_str();
        match (write.data_type, write.reading) {
            (DataType::Temperature, Some(value)) => Some(Record::temperature(client, value)),
            (DataType::Pressure, Some(value)) => Some(Record::pressure(client, value)),
            (DataType::Image, _) => Some(Record::image(client, path)),
            _ => None,
        }
    }

    /// Push a record on the blocking pool; record sinks may do file IO.
    async fn store_record(&self, records: &Arc<dyn RecordSink>, record: Record) {
        let records = Arc::clone(records);
        match tokio::task::spawn_blocking(move || records.record(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(client = %self.client, "Failed to store record: {e}"),
            Err(e) => tracing::warn!(client = %self.client, "Record task failed: {e}"),
        }
    }

    async fn read_some(&mut self) -> Result<usize, SessionError> {
        let read = self.reader.read(self.buffer.spare_mut());
        let n = match self.config.read_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| SessionError::Timeout(limit))??,
            None => read.await?,
        };
        self.buffer.advance(n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::encode_frame;
    use stratos_sink::{JsonLinesSink, MemorySink};
    use tokio::io::{AsyncWriteExt, duplex};

    fn config(buffer_size: usize) -> SessionConfig {
        SessionConfig {
            buffer_size,
            ..SessionConfig::default()
        }
    }

    /// Session over a stream that was fully written and then closed.
    fn session_over(bytes: &[u8], config: SessionConfig) -> Session<&[u8]> {
        Session::new(bytes, config)
    }

    async fn collect_frames<R: AsyncRead + Unpin>(
        session: &mut Session<R>,
    ) -> Result<Vec<Frame>, SessionError> {
        let mut frames = Vec::new();
        while let Some(frame) = session.next_frame().await? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn sample_stream() -> (Vec<u8>, Vec<Frame>) {
        let frames = vec![
            Frame {
                data_type: DataType::Name,
                payload: b"sensor1".to_vec(),
            },
            Frame {
                data_type: DataType::Temperature,
                payload: 23.5f32.to_le_bytes().to_vec(),
            },
            Frame {
                data_type: DataType::Other,
                payload: Vec::new(),
            },
            Frame {
                data_type: DataType::Image,
                payload: (0..=255u8).cycle().take(3000).collect(),
            },
        ];
        let mut wire = Vec::new();
        for frame in &frames {
            wire.extend_from_slice(&encode_frame(frame.data_type, &frame.payload));
        }
        (wire, frames)
    }

    #[tokio::test]
    async fn test_frames_from_single_read() {
        let (wire, expected) = sample_stream();
        let mut session = session_over(&wire, config(64 * 1024));
        assert_eq!(collect_frames(&mut session).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_one_byte_chunks_reassemble() {
        let (wire, expected) = sample_stream();
        // A 1-byte duplex delivers every read as a single byte.
        let (mut client, server) = duplex(1);
        let writer = tokio::spawn(async move {
            client.write_all(&wire).await.unwrap();
        });

        let mut session = Session::new(server, config(16));
        let frames = collect_frames(&mut session).await.unwrap();
        writer.await.unwrap();
        assert_eq!(frames, expected);
    }

    #[tokio::test]
    async fn test_arbitrary_chunk_sizes_reassemble() {
        let (wire, expected) = sample_stream();
        for (chunk, buffer_size) in [(2, 9), (7, 9), (9, 32), (10, 10), (13, 4096), (500, 64)] {
            let (mut client, server) = duplex(chunk);
            let bytes = wire.clone();
            let writer = tokio::spawn(async move {
                for piece in bytes.chunks(chunk) {
                    client.write_all(piece).await.unwrap();
                }
            });

            let mut session = Session::new(server, config(buffer_size));
            let frames = collect_frames(&mut session).await.unwrap();
            writer.await.unwrap();
            assert_eq!(frames, expected, "chunk={chunk} buffer={buffer_size}");
        }
    }

    #[tokio::test]
    async fn test_leftover_header_bytes_carried_to_next_frame() {
        // First frame's last payload byte and the start of the next header
        // arrive in the same read.
        let mut wire = encode_frame(DataType::Humidity, &55.0f32.to_le_bytes());
        let next = encode_frame(DataType::Name, b"north");
        wire.extend_from_slice(&next[..5]);

        let (mut client, server) = duplex(64);
        client.write_all(&wire).await.unwrap();

        let mut session = Session::new(server, config(64));
        let first = session.next_frame().await.unwrap().unwrap();
        assert_eq!(first.data_type, DataType::Humidity);
        assert_eq!(session.leftover(), 5);

        client.write_all(&next[5..]).await.unwrap();
        drop(client);

        let second = session.next_frame().await.unwrap().unwrap();
        assert_eq!(second.payload, b"north");
        assert_eq!(session.leftover(), 0);
        assert!(session.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fill_read_surplus_carried() {
        // Header + part of the payload first, then the rest of the payload
        // together with a complete second frame in one read.
        let first = encode_frame(DataType::Image, &[7u8; 40]);
        let second = encode_frame(DataType::Pressure, &1001.5f32.to_le_bytes());

        let (mut client, server) = duplex(256);
        client.write_all(&first[..20]).await.unwrap();

        let mut session = Session::new(server, config(256));
        let reader = tokio::spawn(async move {
            let frames = collect_frames(&mut session).await;
            (session, frames)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut rest = first[20..].to_vec();
        rest.extend_from_slice(&second);
        client.write_all(&rest).await.unwrap();
        drop(client);

        let (_session, frames) = reader.await.unwrap();
        let frames = frames.unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload, vec![7u8; 40]);
        assert_eq!(frames[1].payload, 1001.5f32.to_le_bytes());
    }

    #[tokio::test]
    async fn test_fill_read_surplus_rejected_under_strict_policy() {
        let first = encode_frame(DataType::Image, &[7u8; 40]);
        let second = encode_frame(DataType::Other, b"x");

        let (mut client, server) = duplex(256);
        client.write_all(&first[..20]).await.unwrap();

        let strict = SessionConfig {
            overread: OverreadPolicy::Reject,
            ..config(256)
        };
        let mut session = Session::new(server, strict);
        let reader = tokio::spawn(async move { session.next_frame().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut rest = first[20..].to_vec();
        rest.extend_from_slice(&second);
        client.write_all(&rest).await.unwrap();

        let result = reader.await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::Overread { needed: 29, received: 39 })
        ));
    }

    #[tokio::test]
    async fn test_clean_disconnect_between_frames() {
        let mut session = session_over(&[], config(32));
        assert!(session.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_header_is_error() {
        let wire = [3u8, 0, 0, 0];
        let mut session = session_over(&wire, config(32));
        assert!(matches!(
            session.next_frame().await,
            Err(SessionError::TruncatedHeader { received: 4 })
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_error() {
        let wire = encode_frame(DataType::Image, &[1u8; 100]);
        let mut session = session_over(&wire[..50], config(32));
        assert!(matches!(
            session.next_frame().await,
            Err(SessionError::TruncatedPayload {
                expected: 100,
                received: 41
            })
        ));
    }

    #[tokio::test]
    async fn test_unknown_tag_is_error() {
        let mut wire = 4u64.to_le_bytes().to_vec();
        wire.push(255);
        wire.extend_from_slice(&[0, 0, 0, 0]);
        let mut session = session_over(&wire, config(32));
        assert!(matches!(
            session.next_frame().await,
            Err(SessionError::Frame(FrameError::UnknownType(255)))
        ));
    }

    #[tokio::test]
    async fn test_oversized_claim_refused_before_allocation() {
        let mut wire = u64::MAX.to_le_bytes().to_vec();
        wire.push(DataType::Image.tag());
        let mut session = session_over(&wire, config(32));
        let result = session.next_frame().await;
        assert!(matches!(
            result,
            Err(SessionError::Frame(
                FrameError::PayloadTooLarge { .. } | FrameError::HeaderDecode(_)
            ))
        ));
    }

    #[tokio::test]
    async fn test_read_timeout_closes_stalled_session() {
        let (mut client, server) = duplex(64);
        let header = encode_frame(DataType::Image, &[0u8; 32]);
        client.write_all(&header[..9]).await.unwrap();

        let stalled = SessionConfig {
            read_timeout: Some(Duration::from_millis(30)),
            ..config(64)
        };
        let mut session = Session::new(server, stalled);
        assert!(matches!(
            session.next_frame().await,
            Err(SessionError::Timeout(_))
        ));
    }

    #[test]
    fn test_buffer_compaction_keeps_order() {
        let mut buffer = ReadBuffer::new(4);
        assert_eq!(buffer.spare_mut().len(), MIN_BUFFER_SIZE);

        buffer.spare_mut()[..6].copy_from_slice(b"abcdef");
        buffer.advance(6);
        buffer.consume(4);
        assert_eq!(buffer.filled(), b"ef");

        buffer.spare_mut()[..2].copy_from_slice(b"gh");
        buffer.advance(2);
        assert_eq!(buffer.filled(), b"efgh");
    }

    #[tokio::test]
    async fn test_run_applies_actions_to_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let records = Arc::new(MemorySink::new());
        let ctx = SessionContext::new(FileSink::create(dir.path()).await.unwrap())
            .with_records(records.clone());

        let (wire, _) = sample_stream();
        Session::new(wire.as_slice(), config(128))
            .run(&ctx)
            .await
            .unwrap();

        let temp = std::fs::read_to_string(dir.path().join("sensor1-temp.txt")).unwrap();
        assert_eq!(temp, "23.5");
        let image = std::fs::read(dir.path().join("sensor1.jpg")).unwrap();
        assert_eq!(image.len(), 3000);
        assert_eq!(records.records().len(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_invalid_name_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = SessionContext::new(FileSink::create(dir.path()).await.unwrap());

        let mut wire = encode_frame(DataType::Name, b"../outside");
        wire.extend_from_slice(&encode_frame(DataType::Image, b"img"));
        let result = Session::new(wire.as_slice(), config(64)).run(&ctx).await;

        assert!(matches!(
            result,
            Err(SessionError::Dispatch(DispatchError::InvalidName(_)))
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_run_appends_json_records_off_the_async_task() {
        let dir = tempfile::tempdir().unwrap();
        let records_path = dir.path().join("records.jsonl");
        let records = Arc::new(JsonLinesSink::open(&records_path).unwrap());
        let sink_root = dir.path().join("files");
        let ctx = SessionContext::new(FileSink::create(&sink_root).await.unwrap())
            .with_records(records);

        let (wire, _) = sample_stream();
        Session::new(wire.as_slice(), config(128))
            .run(&ctx)
            .await
            .unwrap();

        let lines = std::fs::read_to_string(&records_path).unwrap();
        let lines: Vec<&str> = lines.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"kind\":\"atmospheric\""));
        assert!(lines[1].contains("sensor1.jpg"));
    }
}
