//! Minimal sensor client that speaks the frame protocol.
//!
//! Used by integration tests and by operators poking a running server. The
//! server never writes back, so the client only sends.

use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::framing::{DataType, FrameConfig, FrameError, write_frame};

/// A connected sensor.
pub struct SensorClient {
    stream: TcpStream,
    config: FrameConfig,
}

impl SensorClient {
    /// Connect to the server at `addr`.
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            stream,
            config: FrameConfig::default(),
        })
    }

    /// Send one frame.
    pub async fn send(&mut self, data_type: DataType, payload: &[u8]) -> Result<(), FrameError> {
        write_frame(&mut self.stream, data_type, payload, &self.config).await
    }

    /// Announce the client name used for subsequent files.
    pub async fn send_name(&mut self, name: &str) -> Result<(), FrameError> {
        self.send(DataType::Name, name.as_bytes()).await
    }

    /// Send a temperature, humidity or pressure reading.
    pub async fn send_reading(&mut self, data_type: DataType, value: f32) -> Result<(), FrameError> {
        self.send(data_type, &value.to_le_bytes()).await
    }

    /// Send an encoded image.
    pub async fn send_image(&mut self, jpeg: &[u8]) -> Result<(), FrameError> {
        self.send(DataType::Image, jpeg).await
    }

    /// Send free-form text for the server log.
    pub async fn send_text(&mut self, text: &str) -> Result<(), FrameError> {
        self.send(DataType::Other, text.as_bytes()).await
    }

    /// Write raw bytes without framing them.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Half-close the connection so the server sees an orderly disconnect.
    pub async fn finish(mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }
}
