//! Sensor telemetry over TCP: frame codec, per-connection reassembly, packet
//! dispatch and the accept loop.

pub mod dispatch;
pub mod framing;
pub mod platform;
pub mod session;
pub mod tcp_client;
pub mod tcp_server;

pub use dispatch::{Action, ClientName, DispatchError, FileWrite, dispatch};
pub use framing::{
    DataType, Frame, FrameConfig, FrameError, FrameHeader, HEADER_SIZE, decode_header,
    encode_frame, write_frame,
};
pub use platform::SocketConfig;
pub use session::{
    OverreadPolicy, ReadBuffer, Session, SessionConfig, SessionContext, SessionError,
};
pub use tcp_client::SensorClient;
pub use tcp_server::{
    ConnectionId, ConnectionLimitReached, ConnectionMap, ServerConfig, TelemetryServer,
};
