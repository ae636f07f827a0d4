//! Mapping of completed frames to sink actions.
//!
//! The dispatcher is pure: it never touches the filesystem. The session applies
//! the returned [`Action`] and keeps the [`ClientName`] binding up to date.

use std::fmt;

use crate::framing::{DataType, Frame};

/// Name used for files written before the client has identified itself.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Errors raised for frames that are well-formed on the wire but unusable.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The client name cannot be used as a file name component.
    #[error("invalid client name {0:?}")]
    InvalidName(String),

    /// A reading payload was not a 4-byte float.
    #[error("{data_type:?} reading must be 4 bytes, got {len}")]
    InvalidReading {
        /// Type of the offending frame.
        data_type: DataType,
        /// Actual payload length.
        len: usize,
    },
}

/// Session-scoped client name, safe to embed in a file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientName(String);

impl ClientName {
    /// Validate a name announced by a client.
    ///
    /// Rejects empty names, the relative path components `.` and `..`, and
    /// anything containing a path separator or NUL.
    pub fn parse(name: &str) -> Result<Self, DispatchError> {
        let forbidden = |c: char| c == '/' || c == '\\' || c == '\0';
        if name.is_empty() || name == "." || name == ".." || name.contains(forbidden) {
            return Err(DispatchError::InvalidName(name.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    /// The name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the client has not sent a Name frame yet.
    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_CLIENT
    }
}

impl Default for ClientName {
    fn default() -> Self {
        Self(UNKNOWN_CLIENT.to_string())
    }
}

impl fmt::Display for ClientName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A file the sink should create or overwrite.
#[derive(Debug, Clone, PartialEq)]
pub struct FileWrite {
    /// Type of the frame that produced the write.
    pub data_type: DataType,
    /// File name relative to the sink root.
    pub file_name: String,
    /// Full file contents.
    pub contents: Vec<u8>,
    /// Decoded value for reading frames.
    pub reading: Option<f32>,
}

/// What the session must do with a dispatched frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Persist a file, replacing any previous contents.
    Write(FileWrite),
    /// Bind a new client name for all subsequent frames.
    Rename(ClientName),
    /// Emit text to the operator log only.
    Log(String),
}

/// File name for a persisted data type, or `None` for types never written.
pub fn file_name(client: &ClientName, data_type: DataType) -> Option<String> {
    let suffix = match data_type {
        DataType::Image => ".jpg",
        DataType::Temperature => "-temp.txt",
        DataType::Humidity => "-hum.txt",
        DataType::Pressure => "-bmp.txt",
        DataType::Name | DataType::Other => return None,
    };
    Some(format!("{client}{suffix}"))
}

/// Decode a 4-byte little-endian `f32` reading.
pub fn decode_reading(data_type: DataType, payload: &[u8]) -> Result<f32, DispatchError> {
    let bytes: [u8; 4] = payload
        .try_into()
        .map_err(|_| DispatchError::InvalidReading {
            data_type,
            len: payload.len(),
        })?;
    Ok(f32::from_le_bytes(bytes))
}

/// Map a frame to the action the session should take.
pub fn dispatch(frame: &Frame, client: &ClientName) -> Result<Action, DispatchError> {
    let data_type = frame.data_type;
    match data_type {
        DataType::Name => {
            let name = String::from_utf8_lossy(&frame.payload);
            ClientName::parse(&name).map(Action::Rename)
        }
        DataType::Other => Ok(Action::Log(
            String::from_utf8_lossy(&frame.payload).into_owned(),
        )),
        DataType::Image | DataType::Temperature | DataType::Humidity | DataType::Pressure => {
            let (contents, reading) = if data_type.is_reading() {
                let value = decode_reading(data_type, &frame.payload)?;
                (value.to_string().into_bytes(), Some(value))
            } else {
                (frame.payload.clone(), None)
            };
            Ok(Action::Write(FileWrite {
                data_type,
                file_name: file_name(client, data_type).unwrap_or_default(),
                contents,
                reading,
            }))
        }
    }
}
