//! Persistence destinations for decoded sensor packets.
//!
//! [`FileSink`] writes one file per client and data type under a root
//! directory. [`RecordSink`] is an optional structured log of readings and
//! image references that the server feeds after each successful file write.

mod error;
pub mod fs;
pub mod records;

pub use error::SinkError;
pub use fs::FileSink;
pub use records::{JsonLinesSink, MemorySink, Record, RecordSink};
