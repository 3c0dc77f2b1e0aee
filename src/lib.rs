//! Memory-access tracing for instrumented programs.
//!
//! Datagrind records every memory access a guest program performs into a
//! compact binary trace, then answers "what touched this byte, from
//! where, and when?" over the loaded trace. The crate has two cooperating
//! cores sharing one wire format:
//!
//! - [`producer`]: runs inside a single-threaded instrumentation host.
//!   Interns block shapes and call-stack contexts so each dynamic block
//!   execution costs one small run record, tracks heap-block lifecycles,
//!   and announces loaded code objects.
//! - [`viewer`]: streams a trace back in, expands runs against the
//!   interned tables into a pool-backed columnar store, compacts the
//!   sparse address space page by page, and serves nearest-access
//!   queries on the (address, instruction-sequence) plane.
//!
//! # Example
//!
//! ```
//! use datagrind::viewer::{load, LoadOptions};
//!
//! # fn main() -> Result<(), datagrind::error::TraceError> {
//! # let trace: Vec<u8> = datagrind::record::TraceWriter::new(Vec::new())
//! #     .and_then(|w| w.close()).unwrap();
//! let data = load(std::io::Cursor::new(trace), &LoadOptions::default())?;
//! for access in data.store.iter_accesses() {
//!     let _ = (access.addr, access.iseq);
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod producer;
pub mod record;
pub mod viewer;

pub use error::{ContentError, TraceError};
pub use producer::{BlockBuilder, ClientRequest, Producer, ProducerOptions};
pub use record::{AccessDir, RecordKind, TraceWriter, Word};
pub use viewer::{load, AccessHit, DecodedAccess, LoadOptions, NearestQuery, TraceData};
