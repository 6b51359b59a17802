//! # Strand Core Types
//!
//! Shared vocabulary for every fiber in a Strand deployment.
//!
//! ## Modules
//!
//! - [`address`]: packed 64-bit `(time, process, sequence)` identifiers and the
//!   per-process generator that mints them
//! - [`envelope`]: the three message kinds (message, request, response) and the
//!   typed payload contracts handlers are written against
//! - [`error`]: the recoverable error taxonomy and its wire error codes
//!
//! ## Quick Start
//!
//! ```rust
//! use strand_types::{ActorId, IdGenerator};
//!
//! let generator = IdGenerator::new(7).unwrap();
//! let instance = generator.generate_instance_id();
//! assert_eq!(instance.process(), 7);
//!
//! let raw = instance.as_u64();
//! assert_eq!(ActorId::from_raw(raw), instance);
//! ```

pub mod address;
pub mod envelope;
pub mod error;

pub use address::{ActorId, ActorIdParts, IdGenerator, MAX_PROCESS, MAX_SEQUENCE, MAX_TIME};
pub use envelope::{ActorMessage, ActorRequest, Envelope, EnvelopeKind, RawResponse};
pub use error::{CoreError, ErrorCode, Result};
