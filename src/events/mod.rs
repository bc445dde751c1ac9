//! Event intake: parsing, signature verification, and the desired-state
//! source that turns accepted events into store mutations.

pub mod parser;
pub mod signature;
pub mod source;

pub use parser::{normalize, parse_event, EventPayload, ParseError};
pub use signature::{verify_signature, SIGNATURE_HEADER};
pub use source::{DesiredStateSource, SourceError};
