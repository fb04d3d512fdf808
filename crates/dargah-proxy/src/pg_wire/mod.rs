//! PostgreSQL v3 wire protocol, framing layer only.
//!
//! The proxy never interprets result sets; it frames, inspects and forwards.

pub mod codec;
pub mod messages;
pub mod startup;

pub use codec::{read_frame, CodecError};
pub use startup::StartupMessage;
