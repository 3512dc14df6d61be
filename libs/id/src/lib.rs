//! # portico-id
//!
//! Typed identifiers for the portico gateway.
//!
//! All IDs use a prefixed format: `{prefix}_{ulid}`, for example
//! `rt_01HV4Z2WQXKJNM8GPQY6VBKC3D` for a route. The prefix keeps route IDs
//! and request IDs from being mixed up, and the ULID keeps them sortable by
//! creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
