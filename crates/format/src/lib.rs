//! # Format — shared on-disk format helpers
//!
//! Small, dependency-light building blocks used by every other TideKV crate:
//!
//! | Module   | Purpose                                                    |
//! |----------|------------------------------------------------------------|
//! | [`varint`]   | unsigned LEB128 variable-length integers               |
//! | [`fletcher`] | the Fletcher-32 variant used by the textual file header|
//! | [`pos`]      | the 64-bit page-position handle codec                  |
//! | [`map`]      | the `key:value,…` textual map grammar                  |
//!
//! Everything here is pure byte/string manipulation; no I/O.

pub mod fletcher;
pub mod map;
pub mod pos;
pub mod varint;

use thiserror::Error;

/// Errors produced while decoding one of the formats in this crate.
#[derive(Debug, Error)]
pub enum FormatError {
    /// A variable-length integer ran past the end of the input or was longer
    /// than the maximum encoded width.
    #[error("invalid variable-length integer")]
    BadVarint,

    /// A textual map string did not follow the `key:value,…` grammar.
    #[error("invalid map string at byte {0}")]
    BadMap(usize),

    /// A numeric field inside a textual map failed to parse.
    #[error("invalid numeric value for key {0:?}")]
    BadNumber(String),
}
