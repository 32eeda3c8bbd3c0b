//! HPROF to CHD converter.
//!
//! This crate reads HPROF heap dumps (the 4-byte identifier flavor
//! produced by Android runtimes) and crunches them into the compact CHD
//! format: the object reference graph, class shapes and GC roots survive,
//! while primitive field values are dropped and strings are reduced to
//! hashes.
//!
//! The conversion makes two sequential passes over the source dump. The
//! first pass collects class shapes and string payloads (a dump may
//! reference a class defined later in the stream); the second re-reads
//! the dump and emits the output against those indices.
//!
//! # Modules
//!
//! - [`stream`] - fixed-width big-endian read/write primitives
//! - [`record`] - top-level record reader
//! - [`heap`] - heap sub-record dispatcher
//! - [`crunch`] - the two-pass conversion pipeline
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! let stats = hprof_to_chd::crunch::crunch(
//!     Path::new("in.hprof"),
//!     Path::new("out.chd"),
//! ).unwrap();
//!
//! println!("Kept {} references", stats.references);
//! ```

use thiserror::Error;

pub mod crunch;
pub mod heap;
pub mod record;
pub mod stream;

// Re-export chd_parse for convenience
pub use chd_parse;

/// Errors that can occur while converting an HPROF dump.
///
/// The source stream has no resynchronization points, so every variant is
/// fatal to the run: a tag outside the known set or a mis-sized record
/// would desynchronize the cursor for everything after it.
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode output: {0}")]
    Write(#[from] chd_parse::WriteError),

    #[error("not an HPROF file (missing version header)")]
    InvalidHeader,

    #[error("unsupported identifier size {0} (only 4-byte identifiers are supported)")]
    UnsupportedIdSize(u32),

    #[error("truncated input at offset {offset}")]
    Truncated { offset: u64 },

    #[error("unsupported record tag {tag:#04x} at offset {offset}")]
    UnsupportedRecordTag { tag: u8, offset: u64 },

    #[error("unsupported heap record tag {tag:#04x} at offset {offset}")]
    UnsupportedHeapTag { tag: u8, offset: u64 },

    #[error("unknown basic type {code} at offset {offset}")]
    UnknownBasicType { code: u8, offset: u64 },

    #[error("record {tag:#04x} declared {declared} bytes but its body spans {actual}")]
    RecordLengthMismatch { tag: u8, declared: u32, actual: u64 },

    #[error("duplicate class dump for class {class_id:#010x}")]
    DuplicateClassDump { class_id: u32 },

    #[error("instance {object_id:#010x} references class {class_id:#010x} but no class dump was seen for it")]
    MissingClassShape { object_id: u32, class_id: u32 },

    #[error("instance {object_id:#010x} has less field data than the shape of class {class_id:#010x} requires")]
    ShortInstanceData { object_id: u32, class_id: u32 },

    #[error("super class chain of class {class_id:#010x} does not terminate")]
    CyclicSuperChain { class_id: u32 },

    #[error("string {id:#010x} is referenced by a kept record but never defined")]
    UnresolvedString { id: u32 },
}

/// Result type for conversion operations.
pub type Result<T> = std::result::Result<T, ConvertError>;
