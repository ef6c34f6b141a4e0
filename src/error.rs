//! Error taxonomy shared by sketches, pipeline, and CLI.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure kinds surfaced by constructors, merges, and the pipeline.
///
/// Sketch updates and estimators are total once construction succeeded;
/// everything fallible funnels through this enum so callers can map a
/// failure to an exit code without string matching.
#[derive(Debug, Error)]
pub enum Error {
    /// A constructor or merge received an argument outside its contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A textual option (hash kind, duration) did not parse.
    #[error("parse error: {0}")]
    Parse(String),

    /// Reading the input stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A merge would wrap a counter; single updates saturate instead.
    #[error("overflow: {0}")]
    Overflow(&'static str),
}
