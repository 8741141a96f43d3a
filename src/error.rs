//! The error kinds named in the design's error-handling section, collected into one enum so
//! every stage returns the same `Result` alias instead of inventing its own failure type.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every failure mode a pipeline stage can produce.
///
/// Only [`Error::Environment`] and the caller's own "no targets succeeded" check are meant to
/// terminate the process; everything else is caught at the call site, logged, and folded into
/// a [`crate::target::Outcome`].
#[derive(Debug, Error)]
pub enum Error {
    /// A precondition about the host environment (a required external tool is missing, a
    /// resource file couldn't be copied, ...). Fatal: reported before any target is processed.
    #[error("environment error: {0}")]
    Environment(String),

    /// A single function failed to decompile (the decompiler produced no output, or the
    /// secondary decompiler also came up empty).
    #[error("decompilation of '{function}' in target '{target}' produced no output")]
    DecompilationFailed { target: String, function: String },

    /// A referenced identifier has no match in the symbol index, and neither the `_NN`-suffix
    /// nor the prepended-`_` heuristic resolved it.
    #[error("symbol '{0}' not found in symbol index")]
    SymbolNotFound(String),

    /// A type name is neither a primitive, a standard-header type, defined, nor forward
    /// declarable; it and its transitive users are commented out instead.
    #[error("type '{0}' has no resolvable definition")]
    TypeUnresolvable(String),

    /// The ordering algorithm exhausted its iteration budget without finishing.
    #[error("type ordering did not converge after {iterations} iterations; {remaining} declarations left unresolved")]
    ImpossibleTypeOrder { iterations: usize, remaining: usize },

    /// A line from an external tool did not match any recognized shape.
    #[error("could not classify declaration line: {0:?}")]
    UnrecognizedDeclaration(String),

    /// A line from the symbol lister was shorter than the minimum column width.
    #[error("malformed symbol listing line: {0:?}")]
    MalformedSymbolLine(String),

    /// The symbol lister emitted a 64-bit-looking address column.
    #[error("64-bit symbol address layout is not supported: {0:?}")]
    UnsupportedAddressWidth(String),

    /// No target in the input list produced any successful recompilation.
    #[error("no targets were successfully recompiled")]
    NoTargetsSucceeded,

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize artifact: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Error {
        Error::Io { path: path.into(), source }
    }

    pub fn spawn(command: impl Into<String>, source: std::io::Error) -> Error {
        Error::Spawn { command: command.into(), source }
    }
}
