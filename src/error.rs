//! The crate-wide error type.
//!
//! Every fallible entry point in `llbscript` returns [`Result<T, Error>`](Error).
//! Type/arity errors and sandbox violations surface through Lua itself and
//! are wrapped verbatim, while validation, state-machine and internal
//! errors are raised directly by this crate's operation constructors and
//! serializer.

use std::fmt;

/// The crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A Lua runtime error: wrong arity, a call to a sandboxed capability,
    /// or any other error raised inside the interpreter.
    #[error(transparent)]
    Lua(#[from] mlua::Error),

    /// An operation constructor or option table rejected its arguments:
    /// empty/whitespace identifiers, out-of-range numerics, invalid range
    /// strings, wrong arity for `merge`/`diff`, or an unrecognized option
    /// value.
    #[error("{0}")]
    Validation(String),

    /// `bk.export` was called a second time within the same build.
    #[error("already called once")]
    ExportAlreadyCalled,

    /// `require(name)` did not resolve on either configured search root.
    #[error("module '{name}' not found")]
    ModuleNotFound {
        /// The name passed to `require`.
        name: String,
    },

    /// A module was found but failed to load or execute.
    #[error("error loading module '{name}': {source}")]
    ModuleLoad {
        /// The name passed to `require`.
        name: String,
        /// The underlying error.
        #[source]
        source: Box<Error>,
    },

    /// The canonical serializer produced zero bytes for the exported root;
    /// this should never happen for a well-formed DAG and indicates an
    /// internal bug rather than a script error.
    #[error("serializer produced an empty definition")]
    EmptyDefinition,

    /// Reading the export slot before `bk.export` was ever called.
    #[error("no export call - nothing to build")]
    NothingExported,
}

impl Error {
    /// Construct a [`Error::Validation`] from any displayable message.
    pub fn validation(msg: impl fmt::Display) -> Self {
        Error::Validation(msg.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
