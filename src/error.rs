//! Error types for the codegen core.
//!
//! Three kinds of failure can occur while emitting IL: an allocation
//! failure in the builder's output buffer or string pool, a reference to a
//! symbol/field/method/type that the symbol table does not know about, and
//! a CFG whose terminator doesn't match its outgoing edges. The latter two
//! are recoverable: callers get a `WARN:` comment in the IL and a
//! best-effort fallback rather than a hard failure.

use std::fmt;

/// A single failure kind produced anywhere in the codegen pipeline.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    /// The output buffer or a supporting allocation (string pool entry,
    /// symbol map insert) could not grow. Unlike the other two kinds this
    /// is not recoverable: the caller must discard partial state.
    #[error("out of memory while emitting IL")]
    OutOfMemory,

    /// A symbol/field/method/array/type the emitter looked for was not
    /// present in the symbol table. Recoverable: the emitter degrades to a
    /// `WARN:` comment and a fallback value.
    #[error("unresolved symbol: {0}")]
    UnresolvedSymbol(String),

    /// A basic block's terminator kind didn't match its outgoing edges
    /// (e.g. `branch_true` with no `branch_false`). Recoverable: the
    /// terminator emitter falls through to the first successor.
    #[error("malformed CFG at block {0}: {1}")]
    MalformedCfg(usize, String),
}

pub type CodegenResult<T> = Result<T, CodegenError>;

/// A point where a [`CodegenError::UnresolvedSymbol`] or
/// [`CodegenError::MalformedCfg`] was swallowed and replaced with a
/// `WARN:` comment plus fallback code. The driver can inspect these to
/// decide whether "successful but warned" counts as failure.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub block: Option<usize>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.block {
            Some(b) => write!(f, "WARN (block {b}): {}", self.message),
            None => write!(f, "WARN: {}", self.message),
        }
    }
}

/// Accumulates diagnostics raised during a codegen run. Shared by
/// reference across every layer so a single warning sink exists per
/// invocation, mirroring how allocation errors propagate through `?`.
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, block: Option<usize>, message: impl Into<String>) {
        let message = message.into();
        log::warn!("{}", Diagnostic { block, message: message.clone() });
        self.entries.push(Diagnostic { block, message });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
