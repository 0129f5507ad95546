//! Compiler collaborator interface.
//!
//! The resolver hands the compiler a map of dependency names to resolved
//! directories plus the entry files; everything past that seam is opaque.

use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

/// A compilation failure reported by the collaborator.
#[derive(Error, Debug)]
#[error("failed to compile the kcl package: {0}")]
pub struct CompileError(pub String);

/// Everything the compiler needs for one run.
#[derive(Debug, Clone, Default)]
pub struct CompilerInput {
    /// Entry source files, absolute.
    pub entries: Vec<PathBuf>,

    /// Working directory for the compilation, the package root.
    pub work_dir: PathBuf,

    /// Resolved dependencies: name to absolute directory.
    pub dep_map: BTreeMap<String, PathBuf>,
}

/// The external compiler.
pub trait Compiler {
    /// Compile with the given input and return the rendered output.
    ///
    /// # Errors
    ///
    /// Returns an error when the compilation fails; the resolver does not
    /// interpret it further.
    fn compile(&self, input: &CompilerInput) -> Result<String, CompileError>;
}
