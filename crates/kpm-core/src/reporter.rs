//! Event reporting for package operations.
//!
//! Every user-visible action taken by the client is described by an [`Event`]
//! and written to a pluggable sink, so the consumer (CLI, tests, embedding
//! tools) decides where the log goes.

use std::fmt;
use std::io::{self, Write};
use std::sync::Mutex;

/// An event emitted during resolution, fetching, vendoring, or packaging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A lock entry without a matching manifest entry is being dropped.
    RemoveDep(String),
    /// A manifest entry without a matching lock entry is being recorded.
    AddDep(String),
    /// A dependency is about to be added to the package.
    Adding(String),
    /// A dependency was added successfully.
    Added(String),
    /// No tag was given; the latest registry tag was selected.
    SelectLatestTag(String),
    /// A git dependency is being cloned.
    DownloadingFromGit { url: String, tag: String },
    /// An OCI dependency is being pulled.
    DownloadingFromOci {
        registry: String,
        repo: String,
        tag: String,
    },
    /// A standalone pull started.
    PullingStarted(String),
    /// A standalone pull finished.
    PullingFinished { source: String, path: String },
    /// A package is being pushed to a registry.
    Pushing { repo: String, tag: String },
    /// Another process holds the package cache lock.
    WaitingForLock(String),
    /// A new file is being created.
    Creating(String),
    /// A file creation was skipped because the file already exists.
    FileExists(String),
    /// A flag was ignored in favor of information carried by another argument.
    InvalidFlag(String),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoveDep(name) => write!(f, "removing '{name}'"),
            Self::AddDep(name) => write!(f, "adding '{name}'"),
            Self::Adding(name) => write!(f, "adding dependency '{name}'"),
            Self::Added(name) => write!(f, "add dependency '{name}' successfully"),
            Self::SelectLatestTag(tag) => {
                write!(f, "the latest version '{tag}' will be used")
            }
            Self::DownloadingFromGit { url, tag } => {
                write!(f, "downloading '{url}' with tag '{tag}'")
            }
            Self::DownloadingFromOci {
                registry,
                repo,
                tag,
            } => {
                write!(f, "downloading '{repo}:{tag}' from '{registry}/{repo}:{tag}'")
            }
            Self::PullingStarted(source) => write!(f, "start to pull '{source}'"),
            Self::PullingFinished { source, path } => {
                write!(f, "pulled '{source}' in '{path}' successfully")
            }
            Self::Pushing { repo, tag } => write!(f, "pushing '{repo}:{tag}'"),
            Self::WaitingForLock(path) => {
                write!(f, "waiting for the package cache lock '{path}'")
            }
            Self::Creating(path) => write!(f, "creating new '{path}'"),
            Self::FileExists(path) => write!(f, "'{path}' already exists"),
            Self::InvalidFlag(msg) => write!(f, "{msg}"),
        }
    }
}

/// A sink for [`Event`]s.
///
/// Write failures are swallowed: a broken log pipe must never abort a
/// resolution that is otherwise succeeding.
pub struct Reporter {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl Reporter {
    /// A reporter writing to the given sink.
    pub fn new(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    /// A reporter writing to stdout.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// A reporter discarding everything. Useful in tests.
    #[must_use]
    pub fn silent() -> Self {
        Self::new(Box::new(io::sink()))
    }

    /// Write one event to the sink.
    pub fn report(&self, event: &Event) {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = writeln!(sink, "kpm: {event}");
        }
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Self::stdout()
    }
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter").finish_non_exhaustive()
    }
}
