use std::fmt;

/// Coarse classification of every failure reported by autopin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing, contradictory or malformed configuration
    BadConfig,
    /// Syscall or kernel resource failure
    System,
    /// Spawn/exec failure, subject not found, ambiguous or terminated
    Process,
    /// Tracing already active or attach failure
    ProcTrace,
    /// Control channel failure
    Comm,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::BadConfig => "BAD_CONFIG",
            ErrorKind::System => "SYSTEM",
            ErrorKind::Process => "PROCESS",
            ErrorKind::ProcTrace => "PROC_TRACE",
            ErrorKind::Comm => "COMM",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("[{kind}] {tag}: {message}")]
pub struct Error {
    kind: ErrorKind,
    tag: &'static str,
    message: String,
    #[source]
    source: Option<nix::Error>,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn new(kind: ErrorKind, tag: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            tag,
            message: message.into(),
            source: None,
        }
    }

    pub fn bad_config(tag: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadConfig, tag, message)
    }

    pub fn system(tag: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, tag, message)
    }

    pub fn process(tag: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Process, tag, message)
    }

    pub fn proc_trace(tag: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProcTrace, tag, message)
    }

    pub fn comm(tag: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Comm, tag, message)
    }

    pub fn with_source(mut self, source: nix::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// Keeps the OS error code of `source`, if it carries one.
    pub fn with_io_source(mut self, source: &std::io::Error) -> Self {
        self.source = source.raw_os_error().map(nix::Error::from_raw);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Short name of the step that failed, e.g. `set_affinity`
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn errno(&self) -> Option<nix::Error> {
        self.source
    }
}
