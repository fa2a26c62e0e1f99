use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("chapter {index} failed to load: {message}")]
    ChapterLoad { index: usize, message: String },
    #[error("layout measurement unavailable: {0}")]
    LayoutUnavailable(&'static str),
    #[error("navigation target out of range: {0}")]
    InvalidTarget(String),
    #[error("a chapter window update is already in flight")]
    WindowBusy,
    #[error("invalid location `{input}`: {reason}")]
    InvalidLocation { input: String, reason: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("reader is not open")]
    NotOpen,
    #[error("failed to open book: {0}")]
    Open(String),
    #[error("reading state unavailable: {0}")]
    State(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Coarse error class carried by `ReaderEvent::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ChapterLoad,
    LayoutUnavailable,
    InvalidTarget,
    WindowBusy,
    InvalidLocation,
    Config,
    NotOpen,
    Open,
    State,
    Io,
}

impl ReaderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReaderError::ChapterLoad { .. } => ErrorKind::ChapterLoad,
            ReaderError::LayoutUnavailable(_) => ErrorKind::LayoutUnavailable,
            ReaderError::InvalidTarget(_) => ErrorKind::InvalidTarget,
            ReaderError::WindowBusy => ErrorKind::WindowBusy,
            ReaderError::InvalidLocation { .. } => ErrorKind::InvalidLocation,
            ReaderError::Config(_) => ErrorKind::Config,
            ReaderError::NotOpen => ErrorKind::NotOpen,
            ReaderError::Open(_) => ErrorKind::Open,
            ReaderError::State(_) => ErrorKind::State,
            ReaderError::Io(_) => ErrorKind::Io,
        }
    }

    pub fn invalid_location(input: impl Into<String>, reason: impl Into<String>) -> Self {
        ReaderError::InvalidLocation {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

/// A chapter that could not be fetched or materialized during a window update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterLoadFailure {
    pub index: usize,
    pub message: String,
}

impl From<ChapterLoadFailure> for ReaderError {
    fn from(failure: ChapterLoadFailure) -> Self {
        ReaderError::ChapterLoad {
            index: failure.index,
            message: failure.message,
        }
    }
}
