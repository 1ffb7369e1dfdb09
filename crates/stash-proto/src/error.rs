use thiserror::Error;

/// Every failure the core can report.  None of them are fatal: callers
/// recover locally and the process stays interactive.
#[derive(Debug, Error)]
pub enum StashError {
    #[error("Please enter a stream URL")]
    EmptyUrl,

    #[error("A station with URL \"{url}\" already exists.")]
    DuplicateStation { url: String },

    #[error("Could not find the station with URL \"{url}\".")]
    StationNotFound { url: String },

    #[error("Not an absolute URL: {url} ({reason})")]
    MalformedUrl { url: String, reason: String },

    #[error("Cannot sign in without an email address")]
    MissingIdentity,

    #[error("Failed to play stream: {message}")]
    Playback { message: String },

    #[error("Persistence failure: {message}")]
    Persistence { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error),
}

impl StashError {
    pub fn persistence(message: impl Into<String>) -> Self {
        StashError::Persistence {
            message: message.into(),
        }
    }

    /// True for failures caused by what the user typed or picked, as opposed
    /// to infrastructure failures (disk, network).
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            StashError::EmptyUrl
                | StashError::DuplicateStation { .. }
                | StashError::StationNotFound { .. }
                | StashError::MalformedUrl { .. }
                | StashError::MissingIdentity
        )
    }
}

pub type Result<T> = std::result::Result<T, StashError>;
