use thiserror::Error;

/// Everything that can stop a track from becoming a jukebox.
#[derive(Error, Debug)]
pub enum RemixError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Audio is empty or silent after trimming")]
    EmptyAudio,
    #[error("Beat tracking found {found} beat(s), at least 2 are required")]
    TooFewBeats { found: usize },
    #[error("Beat feature columns disagree: {0}")]
    FeatureMismatch(String),
    /// No beat ended up with a single jump candidate. The track can only
    /// ever loop sequentially, so callers usually fall back to plain playback.
    #[error("Track is not remixable: no beat has any jump candidates")]
    NotRemixable,
    #[error("Beat {id} is out of range (graph has {len} beats)")]
    InvalidBeat { id: usize, len: usize },
    #[error("Analysis worker exited without a result")]
    WorkerPanicked,
    #[error("Beat graph invariant violated: {0}")]
    Internal(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RemixError>;
