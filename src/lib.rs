pub mod audio;
pub mod error;
pub mod export;
pub mod remix;

pub use audio::{decode_audio, AudioData, BeatFeatures};
pub use error::{RemixError, Result};
pub use remix::{Beat, Jukebox, JukeboxOptions, PendingJukebox, PlayGraph, WalkConfig, WalkEntry};
