pub mod analysis;
pub mod decode;
pub mod features;

pub use analysis::AnalysisParams;
pub use decode::{decode_audio, AudioData};
pub use features::{extract_beat_features, BeatFeatures};
