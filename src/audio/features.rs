use ndarray::{s, Array2, ArrayView2, Axis};
use std::ops::Range;

use super::analysis::{self, median_f32, AnalysisParams};
use crate::error::{RemixError, Result};

/// Beat-synchronous view of a track: one row per beat in every matrix.
///
/// This is the hand-off point between the analysis front end and the remix
/// core. Callers with their own beat tracker or chroma extractor can build it
/// directly and skip [`extract_beat_features`].
#[derive(Clone, Debug, Default)]
pub struct BeatFeatures {
    /// Beat start times in seconds, relative to the trimmed audio.
    pub beat_times: Vec<f32>,
    pub tempo: f32,
    /// Harmonic (log-frequency, dB) spectrum, beats x bins.
    pub chroma: Array2<f32>,
    /// MFCCs, beats x coefficients.
    pub mfcc: Array2<f32>,
    /// Mean RMS per beat.
    pub amplitude: Vec<f32>,
}

impl BeatFeatures {
    pub fn len(&self) -> usize {
        self.beat_times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beat_times.is_empty()
    }

    /// Row counts must agree and there must be at least two beats.
    pub fn validate(&self) -> Result<()> {
        let n = self.beat_times.len();
        if n < 2 {
            return Err(RemixError::TooFewBeats { found: n });
        }
        for (name, len) in [
            ("chroma", self.chroma.nrows()),
            ("mfcc", self.mfcc.nrows()),
            ("amplitude", self.amplitude.len()),
        ] {
            if len != n {
                return Err(RemixError::FeatureMismatch(format!(
                    "{} has {} rows, expected {}",
                    name, len, n
                )));
            }
        }
        if self.beat_times.windows(2).any(|w| w[1] < w[0]) {
            return Err(RemixError::FeatureMismatch("beat times are not sorted".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregate {
    Mean,
    Median,
}

/// Interval boundaries for beat-synchronous aggregation: the tracked beats
/// plus frame 0 and the final frame, sorted and deduplicated.
pub fn sync_boundaries(beats: &[usize], n_frames: usize) -> Vec<usize> {
    let mut bounds: Vec<usize> = std::iter::once(0)
        .chain(beats.iter().map(|&b| b.min(n_frames)))
        .chain(std::iter::once(n_frames))
        .collect();
    bounds.sort_unstable();
    bounds.dedup();
    bounds
}

/// Collapse frames x bins into one row per boundary interval.
pub fn sync_rows(frames: ArrayView2<f32>, bounds: &[usize], aggregate: Aggregate) -> Array2<f32> {
    let mut out = Array2::zeros((bounds.len().saturating_sub(1), frames.ncols()));
    for (mut row, w) in out.rows_mut().into_iter().zip(bounds.windows(2)) {
        let span = frames.slice(s![w[0]..w[1], ..]);
        match aggregate {
            Aggregate::Mean => {
                if let Some(mean) = span.mean_axis(Axis(0)) {
                    row.assign(&mean);
                }
            }
            Aggregate::Median => {
                for (value, column) in row.iter_mut().zip(span.columns()) {
                    *value = median_f32(&mut column.to_vec());
                }
            }
        }
    }
    out
}

pub fn sync_values(values: &[f32], bounds: &[usize]) -> Vec<f32> {
    bounds
        .windows(2)
        .map(|w| {
            let span = &values[w[0]..w[1]];
            span.iter().sum::<f32>() / span.len().max(1) as f32
        })
        .collect()
}

/// Trim silence, run the frame-level analysis and aggregate per beat.
///
/// Returns the features together with the sample range that survived
/// trimming; all beat times are relative to the start of that range.
pub fn extract_beat_features(
    samples: &[f32],
    sample_rate: u32,
    params: &AnalysisParams,
) -> Result<(BeatFeatures, Range<usize>)> {
    let range = analysis::trim_silence(samples, params.trim_db)?;
    log::info!(
        "Trimmed silence: keeping samples {}..{} of {}",
        range.start,
        range.end,
        samples.len()
    );

    let trimmed = &samples[range.clone()];
    let frames = analysis::analyze(trimmed, sample_rate, params)?;

    if frames.beats.len() < 2 {
        return Err(RemixError::TooFewBeats {
            found: frames.beats.len(),
        });
    }

    let features = aggregate_frames(&frames, sample_rate);
    features.validate()?;
    Ok((features, range))
}

fn aggregate_frames(frames: &analysis::FrameAnalysis, sample_rate: u32) -> BeatFeatures {
    let n_frames = frames.n_frames();
    let bounds = sync_boundaries(&frames.beats, n_frames);

    let beat_times = bounds[..bounds.len() - 1]
        .iter()
        .map(|&f| analysis::frames_to_time(f, sample_rate))
        .collect();

    BeatFeatures {
        beat_times,
        tempo: frames.tempo,
        chroma: sync_rows(frames.harmonic.view(), &bounds, Aggregate::Median),
        mfcc: sync_rows(frames.mfcc.view(), &bounds, Aggregate::Mean),
        amplitude: sync_values(&frames.rms, &bounds),
    }
}
