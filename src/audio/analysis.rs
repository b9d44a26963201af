use ndarray::{s, Array2, ArrayView1, ArrayView2, Axis, Zip};
use rayon::prelude::*;
use rustfft::{num_complex::Complex, FftPlanner};
use serde::Deserialize;
use std::ops::Range;

use crate::error::{RemixError, Result};

pub const FFT_SIZE: usize = 2048;
pub const HOP_SIZE: usize = 512;

const AMIN: f32 = 1e-5;
const POWER_FLOOR: f32 = 1e-10;
const TOP_DB: f32 = 80.0;

/// Tunables for the analysis front end. Defaults follow the usual
/// beat-synchronous segmentation setup (36 bins/octave over 7 octaves, 20 MFCCs).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisParams {
    /// Frames quieter than this (dB below the loudest frame) count as silence.
    pub trim_db: f32,
    pub bins_per_octave: usize,
    pub n_octaves: usize,
    /// Lowest harmonic bin, C1.
    pub fmin: f32,
    pub n_mels: usize,
    pub n_mfcc: usize,
    /// Beat tracker penalty for deviating from the global tempo.
    pub tightness: f32,
    pub start_bpm: f32,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            trim_db: 60.0,
            bins_per_octave: 36,
            n_octaves: 7,
            fmin: 32.703,
            n_mels: 40,
            n_mfcc: 20,
            tightness: 100.0,
            start_bpm: 120.0,
        }
    }
}

/// Frame-rate primitives computed once per track. Matrices are frames x bins.
pub struct FrameAnalysis {
    pub harmonic: Array2<f32>,
    pub mfcc: Array2<f32>,
    pub onset: Vec<f32>,
    pub rms: Vec<f32>,
    pub tempo: f32,
    pub beats: Vec<usize>,
}

impl FrameAnalysis {
    pub fn n_frames(&self) -> usize {
        self.onset.len()
    }
}

pub fn frames_to_time(frame: usize, sample_rate: u32) -> f32 {
    (frame * HOP_SIZE) as f32 / sample_rate as f32
}

/// Full front end over already trimmed samples.
pub fn analyze(samples: &[f32], sample_rate: u32, params: &AnalysisParams) -> Result<FrameAnalysis> {
    if samples.is_empty() || sample_rate == 0 {
        return Err(RemixError::EmptyAudio);
    }

    let magnitudes = stft_magnitudes(samples);
    log::info!("STFT: {} frames of {} bins", magnitudes.nrows(), magnitudes.ncols());

    let harmonic = harmonic_spectrum(magnitudes.view(), sample_rate, params);

    let mel_db = mel_spectrogram_db(magnitudes.view(), sample_rate, params.n_mels);
    let mfcc = mel_db.dot(&dct_basis(params.n_mels, params.n_mfcc).t());
    let onset = onset_strength(mel_db.view());

    let fps = sample_rate as f32 / HOP_SIZE as f32;
    let tempo = estimate_tempo(&onset, fps, params.start_bpm);
    let beats = track_beats(&onset, tempo, fps, params.tightness);
    let rms = frame_rms(samples, onset.len());

    log::info!("Tempo: {:.1} BPM, {} beats tracked", tempo, beats.len());

    Ok(FrameAnalysis {
        harmonic,
        mfcc,
        onset,
        rms,
        tempo,
        beats,
    })
}

/// Sample range left after dropping leading and trailing frames more than
/// `trim_db` below the loudest frame.
pub fn trim_silence(samples: &[f32], trim_db: f32) -> Result<Range<usize>> {
    if samples.is_empty() {
        return Err(RemixError::EmptyAudio);
    }

    let n_frames = 1 + samples.len().saturating_sub(1) / HOP_SIZE;
    let rms: Vec<f32> = (0..n_frames)
        .map(|i| {
            let start = i * HOP_SIZE;
            let end = (start + FFT_SIZE).min(samples.len());
            window_rms(&samples[start..end])
        })
        .collect();

    let peak = rms.iter().copied().fold(0.0f32, f32::max);
    if peak <= 0.0 {
        return Err(RemixError::EmptyAudio);
    }

    let threshold = -trim_db;
    let loud = |r: &f32| 20.0 * (r.max(AMIN) / peak).log10() > threshold;

    let first = rms.iter().position(loud).ok_or(RemixError::EmptyAudio)?;
    let last = rms.iter().rposition(loud).ok_or(RemixError::EmptyAudio)?;

    let start = first * HOP_SIZE;
    let end = (last * HOP_SIZE + FFT_SIZE).min(samples.len());
    Ok(start..end)
}

/// Centered, Hann-windowed STFT magnitudes, frames x `FFT_SIZE / 2 + 1` bins.
pub fn stft_magnitudes(samples: &[f32]) -> Array2<f32> {
    let n_frames = 1 + samples.len() / HOP_SIZE;
    let hann = hann_window(FFT_SIZE);
    let half = FFT_SIZE / 2;

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(FFT_SIZE);

    let mut magnitudes = Array2::zeros((n_frames, half + 1));
    magnitudes
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(frame_idx, mut row)| {
            let center = frame_idx * HOP_SIZE;
            let mut buffer: Vec<Complex<f32>> = (0..FFT_SIZE)
                .map(|i| {
                    let pos = (center + i).checked_sub(half);
                    let s = pos.and_then(|p| samples.get(p)).copied().unwrap_or(0.0);
                    Complex::new(s * hann[i], 0.0)
                })
                .collect();
            fft.process(&mut buffer);
            for (m, c) in row.iter_mut().zip(&buffer[..=half]) {
                *m = c.norm();
            }
        });
    magnitudes
}

/// Log-frequency magnitude spectrum in dB relative to the loudest bin. Bands
/// narrower than one FFT bin fall back to interpolating the magnitude at the
/// band center.
pub fn harmonic_spectrum(magnitudes: ArrayView2<f32>, sample_rate: u32, params: &AnalysisParams) -> Array2<f32> {
    let n_bins = params.bins_per_octave * params.n_octaves;
    let bin_hz = sample_rate as f32 / FFT_SIZE as f32;
    let nyquist = sample_rate as f32 / 2.0;
    let half_step = 2f32.powf(0.5 / params.bins_per_octave as f32);

    let bands: Vec<(f32, f32, f32)> = (0..n_bins)
        .map(|k| {
            let center = params.fmin * 2f32.powf(k as f32 / params.bins_per_octave as f32);
            (center / half_step, center, center * half_step)
        })
        .collect();

    let mut spectrum = Array2::zeros((magnitudes.nrows(), n_bins));
    Zip::from(spectrum.rows_mut())
        .and(magnitudes.rows())
        .par_for_each(|mut out, frame| {
            for (value, &(lo, center, hi)) in out.iter_mut().zip(&bands) {
                if center >= nyquist {
                    continue;
                }
                let lo_bin = (lo / bin_hz).ceil() as usize;
                let hi_bin = ((hi / bin_hz).floor() as usize).min(frame.len() - 1);
                *value = if lo_bin <= hi_bin {
                    let band = frame.slice(s![lo_bin..=hi_bin]);
                    (band.dot(&band) / band.len() as f32).sqrt()
                } else {
                    interpolate(frame, center / bin_hz)
                };
            }
        });

    let reference = spectrum.fold(0.0f32, |acc, &m| acc.max(m)).max(AMIN);
    spectrum.mapv_inplace(|m| (20.0 * (m.max(AMIN) / reference).log10()).max(-TOP_DB));
    spectrum
}

/// Log-power mel spectrogram (HTK mel scale), floored at 80 dB below its peak.
pub fn mel_spectrogram_db(magnitudes: ArrayView2<f32>, sample_rate: u32, n_mels: usize) -> Array2<f32> {
    let weights = mel_filterbank(sample_rate, n_mels);
    let power = magnitudes.mapv(|m| m * m).dot(&weights.t());

    let mut mel = power.mapv(|p| 10.0 * p.max(POWER_FLOOR).log10());
    let peak = mel.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    mel.mapv_inplace(|v| v.max(peak - TOP_DB));
    mel
}

/// Triangular filters, mel bands x FFT bins.
fn mel_filterbank(sample_rate: u32, n_mels: usize) -> Array2<f32> {
    let hz_to_mel = |hz: f32| 2595.0 * (1.0 + hz / 700.0).log10();
    let mel_to_hz = |mel: f32| 700.0 * (10f32.powf(mel / 2595.0) - 1.0);

    let bin_hz = sample_rate as f32 / FFT_SIZE as f32;
    let max_mel = hz_to_mel(sample_rate as f32 / 2.0);
    let edges: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f32 / (n_mels + 1) as f32))
        .collect();

    Array2::from_shape_fn((n_mels, FFT_SIZE / 2 + 1), |(m, bin)| {
        let (lo, center, hi) = (edges[m], edges[m + 1], edges[m + 2]);
        let f = bin as f32 * bin_hz;
        if f > lo && f <= center {
            (f - lo) / (center - lo)
        } else if f > center && f < hi {
            (hi - f) / (hi - center)
        } else {
            0.0
        }
    })
}

/// Orthonormal DCT-II basis, `n_out` coefficients x `n_in` inputs.
pub fn dct_basis(n_in: usize, n_out: usize) -> Array2<f32> {
    let nf = n_in as f32;
    Array2::from_shape_fn((n_out, n_in), |(k, i)| {
        let scale = if k == 0 { (1.0 / nf).sqrt() } else { (2.0 / nf).sqrt() };
        scale * (std::f32::consts::PI * k as f32 * (2 * i + 1) as f32 / (2.0 * nf)).cos()
    })
}

/// Mean half-wave rectified flux across mel bands.
pub fn onset_strength(mel_db: ArrayView2<f32>) -> Vec<f32> {
    let n = mel_db.nrows();
    let mut onset = vec![0.0f32; n];
    if n < 2 {
        return onset;
    }
    let flux = (&mel_db.slice(s![1.., ..]) - &mel_db.slice(s![..-1, ..])).mapv(|v| v.max(0.0));
    if let Some(mean) = flux.mean_axis(Axis(1)) {
        for (o, &m) in onset[1..].iter_mut().zip(mean.iter()) {
            *o = m;
        }
    }
    onset
}

/// Global tempo from the onset autocorrelation, weighted by a log-normal
/// prior around `start_bpm`.
pub fn estimate_tempo(onset: &[f32], fps: f32, start_bpm: f32) -> f32 {
    let min_lag = (60.0 * fps / 240.0).floor().max(1.0) as usize;
    let max_lag = (60.0 * fps / 40.0).ceil() as usize;

    if onset.len() <= min_lag + 1 {
        return start_bpm;
    }

    let mean = onset.iter().sum::<f32>() / onset.len() as f32;
    let centered: Vec<f32> = onset.iter().map(|v| v - mean).collect();

    let mut best: Option<(f32, usize)> = None;
    for lag in min_lag..=max_lag.min(centered.len() - 1) {
        let ac: f32 = centered[lag..]
            .iter()
            .zip(centered.iter())
            .map(|(a, b)| a * b)
            .sum();
        let bpm = 60.0 * fps / lag as f32;
        let prior = (-0.5 * (bpm / start_bpm).log2().powi(2)).exp();
        let score = ac * prior;
        if best.map_or(true, |(s, _)| score > s) {
            best = Some((score, lag));
        }
    }

    match best {
        Some((score, lag)) if score > 0.0 => 60.0 * fps / lag as f32,
        _ => start_bpm,
    }
}

/// Dynamic-programming beat tracker. Returns ascending onset-frame indices.
pub fn track_beats(onset: &[f32], tempo: f32, fps: f32, tightness: f32) -> Vec<usize> {
    let n = onset.len();
    if n == 0 || tempo <= 0.0 {
        return Vec::new();
    }
    if onset.iter().all(|&v| v <= 0.0) {
        return Vec::new();
    }

    let period = (60.0 * fps / tempo).round().max(1.0);
    let local = local_score(onset, period);

    let max_back = (2.0 * period).round() as usize;
    let min_back = (period / 2.0).round().max(1.0) as usize;

    let mut cumscore = vec![0.0f32; n];
    let mut backlink: Vec<Option<usize>> = vec![None; n];

    for i in 0..n {
        let mut best: Option<(f32, usize)> = None;
        if i >= min_back {
            let lo = i.saturating_sub(max_back);
            for prev in lo..=(i - min_back) {
                let gap = (i - prev) as f32;
                let penalty = -tightness * (gap / period).ln().powi(2);
                let score = cumscore[prev] + penalty;
                if best.map_or(true, |(s, _)| score > s) {
                    best = Some((score, prev));
                }
            }
        }
        match best {
            Some((score, prev)) if score > 0.0 => {
                cumscore[i] = local[i] + score;
                backlink[i] = Some(prev);
            }
            _ => cumscore[i] = local[i],
        }
    }

    let Some(last) = last_beat(&cumscore) else {
        return Vec::new();
    };

    let mut beats = vec![last];
    let mut cursor = last;
    while let Some(prev) = backlink[cursor] {
        beats.push(prev);
        cursor = prev;
    }
    beats.reverse();
    beats
}

fn local_score(onset: &[f32], period: f32) -> Vec<f32> {
    let n = onset.len();
    let mean = onset.iter().sum::<f32>() / n as f32;
    let var = onset.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / (n.max(2) - 1) as f32;
    let std = var.sqrt().max(POWER_FLOOR);

    let half = period as isize;
    let window: Vec<f32> = (-half..=half)
        .map(|i| (-0.5 * (i as f32 * 32.0 / period).powi(2)).exp())
        .collect();

    (0..n as isize)
        .map(|i| {
            window
                .iter()
                .enumerate()
                .filter_map(|(w, &weight)| {
                    let idx = i + w as isize - half;
                    (idx >= 0 && (idx as usize) < n).then(|| onset[idx as usize] / std * weight)
                })
                .sum()
        })
        .collect()
}

/// Last local maximum of the cumulative score that clears half the median peak.
fn last_beat(cumscore: &[f32]) -> Option<usize> {
    let n = cumscore.len();
    let is_peak = |i: usize| {
        let left = i == 0 || cumscore[i] > cumscore[i - 1];
        let right = i + 1 == n || cumscore[i] >= cumscore[i + 1];
        left && right
    };

    let mut peaks: Vec<f32> = (0..n).filter(|&i| is_peak(i)).map(|i| cumscore[i]).collect();
    if peaks.is_empty() {
        return None;
    }
    let median = median_f32(&mut peaks);
    (0..n).rev().find(|&i| is_peak(i) && 2.0 * cumscore[i] > median)
}

/// Centered frame RMS aligned with the STFT frames.
pub fn frame_rms(samples: &[f32], n_frames: usize) -> Vec<f32> {
    let half = FFT_SIZE / 2;
    (0..n_frames)
        .map(|i| {
            let center = i * HOP_SIZE;
            let start = center.saturating_sub(half).min(samples.len());
            let end = (center + half).min(samples.len());
            window_rms(&samples[start..end])
        })
        .collect()
}

fn window_rms(window: &[f32]) -> f32 {
    if window.is_empty() {
        return 0.0;
    }
    (window.iter().map(|s| s * s).sum::<f32>() / window.len() as f32).sqrt()
}

fn interpolate(frame: ArrayView1<f32>, pos: f32) -> f32 {
    let lo = pos.floor() as usize;
    if lo + 1 >= frame.len() {
        return frame.iter().last().copied().unwrap_or(0.0);
    }
    let t = pos - lo as f32;
    frame[lo] * (1.0 - t) + frame[lo + 1] * t
}

pub(crate) fn median_f32(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    values[values.len() / 2]
}

fn hann_window(size: usize) -> Vec<f32> {
    (0..size)
        .map(|i| {
            0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    fn click_track(sample_rate: u32, bpm: f32, seconds: f32) -> Vec<f32> {
        let len = (sample_rate as f32 * seconds) as usize;
        let interval = (60.0 / bpm * sample_rate as f32) as usize;
        let click_len = (sample_rate / 100) as usize;
        let mut samples = vec![0.0f32; len];
        let mut pos = interval / 2;
        while pos + click_len < len {
            for i in 0..click_len {
                let t = i as f32 / sample_rate as f32;
                samples[pos + i] = (2.0 * std::f32::consts::PI * 1000.0 * t).sin()
                    * (1.0 - i as f32 / click_len as f32);
            }
            pos += interval;
        }
        samples
    }

    #[test]
    fn trim_drops_leading_and_trailing_silence() {
        let mut samples = vec![0.0f32; 22050];
        samples.extend((0..22050).map(|i| (i as f32 * 0.05).sin() * 0.5));
        samples.extend(vec![0.0f32; 22050]);

        let range = trim_silence(&samples, 60.0).unwrap();
        assert!(range.start >= 22050 - FFT_SIZE);
        assert!(range.start <= 22050);
        assert!(range.end >= 44100);
        assert!(range.end <= 44100 + FFT_SIZE);
    }

    #[test]
    fn trim_rejects_pure_silence() {
        let samples = vec![0.0f32; 4096];
        assert!(matches!(trim_silence(&samples, 60.0), Err(RemixError::EmptyAudio)));
    }

    #[test]
    fn stft_frame_count_matches_hop() {
        let samples = vec![0.1f32; HOP_SIZE * 10];
        let mags = stft_magnitudes(&samples);
        assert_eq!(mags.dim(), (11, FFT_SIZE / 2 + 1));
    }

    #[test]
    fn dct_of_constant_is_dc_only() {
        let coeffs: Array1<f32> = Array1::<f32>::ones(8).dot(&dct_basis(8, 4).t());
        assert!((coeffs[0] - 8f32.sqrt()).abs() < 1e-4);
        for c in coeffs.slice(s![1..]) {
            assert!(c.abs() < 1e-4);
        }
    }

    #[test]
    fn harmonic_spectrum_peaks_near_tone() {
        let sr = 22050;
        let tone: Vec<f32> = (0..sr as usize)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / sr as f32).sin())
            .collect();
        let mags = stft_magnitudes(&tone);
        let params = AnalysisParams::default();
        let harmonic = harmonic_spectrum(mags.view(), sr, &params);
        let frame = harmonic.row(harmonic.nrows() / 2);
        let (peak_bin, _) = frame
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();
        let peak_hz = params.fmin * 2f32.powf(peak_bin as f32 / params.bins_per_octave as f32);
        assert!((peak_hz - 440.0).abs() < 15.0, "peak at {} Hz", peak_hz);
    }

    #[test]
    fn tempo_and_beats_follow_click_track() {
        let sr = 22050;
        let samples = click_track(sr, 120.0, 12.0);
        let analysis = analyze(&samples, sr, &AnalysisParams::default()).unwrap();

        assert!((analysis.tempo - 120.0).abs() < 8.0, "tempo {}", analysis.tempo);
        assert!(analysis.beats.len() >= 18, "beats {}", analysis.beats.len());

        let fps = sr as f32 / HOP_SIZE as f32;
        let intervals: Vec<f32> = analysis
            .beats
            .windows(2)
            .map(|w| (w[1] - w[0]) as f32 / fps)
            .collect();
        let mut sorted = intervals.clone();
        let median = median_f32(&mut sorted);
        assert!((median - 0.5).abs() < 0.05, "median interval {}", median);
    }

    #[test]
    fn silent_onset_has_no_beats() {
        assert!(track_beats(&[0.0; 200], 120.0, 43.0, 100.0).is_empty());
    }
}
