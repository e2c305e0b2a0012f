use crate::config::ModemConfig;
use crate::error::{Result, ToneRelayError};
use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use std::f32::consts::PI;
use std::sync::Arc;
use std::time::Duration;

/// Floor used before taking logarithms of bin magnitudes
const MIN_LOG_MAGNITUDE: f32 = 1e-12;

/// Strongest component of one analysis window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub frequency_hz: f32,
    /// Estimated amplitude of the sinusoid behind the peak
    pub magnitude: f32,
}

/// Magnitude spectrum of one analysis window
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    pub bin_hz: f32,
    pub magnitudes: Vec<f32>,
}

impl Spectrum {
    pub fn new(bin_hz: f32, magnitudes: Vec<f32>) -> Self {
        Self { bin_hz, magnitudes }
    }

    pub fn silent(bin_hz: f32, bins: usize) -> Self {
        Self::new(bin_hz, vec![0.0; bins])
    }

    /// Synthetic spectrum of a single tone
    ///
    /// The lobe is Gaussian in shape so that the log-parabolic refinement in
    /// [`Spectrum::dominant`] recovers `frequency_hz` and `amplitude` exactly.
    pub fn from_tone(frequency_hz: f32, amplitude: f32, bin_hz: f32, bins: usize) -> Self {
        let mut spectrum = Self::silent(bin_hz, bins);
        let center = frequency_hz / bin_hz;
        let first = (center.floor() as i64 - 3).max(0) as usize;
        let last = ((center.ceil() as i64 + 3).max(0) as usize).min(bins.saturating_sub(1));
        for bin in first..=last {
            let x = bin as f32 - center;
            spectrum.magnitudes[bin] = amplitude * (-x * x / 2.0).exp();
        }
        spectrum
    }

    /// Peak bin refined by a parabola through the log magnitudes of its neighbours.
    /// `None` when the strongest component is below `min_amplitude`.
    pub fn dominant(&self, min_amplitude: f32) -> Option<Peak> {
        // Bin 0 is DC, never a symbol
        let (peak_bin, &peak_mag) = self
            .magnitudes
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|a, b| a.1.total_cmp(b.1))?;

        if !(peak_mag > 0.0) {
            return None;
        }

        let (offset, magnitude) = if peak_bin + 1 < self.magnitudes.len() {
            let alpha = self.magnitudes[peak_bin - 1].max(MIN_LOG_MAGNITUDE).ln();
            let beta = peak_mag.max(MIN_LOG_MAGNITUDE).ln();
            let gamma = self.magnitudes[peak_bin + 1].max(MIN_LOG_MAGNITUDE).ln();
            let denom = alpha - 2.0 * beta + gamma;
            if denom < 0.0 {
                let p = (0.5 * (alpha - gamma) / denom).clamp(-0.5, 0.5);
                (p, (beta - 0.25 * (alpha - gamma) * p).exp())
            } else {
                (0.0, peak_mag)
            }
        } else {
            (0.0, peak_mag)
        };

        if magnitude < min_amplitude {
            return None;
        }

        Some(Peak {
            frequency_hz: (peak_bin as f32 + offset) * self.bin_hz,
            magnitude,
        })
    }
}

/// Microphone capability: one spectrum per analysis tick, `None` when no
/// new audio is available yet
pub trait SpectrumSource {
    fn capture_spectrum(&mut self) -> Option<Spectrum>;
}

impl<S: SpectrumSource + ?Sized> SpectrumSource for Box<S> {
    fn capture_spectrum(&mut self) -> Option<Spectrum> {
        (**self).capture_spectrum()
    }
}

/// Turns PCM audio into a stream of magnitude spectra
///
/// Short Hann windows keep one fully silent window inside every inter-symbol
/// gap; zero padding to `fft_len` plus peak refinement recovers the frequency
/// resolution the short window gives up.
pub struct SpectrumAnalyzer {
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    amplitude_scale: f32,
    input: Vec<f32>,
    output: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    bin_hz: f32,
    hop_samples: usize,
    sample_rate: usize,
}

impl SpectrumAnalyzer {
    pub fn new(config: &ModemConfig) -> Result<Self> {
        config.validate()?;

        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(config.fft_len);
        let window = hann_window(config.window_samples);
        let window_sum: f32 = window.iter().sum();

        Ok(Self {
            input: fft.make_input_vec(),
            output: fft.make_output_vec(),
            scratch: fft.make_scratch_vec(),
            fft,
            amplitude_scale: 2.0 / window_sum,
            window,
            bin_hz: config.sample_rate as f32 / config.fft_len as f32,
            hop_samples: config.hop_samples,
            sample_rate: config.sample_rate,
        })
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    pub fn bin_hz(&self) -> f32 {
        self.bin_hz
    }

    /// Spectrum of exactly one analysis window of samples
    pub fn analyze(&mut self, samples: &[f32]) -> Result<Spectrum> {
        if samples.len() != self.window.len() {
            return Err(ToneRelayError::InvalidInputSize);
        }

        for (slot, (&sample, &weight)) in self
            .input
            .iter_mut()
            .zip(samples.iter().zip(self.window.iter()))
        {
            *slot = sample * weight;
        }
        for slot in self.input[samples.len()..].iter_mut() {
            *slot = 0.0;
        }

        self.fft
            .process_with_scratch(&mut self.input, &mut self.output, &mut self.scratch)
            .map_err(|e| ToneRelayError::FftError(e.to_string()))?;

        let magnitudes = self
            .output
            .iter()
            .map(|c| c.norm() * self.amplitude_scale)
            .collect();
        Ok(Spectrum::new(self.bin_hz, magnitudes))
    }

    /// Slide the analysis window over `samples` one hop at a time.
    /// Each spectrum is stamped with the stream time at which its window ends.
    pub fn frames(&mut self, samples: &[f32]) -> Result<Vec<(Duration, Spectrum)>> {
        let window_len = self.window.len();
        let mut frames = Vec::new();
        let mut start = 0;
        while start + window_len <= samples.len() {
            let spectrum = self.analyze(&samples[start..start + window_len])?;
            frames.push((self.stream_time(start + window_len), spectrum));
            start += self.hop_samples;
        }
        Ok(frames)
    }

    fn stream_time(&self, sample_index: usize) -> Duration {
        Duration::from_nanos(sample_index as u64 * 1_000_000_000 / self.sample_rate as u64)
    }
}

fn hann_window(len: usize) -> Vec<f32> {
    if len < 2 {
        return vec![1.0; len];
    }
    (0..len)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / (len - 1) as f32).cos())
        .collect()
}
