use crate::error::{Result, ToneRelayError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Physical-layer parameters
///
/// Base frequency, step and tolerance are a de facto protocol version: two
/// devices with different values cannot understand each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModemConfig {
    pub base_freq_hz: f32,
    pub step_hz: f32,
    pub tolerance_hz: f32,
    pub tone_ms: u64,
    pub gap_ms: u64,
    pub tone_amplitude: f32,
    pub sample_rate: usize,
    pub window_samples: usize,
    pub hop_samples: usize,
    pub fft_len: usize,
    pub min_amplitude: f32,
    /// Consecutive windows that must agree on a symbol before it registers
    pub stable_windows: u32,
    pub idle_timeout_ms: u64,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            base_freq_hz: crate::BASE_FREQ_HZ,
            step_hz: crate::STEP_HZ,
            tolerance_hz: crate::TOLERANCE_HZ,
            tone_ms: crate::TONE_DURATION_MS,
            gap_ms: crate::TONE_GAP_MS,
            tone_amplitude: crate::TONE_AMPLITUDE,
            sample_rate: crate::SAMPLE_RATE,
            window_samples: crate::ANALYSIS_WINDOW_SAMPLES,
            hop_samples: crate::ANALYSIS_HOP_SAMPLES,
            fft_len: crate::ANALYSIS_FFT_LEN,
            min_amplitude: crate::MIN_AMPLITUDE,
            stable_windows: crate::STABLE_WINDOWS,
            idle_timeout_ms: crate::IDLE_TIMEOUT_MS,
        }
    }
}

impl ModemConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.step_hz > 0.0) {
            return Err(ToneRelayError::InvalidConfig(format!(
                "step must be positive, got {}",
                self.step_hz
            )));
        }
        if !(self.base_freq_hz > 0.0) {
            return Err(ToneRelayError::InvalidConfig(format!(
                "base frequency must be positive, got {}",
                self.base_freq_hz
            )));
        }
        // Above step/2 two neighbouring symbols would both accept the same frequency
        if !(self.tolerance_hz > 0.0) || self.tolerance_hz > self.step_hz / 2.0 {
            return Err(ToneRelayError::InvalidConfig(format!(
                "tolerance {} Hz must be in (0, {}]",
                self.tolerance_hz,
                self.step_hz / 2.0
            )));
        }
        let top = self.base_freq_hz + (crate::ALPHABET_SIZE - 1) as f32 * self.step_hz;
        let nyquist = self.sample_rate as f32 / 2.0;
        if top >= nyquist {
            return Err(ToneRelayError::InvalidConfig(format!(
                "highest symbol frequency {} Hz is not below Nyquist ({} Hz)",
                top, nyquist
            )));
        }
        if self.tone_ms == 0 {
            return Err(ToneRelayError::InvalidConfig("tone duration must be non-zero".into()));
        }
        if self.window_samples == 0 || self.window_samples > self.fft_len {
            return Err(ToneRelayError::InvalidConfig(format!(
                "analysis window {} must be in 1..={}",
                self.window_samples, self.fft_len
            )));
        }
        if self.hop_samples == 0 {
            return Err(ToneRelayError::InvalidConfig("hop must be non-zero".into()));
        }
        if self.stable_windows == 0 || self.stable_windows as usize > self.full_tone_windows() {
            return Err(ToneRelayError::InvalidConfig(format!(
                "stable windows {} must be in 1..={} for a {} ms tone",
                self.stable_windows,
                self.full_tone_windows(),
                self.tone_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.tone_amplitude) {
            return Err(ToneRelayError::InvalidConfig(format!(
                "tone amplitude {} outside [0, 1]",
                self.tone_amplitude
            )));
        }
        Ok(())
    }

    pub fn tone_duration(&self) -> Duration {
        Duration::from_millis(self.tone_ms)
    }

    pub fn gap_duration(&self) -> Duration {
        Duration::from_millis(self.gap_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Time between two consecutive analysis windows
    pub fn hop_duration(&self) -> Duration {
        Duration::from_nanos(self.hop_samples as u64 * 1_000_000_000 / self.sample_rate as u64)
    }

    /// Analysis windows that lie entirely inside one tone
    pub fn full_tone_windows(&self) -> usize {
        let tone_samples = (self.sample_rate as u64 * self.tone_ms / 1000) as usize;
        match tone_samples.checked_sub(self.window_samples) {
            Some(rest) => rest / self.hop_samples.max(1) + 1,
            None => 0,
        }
    }

    /// Whether a fully silent analysis window is guaranteed inside each gap.
    /// Without one, repeated characters collapse into a single symbol.
    pub fn gap_separates_repeats(&self) -> bool {
        let gap_samples = (self.sample_rate as u64 * self.gap_ms / 1000) as usize;
        gap_samples >= self.window_samples + self.hop_samples
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Packets whose next hop would exceed this are delivered but not forwarded
    pub max_hops: Option<u32>,
    /// Re-flood frames that were closed by the idle timeout. A forwarded
    /// partial goes back on air without the end marker, so downstream
    /// devices see it as partial too.
    pub forward_partial: bool,
    pub privileged_id: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_hops: None,
            forward_partial: false,
            privileged_id: crate::PRIVILEGED_DEVICE_ID.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub modem: ModemConfig,
    pub relay: RelayConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        self.modem.validate()?;
        if self.relay.privileged_id.is_empty() {
            return Err(ToneRelayError::InvalidConfig("privileged id must not be empty".into()));
        }
        Ok(())
    }
}
