use crate::channel::ToneSink;
use crate::config::ModemConfig;
use crate::error::{Result, ToneRelayError};
use crate::symbols::SymbolTable;
use log::{debug, warn};
use std::f32::consts::PI;
use std::time::Duration;

/// Edge taper ratio (8% on each side for smooth transitions)
const TONE_EDGE_TAPER_RATIO: f32 = 0.08;

/// Minimum taper samples
const TONE_MIN_TAPER_SAMPLES: usize = 32;

/// One symbol: play `frequency_hz` for `duration`, then stay silent for `gap`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToneCommand {
    pub symbol: char,
    pub frequency_hz: f32,
    pub duration: Duration,
    pub gap: Duration,
}

impl ToneCommand {
    pub fn slot(&self) -> Duration {
        self.duration + self.gap
    }
}

/// Timed tone sequence for one transmission
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TonePlan {
    pub commands: Vec<ToneCommand>,
    /// Characters dropped because they are outside the alphabet
    pub skipped: Vec<char>,
}

impl TonePlan {
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// length(text) × (duration + gap)
    pub fn total_duration(&self) -> Duration {
        self.commands.iter().map(ToneCommand::slot).sum()
    }

    /// The text this plan will put on the air
    pub fn text(&self) -> String {
        self.commands.iter().map(|command| command.symbol).collect()
    }
}

/// Converts framed text into tone commands
#[derive(Debug, Clone)]
pub struct Modulator {
    table: SymbolTable,
    tone: Duration,
    gap: Duration,
}

impl Modulator {
    pub fn new(config: &ModemConfig) -> Self {
        Self {
            table: SymbolTable::from(config),
            tone: config.tone_duration(),
            gap: config.gap_duration(),
        }
    }

    pub fn table(&self) -> &SymbolTable {
        &self.table
    }

    /// One command per supported character. Unsupported characters are
    /// skipped and the rest of the message still goes out.
    pub fn plan(&self, text: &str) -> TonePlan {
        let mut plan = TonePlan {
            commands: Vec::with_capacity(text.len()),
            skipped: Vec::new(),
        };

        for symbol in text.chars() {
            match self.table.frequency(symbol) {
                Ok(frequency_hz) => plan.commands.push(ToneCommand {
                    symbol,
                    frequency_hz,
                    duration: self.tone,
                    gap: self.gap,
                }),
                Err(ToneRelayError::UnsupportedCharacter(c)) => {
                    warn!("Skipping unsupported character {:?}", c);
                    plan.skipped.push(c);
                }
                Err(e) => {
                    warn!("Skipping {:?}: {}", symbol, e);
                    plan.skipped.push(symbol);
                }
            }
        }

        debug!(
            "Planned {} tones ({:?}) for {:?}",
            plan.len(),
            plan.total_duration(),
            text
        );
        plan
    }
}

impl Default for Modulator {
    fn default() -> Self {
        Self::new(&ModemConfig::default())
    }
}

/// Renders tones into PCM samples
///
/// Each tone is a single sine wave with a raised-cosine edge taper to reduce
/// spectral splatter at symbol boundaries. Gaps are rendered as silence.
pub struct ToneSynthesizer {
    sample_rate: f32,
    amplitude: f32,
    samples: Vec<f32>,
}

impl ToneSynthesizer {
    pub fn new(config: &ModemConfig) -> Self {
        Self {
            sample_rate: config.sample_rate as f32,
            amplitude: config.tone_amplitude,
            samples: Vec::new(),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    /// Render a whole plan, tones and gaps, into a fresh buffer
    pub fn render(&mut self, plan: &TonePlan) -> Vec<f32> {
        self.samples.clear();
        for command in &plan.commands {
            self.push_tone(command.frequency_hz, command.duration);
            self.push_silence(command.gap);
        }
        std::mem::take(&mut self.samples)
    }

    fn sample_count(&self, duration: Duration) -> usize {
        (duration.as_secs_f64() * self.sample_rate as f64).round() as usize
    }

    fn push_tone(&mut self, frequency_hz: f32, duration: Duration) {
        let count = self.sample_count(duration);
        let angular_freq = 2.0 * PI * frequency_hz / self.sample_rate;
        let mut tone: Vec<f32> = (0..count)
            .map(|i| (angular_freq * i as f32).sin() * self.amplitude)
            .collect();
        apply_edge_taper(&mut tone);
        self.samples.extend_from_slice(&tone);
    }

    fn push_silence(&mut self, duration: Duration) {
        let count = self.sample_count(duration);
        self.samples.resize(self.samples.len() + count, 0.0);
    }
}

impl ToneSink for ToneSynthesizer {
    fn emit_tone(&mut self, frequency_hz: f32, duration: Duration) -> Result<()> {
        if !(frequency_hz > 0.0 && frequency_hz < self.sample_rate / 2.0) {
            return Err(ToneRelayError::SinkError(format!(
                "frequency {} Hz cannot be rendered at {} Hz",
                frequency_hz, self.sample_rate
            )));
        }
        self.push_tone(frequency_hz, duration);
        Ok(())
    }

    fn silence(&mut self, duration: Duration) -> Result<()> {
        self.push_silence(duration);
        Ok(())
    }
}

fn taper_length(symbol_samples: usize) -> usize {
    let taper = ((symbol_samples as f32) * TONE_EDGE_TAPER_RATIO).round() as usize;
    taper.max(TONE_MIN_TAPER_SAMPLES).min(symbol_samples / 2)
}

fn apply_edge_taper(samples: &mut [f32]) {
    let taper_len = taper_length(samples.len());
    if taper_len == 0 {
        return;
    }
    let window = raised_cosine_window(samples.len(), taper_len);
    for (sample, &weight) in samples.iter_mut().zip(window.iter()) {
        *sample *= weight;
    }
}

/// Generate raised-cosine window for smooth edge tapering
fn raised_cosine_window(len: usize, taper_len: usize) -> Vec<f32> {
    let taper = taper_len.min(len / 2);
    let mut window = vec![1.0; len];
    for i in 0..taper {
        // Attack: smoothly increase from 0 to 1
        let progress = i as f32 / taper as f32;
        let value = (PI * progress / 2.0).sin().powi(2);
        window[i] = value;

        // Decay: smoothly decrease from 1 to 0
        window[len - 1 - i] = value;
    }
    window
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SAMPLE_RATE;

    #[test]
    fn test_plan_one_tone_per_symbol() {
        let modulator = Modulator::default();
        let plan = modulator.plan("[AB12C->broadcast#m1|hop0] ~hi^");
        assert_eq!(plan.len(), 31);
        assert!(plan.skipped.is_empty());
        assert_eq!(plan.text(), "[AB12C->broadcast#m1|hop0] ~hi^");
        assert_eq!(plan.commands[0].frequency_hz, 400.0 + 59.0 * 20.0);
    }

    #[test]
    fn test_plan_total_duration() {
        let modulator = Modulator::default();
        let plan = modulator.plan("hello");
        assert_eq!(plan.total_duration(), Duration::from_millis(5 * 120));
    }

    #[test]
    fn test_plan_skips_unsupported_characters() {
        let modulator = Modulator::default();
        let plan = modulator.plan("hé\tllo");
        assert_eq!(plan.text(), "hllo");
        assert_eq!(plan.skipped, vec!['é', '\t']);
        assert_eq!(plan.total_duration(), Duration::from_millis(4 * 120));
    }

    #[test]
    fn test_render_length() {
        let modulator = Modulator::default();
        let plan = modulator.plan("ab");
        let mut synth = ToneSynthesizer::new(&ModemConfig::default());
        let samples = synth.render(&plan);
        // (100ms tone + 20ms gap) per symbol at 16kHz
        assert_eq!(samples.len(), 2 * (SAMPLE_RATE / 10 + SAMPLE_RATE / 50));
    }

    #[test]
    fn test_render_gap_is_silent() {
        let modulator = Modulator::default();
        let plan = modulator.plan("a");
        let mut synth = ToneSynthesizer::new(&ModemConfig::default());
        let samples = synth.render(&plan);
        let tone_len = SAMPLE_RATE / 10;
        assert!(samples[tone_len..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_render_amplitude_range() {
        let modulator = Modulator::default();
        let plan = modulator.plan("~");
        let mut synth = ToneSynthesizer::new(&ModemConfig::default());
        let samples = synth.render(&plan);
        let max_amplitude = samples.iter().map(|x| x.abs()).fold(0.0f32, f32::max);

        assert!(max_amplitude <= crate::TONE_AMPLITUDE + 1e-6, "Signal should not exceed tone amplitude");
        assert!(max_amplitude > 0.4, "Signal should have reasonable amplitude");
        assert!(samples[0].abs() < 1e-6, "Tone should start from silence");
    }

    #[test]
    fn test_sink_rejects_frequency_above_nyquist() {
        let mut synth = ToneSynthesizer::new(&ModemConfig::default());
        assert!(synth.emit_tone(9000.0, Duration::from_millis(10)).is_err());
        assert!(synth.emit_tone(1000.0, Duration::from_millis(10)).is_ok());
        assert_eq!(synth.samples().len(), 160);
    }

    #[test]
    fn test_raised_cosine_window() {
        let window = raised_cosine_window(100, 10);
        assert_eq!(window.len(), 100);

        assert!(window[0] < 0.1, "Window should start near 0");
        assert!(window[9] > 0.9, "Window should reach 1.0");
        assert!(window[50] == 1.0, "Window should be 1.0 in middle");
        assert!(window[99] < 0.1, "Window should end near 0");
    }
}
