use crate::error::{Result, ToneRelayError};
use crate::{ALPHABET_FIRST, ALPHABET_LAST, ALPHABET_SIZE};

/// Bijection between printable ASCII and evenly spaced tone frequencies
///
/// Frequency design:
/// - Alphabet: 0x20 (space) through 0x7E (`~`), 95 symbols
/// - frequency(i) = base + i * step
/// - With the defaults (400 Hz, 20 Hz) the top symbol sits at 2280 Hz
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymbolTable {
    base_freq_hz: f32,
    step_hz: f32,
}

impl SymbolTable {
    pub fn new(base_freq_hz: f32, step_hz: f32) -> Self {
        Self {
            base_freq_hz,
            step_hz,
        }
    }

    pub fn len(&self) -> usize {
        ALPHABET_SIZE
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, c: char) -> bool {
        Self::index_of(c).is_some()
    }

    fn index_of(c: char) -> Option<usize> {
        let code = u32::from(c);
        if code >= u32::from(ALPHABET_FIRST) && code <= u32::from(ALPHABET_LAST) {
            Some((code - u32::from(ALPHABET_FIRST)) as usize)
        } else {
            None
        }
    }

    fn char_at_index(index: usize) -> char {
        char::from(ALPHABET_FIRST + index as u8)
    }

    fn index_frequency(&self, index: usize) -> f32 {
        self.base_freq_hz + index as f32 * self.step_hz
    }

    /// Tone frequency assigned to `c`
    pub fn frequency(&self, c: char) -> Result<f32> {
        Self::index_of(c)
            .map(|index| self.index_frequency(index))
            .ok_or(ToneRelayError::UnsupportedCharacter(c))
    }

    /// Nearest alphabet entry to `freq`, if it lies within `tolerance_hz`
    pub fn char_at(&self, freq: f32, tolerance_hz: f32) -> Option<char> {
        if !freq.is_finite() {
            return None;
        }
        let offset = ((freq - self.base_freq_hz) / self.step_hz).round();
        let index = offset.clamp(0.0, (ALPHABET_SIZE - 1) as f32) as usize;
        let diff = (freq - self.index_frequency(index)).abs();
        if diff <= tolerance_hz {
            Some(Self::char_at_index(index))
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (char, f32)> + '_ {
        (0..ALPHABET_SIZE).map(move |i| (Self::char_at_index(i), self.index_frequency(i)))
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new(crate::BASE_FREQ_HZ, crate::STEP_HZ)
    }
}

impl From<&crate::config::ModemConfig> for SymbolTable {
    fn from(config: &crate::config::ModemConfig) -> Self {
        Self::new(config.base_freq_hz, config.step_hz)
    }
}
