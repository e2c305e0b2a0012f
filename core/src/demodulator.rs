use crate::config::ModemConfig;
use crate::spectrum::{Peak, Spectrum};
use crate::symbols::SymbolTable;
use crate::{END_MARKER, HEADER_OPEN, MAX_HEADER_CHARS, START_MARKER};
use log::{debug, info};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceptionPhase {
    Idle,
    Receiving,
}

/// Reassembled airborne text, ready for header parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub text: String,
    /// False when the idle timeout closed the frame instead of an end marker
    pub complete: bool,
}

#[derive(Debug)]
struct ReceptionState {
    /// Text since the most recent `[` heard while idle
    header: String,
    /// Payload heard since the start marker
    buffer: String,
    phase: ReceptionPhase,
    last_activity: Option<Duration>,
}

impl ReceptionState {
    fn new() -> Self {
        Self {
            header: String::with_capacity(MAX_HEADER_CHARS),
            buffer: String::new(),
            phase: ReceptionPhase::Idle,
            last_activity: None,
        }
    }

    fn reset(&mut self) {
        self.header.clear();
        self.buffer.clear();
        self.phase = ReceptionPhase::Idle;
        self.last_activity = None;
    }

    fn frame_text(&self, closed: bool) -> String {
        let mut text = String::with_capacity(self.header.len() + self.buffer.len() + 2);
        text.push_str(&self.header);
        text.push(START_MARKER);
        text.push_str(&self.buffer);
        if closed {
            text.push(END_MARKER);
        }
        text
    }
}

/// Turns a stream of analysis windows into framed text
///
/// Per window:
/// 1. No peak above the amplitude threshold: silence
/// 2. Peak outside the tolerance of every symbol: noise, ignored
/// 3. A symbol that has not yet held for `stable_windows` windows in a row:
///    pending, ignored
/// 4. A stable symbol equal to the last registered one: one sustained tone,
///    ignored
/// 5. Otherwise the symbol is registered and drives the Idle/Receiving machine
///
/// Windows that only partly overlap a tone give a smeared peak that often
/// lands on a neighbouring symbol, so a single window never registers.
/// Silence clears the coalescing memory, so the gap between two equal tones
/// lets the second one register. Noise breaks a pending run but keeps the
/// memory.
///
/// Time is the caller's stream time, which keeps the machine deterministic.
pub struct Demodulator {
    table: SymbolTable,
    tolerance_hz: f32,
    min_amplitude: f32,
    idle_timeout: Duration,
    stable_windows: u32,
    state: ReceptionState,
    last_symbol: Option<char>,
    /// Symbol seen in the most recent windows and how many in a row
    candidate: Option<(char, u32)>,
}

impl Demodulator {
    pub fn new(config: &ModemConfig) -> Self {
        Self {
            table: SymbolTable::from(config),
            tolerance_hz: config.tolerance_hz,
            min_amplitude: config.min_amplitude,
            idle_timeout: config.idle_timeout(),
            stable_windows: config.stable_windows.max(1),
            state: ReceptionState::new(),
            last_symbol: None,
            candidate: None,
        }
    }

    pub fn phase(&self) -> ReceptionPhase {
        self.state.phase
    }

    /// Payload received so far in the current frame
    pub fn buffer(&self) -> &str {
        &self.state.buffer
    }

    pub fn push_spectrum(&mut self, now: Duration, spectrum: &Spectrum) -> Option<DecodedFrame> {
        self.push_peak(now, spectrum.dominant(self.min_amplitude))
    }

    /// Feed a detected frequency at full strength
    pub fn push_frequency(&mut self, now: Duration, frequency_hz: f32) -> Option<DecodedFrame> {
        self.push_peak(
            now,
            Some(Peak {
                frequency_hz,
                magnitude: f32::INFINITY,
            }),
        )
    }

    /// Feed the outcome of one analysis window
    pub fn push_peak(&mut self, now: Duration, peak: Option<Peak>) -> Option<DecodedFrame> {
        // A symbol after a long silence belongs to a new frame
        let expired = self.poll_timeout(now);

        let peak = match peak {
            Some(peak) if peak.magnitude >= self.min_amplitude => peak,
            _ => {
                self.last_symbol = None;
                self.candidate = None;
                return expired;
            }
        };

        let symbol = match self.table.char_at(peak.frequency_hz, self.tolerance_hz) {
            Some(symbol) => symbol,
            None => {
                debug!("Noise window at {:.1} Hz", peak.frequency_hz);
                self.candidate = None;
                return expired;
            }
        };

        let run = match self.candidate {
            Some((pending, run)) if pending == symbol => run.saturating_add(1),
            _ => 1,
        };
        self.candidate = Some((symbol, run));
        if run < self.stable_windows || self.last_symbol == Some(symbol) {
            return expired;
        }
        self.last_symbol = Some(symbol);

        let completed = self.register(now, symbol);
        expired.or(completed)
    }

    /// Close the current frame if nothing has registered for the idle timeout
    pub fn poll_timeout(&mut self, now: Duration) -> Option<DecodedFrame> {
        let last = self.state.last_activity?;
        if now.saturating_sub(last) < self.idle_timeout {
            return None;
        }
        self.take_partial()
    }

    /// End of stream: hand over whatever partial frame is buffered
    pub fn finish(&mut self) -> Option<DecodedFrame> {
        self.last_symbol = None;
        self.candidate = None;
        self.take_partial()
    }

    fn take_partial(&mut self) -> Option<DecodedFrame> {
        let frame = if self.state.phase == ReceptionPhase::Receiving && !self.state.buffer.is_empty() {
            let text = self.state.frame_text(false);
            info!("Partial frame: {:?}", text);
            Some(DecodedFrame {
                text,
                complete: false,
            })
        } else {
            None
        };
        self.state.reset();
        frame
    }

    fn register(&mut self, now: Duration, symbol: char) -> Option<DecodedFrame> {
        debug!("Symbol {:?}", symbol);
        let state = &mut self.state;
        state.last_activity = Some(now);

        match (state.phase, symbol) {
            (phase, START_MARKER) => {
                if phase == ReceptionPhase::Receiving {
                    // Last start wins; a header heard inside the abandoned payload replaces the old one
                    if let Some(pos) = state.buffer.rfind(HEADER_OPEN) {
                        state.header = state.buffer[pos..].to_string();
                    }
                    debug!("Start marker while receiving, discarding {:?}", state.buffer);
                }
                state.buffer.clear();
                state.phase = ReceptionPhase::Receiving;
                None
            }
            (ReceptionPhase::Receiving, END_MARKER) => {
                let text = state.frame_text(true);
                info!("Decoded frame: {:?}", text);
                state.reset();
                Some(DecodedFrame {
                    text,
                    complete: true,
                })
            }
            (ReceptionPhase::Receiving, symbol) => {
                state.buffer.push(symbol);
                None
            }
            (ReceptionPhase::Idle, END_MARKER) => {
                debug!("End marker without start marker");
                None
            }
            (ReceptionPhase::Idle, HEADER_OPEN) => {
                state.header.clear();
                state.header.push(HEADER_OPEN);
                None
            }
            (ReceptionPhase::Idle, symbol) => {
                if !state.header.is_empty() {
                    if state.header.len() < MAX_HEADER_CHARS {
                        state.header.push(symbol);
                    } else {
                        debug!("Header too long, discarding {:?}", state.header);
                        state.header.clear();
                    }
                }
                None
            }
        }
    }
}

impl Default for Demodulator {
    fn default() -> Self {
        Self::new(&ModemConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{DeviceId, MessageId};
    use crate::packet::{parse_frame, Destination, Packet};
    use crate::{MAX_DEVICE_ID_LEN, MAX_MESSAGE_ID_LEN, STABLE_WINDOWS, STEP_HZ, TOLERANCE_HZ};

    const WINDOW: Duration = Duration::from_millis(4);
    const TONE_WINDOWS: u32 = 25;
    const GAP_WINDOWS: u32 = 5;

    struct Feeder {
        demod: Demodulator,
        table: SymbolTable,
        now: Duration,
        frames: Vec<DecodedFrame>,
    }

    impl Feeder {
        fn new() -> Self {
            Self {
                demod: Demodulator::default(),
                table: SymbolTable::default(),
                now: Duration::ZERO,
                frames: Vec::new(),
            }
        }

        fn window(&mut self, peak: Option<f32>) {
            self.now += WINDOW;
            let frame = match peak {
                Some(freq) => self.demod.push_frequency(self.now, freq),
                None => self.demod.push_peak(self.now, None),
            };
            self.frames.extend(frame);
        }

        fn hold(&mut self, peak: Option<f32>, windows: u32) {
            for _ in 0..windows {
                self.window(peak);
            }
        }

        fn text(&mut self, text: &str) {
            for c in text.chars() {
                let freq = self.table.frequency(c).unwrap();
                for _ in 0..TONE_WINDOWS {
                    self.window(Some(freq));
                }
                for _ in 0..GAP_WINDOWS {
                    self.window(None);
                }
            }
        }

        fn silence(&mut self, duration: Duration) {
            let end = self.now + duration;
            while self.now < end {
                self.window(None);
            }
        }
    }

    #[test]
    fn test_complete_frame() {
        let mut feeder = Feeder::new();
        feeder.text("[AB12C->broadcast#m1|hop0] ~hi^");
        assert_eq!(
            feeder.frames,
            vec![DecodedFrame {
                text: "[AB12C->broadcast#m1|hop0] ~hi^".to_string(),
                complete: true
            }]
        );
        assert_eq!(feeder.demod.phase(), ReceptionPhase::Idle);

        let packet = parse_frame(&feeder.frames[0].text).unwrap();
        assert_eq!(packet.source.as_str(), "AB12C");
        assert_eq!(packet.payload, "hi");
    }

    #[test]
    fn test_repeated_characters_survive_coalescing() {
        let mut feeder = Feeder::new();
        feeder.text("[AA->broadcast#mm1|hop0] ~hello  woo!!^");
        assert_eq!(feeder.frames.len(), 1);
        assert_eq!(feeder.frames[0].text, "[AA->broadcast#mm1|hop0] ~hello  woo!!^");
    }

    #[test]
    fn test_sustained_tone_registers_once() {
        let mut feeder = Feeder::new();
        feeder.text("[A->broadcast#1|hop0] ~");
        let freq = feeder.table.frequency('x').unwrap();
        for _ in 0..200 {
            feeder.window(Some(freq));
        }
        assert_eq!(feeder.demod.buffer(), "x");
    }

    #[test]
    fn test_noise_window_inside_tone_does_not_split_it() {
        let mut feeder = Feeder::new();
        feeder.text("[A->broadcast#1|hop0] ~");
        let freq = feeder.table.frequency('q').unwrap();
        for _ in 0..10 {
            feeder.window(Some(freq));
        }
        // Halfway between two symbols: outside every tolerance
        feeder.window(Some(freq + STEP_HZ / 2.0));
        feeder.window(Some(5000.0));
        for _ in 0..10 {
            feeder.window(Some(freq));
        }
        assert_eq!(feeder.demod.buffer(), "q");
    }

    #[test]
    fn test_weak_peak_is_silence() {
        let mut demod = Demodulator::default();
        let freq = SymbolTable::default().frequency('[').unwrap();
        let weak = Some(Peak {
            frequency_hz: freq,
            magnitude: crate::MIN_AMPLITUDE / 10.0,
        });
        let mut now = Duration::ZERO;
        for _ in 0..10 {
            now += WINDOW;
            assert_eq!(demod.push_peak(now, weak), None);
        }
        assert!(demod.state.header.is_empty());

        for _ in 0..STABLE_WINDOWS {
            now += WINDOW;
            assert_eq!(demod.push_frequency(now, freq), None);
        }
        assert_eq!(demod.state.header, "[");
    }

    #[test]
    fn test_symbol_needs_consecutive_windows() {
        let mut feeder = Feeder::new();
        feeder.text("~");
        let freq = feeder.table.frequency('m').unwrap();

        feeder.hold(Some(freq), STABLE_WINDOWS - 1);
        assert_eq!(feeder.demod.buffer(), "");
        feeder.window(Some(freq));
        assert_eq!(feeder.demod.buffer(), "m");

        // A run cut short by silence or noise starts over
        feeder.hold(None, 2);
        feeder.hold(Some(freq), STABLE_WINDOWS - 1);
        feeder.window(Some(5000.0));
        feeder.hold(Some(freq), STABLE_WINDOWS - 1);
        feeder.hold(None, 2);
        assert_eq!(feeder.demod.buffer(), "m");
    }

    #[test]
    fn test_tolerance_boundary() {
        let mut feeder = Feeder::new();
        let freq = feeder.table.frequency('k').unwrap();
        feeder.text("~");

        feeder.hold(Some(freq + TOLERANCE_HZ), STABLE_WINDOWS);
        assert_eq!(feeder.demod.buffer(), "k");

        feeder.hold(None, GAP_WINDOWS);
        feeder.hold(Some(freq - TOLERANCE_HZ), STABLE_WINDOWS);
        assert_eq!(feeder.demod.buffer(), "kk");

        feeder.hold(None, GAP_WINDOWS);
        feeder.hold(Some(freq + TOLERANCE_HZ + 1.0), TONE_WINDOWS);
        assert_eq!(feeder.demod.buffer(), "kk");
    }

    #[test]
    fn test_smeared_tone_edges_are_not_registered() {
        let mut feeder = Feeder::new();
        let wire = "[AB12C->broadcast#m1|hop0] ~noisy^";
        for (i, c) in wire.chars().enumerate() {
            let freq = feeder.table.frequency(c).unwrap();
            let lean = if i % 2 == 0 { STEP_HZ } else { -STEP_HZ };
            // Attack smears onto both neighbours, decay onto one
            feeder.hold(Some(freq + lean), 2);
            feeder.hold(Some(freq - lean), STABLE_WINDOWS - 1);
            feeder.hold(Some(freq), TONE_WINDOWS - 8);
            feeder.window(Some(freq + lean * 0.6));
            feeder.hold(Some(freq - lean), 2);
            feeder.hold(None, GAP_WINDOWS);
        }
        assert_eq!(feeder.frames.len(), 1);
        assert_eq!(feeder.frames[0].text, wire);
    }

    #[test]
    fn test_last_start_wins() {
        let mut feeder = Feeder::new();
        feeder.text("[OLD->broadcast#a1|hop0] ~lost payl");
        feeder.text("[NEW->broadcast#b2|hop3] ~kept^");
        assert_eq!(feeder.frames.len(), 1);
        assert_eq!(feeder.frames[0].text, "[NEW->broadcast#b2|hop3] ~kept^");
    }

    #[test]
    fn test_restart_without_new_header_keeps_old_header() {
        let mut feeder = Feeder::new();
        feeder.text("[AB->broadcast#a1|hop0] ~abc~xyz^");
        assert_eq!(feeder.frames.len(), 1);
        assert_eq!(feeder.frames[0].text, "[AB->broadcast#a1|hop0] ~xyz^");
    }

    #[test]
    fn test_end_marker_while_idle_is_ignored() {
        let mut feeder = Feeder::new();
        feeder.text("^^hi^");
        assert!(feeder.frames.is_empty());
        assert_eq!(feeder.demod.phase(), ReceptionPhase::Idle);
    }

    #[test]
    fn test_leading_noise_before_header_is_dropped() {
        let mut feeder = Feeder::new();
        feeder.text("zz9[AB->CD#x|hop1] ~ok^");
        assert_eq!(feeder.frames.len(), 1);
        assert_eq!(feeder.frames[0].text, "[AB->CD#x|hop1] ~ok^");
    }

    #[test]
    fn test_idle_timeout_emits_partial_once() {
        let mut feeder = Feeder::new();
        feeder.text("[AB->broadcast#t1|hop0] ~parti");
        assert!(feeder.frames.is_empty());
        assert_eq!(feeder.demod.phase(), ReceptionPhase::Receiving);

        // The last symbol registered 116 ms before the end of its slot
        feeder.silence(Duration::from_millis(1800));
        assert!(feeder.frames.is_empty(), "timeout fired early");

        feeder.silence(Duration::from_millis(300));
        assert_eq!(
            feeder.frames,
            vec![DecodedFrame {
                text: "[AB->broadcast#t1|hop0] ~parti".to_string(),
                complete: false
            }]
        );
        assert_eq!(feeder.demod.phase(), ReceptionPhase::Idle);

        feeder.silence(Duration::from_millis(5000));
        assert_eq!(feeder.frames.len(), 1);

        let packet = parse_frame(&feeder.frames[0].text).unwrap();
        assert_eq!(packet.payload, "parti");
    }

    #[test]
    fn test_timeout_with_empty_buffer_resets_silently() {
        let mut feeder = Feeder::new();
        feeder.text("[AB->broadcast#t1|hop0] ~");
        feeder.silence(Duration::from_millis(2500));
        assert!(feeder.frames.is_empty());
        assert_eq!(feeder.demod.phase(), ReceptionPhase::Idle);
        assert!(feeder.demod.state.header.is_empty());
    }

    #[test]
    fn test_late_symbol_after_timeout_starts_fresh() {
        let mut feeder = Feeder::new();
        feeder.text("~a");

        // No polling in between; the next window arrives long after the timeout
        feeder.now = Duration::from_secs(10);
        let freq = feeder.table.frequency('[').unwrap();
        feeder.hold(Some(freq), STABLE_WINDOWS);
        assert_eq!(
            feeder.frames,
            vec![DecodedFrame {
                text: "~a".to_string(),
                complete: false
            }]
        );
        assert_eq!(feeder.demod.phase(), ReceptionPhase::Idle);
        assert_eq!(feeder.demod.state.header, "[");
    }

    #[test]
    fn test_longest_header_is_kept() {
        let packet = Packet {
            source: DeviceId::new("S".repeat(MAX_DEVICE_ID_LEN)).unwrap(),
            destination: Destination::Device(DeviceId::new("d".repeat(MAX_DEVICE_ID_LEN)).unwrap()),
            message_id: MessageId::new("7".repeat(MAX_MESSAGE_ID_LEN)).unwrap(),
            hop: u32::MAX,
            payload: "hi".to_string(),
        };
        let wire = packet.to_wire();
        assert_eq!(wire.find(START_MARKER), Some(MAX_HEADER_CHARS));

        let mut feeder = Feeder::new();
        feeder.text(&wire);
        assert_eq!(feeder.frames.len(), 1);
        assert_eq!(parse_frame(&feeder.frames[0].text).unwrap(), packet);
    }

    #[test]
    fn test_header_overflow_is_discarded() {
        let mut feeder = Feeder::new();
        let junk = format!("[{}", "ab".repeat(MAX_HEADER_CHARS));
        feeder.text(&junk);
        assert!(feeder.demod.state.header.len() <= MAX_HEADER_CHARS);
        feeder.text("~x^");
        assert_eq!(feeder.frames.len(), 1);
        assert!(!feeder.frames[0].text.starts_with("[abab"));
    }

    #[test]
    fn test_finish_flushes_partial() {
        let mut feeder = Feeder::new();
        feeder.text("[AB->broadcast#f1|hop0] ~cut");
        let frame = feeder.demod.finish().unwrap();
        assert!(!frame.complete);
        assert_eq!(frame.text, "[AB->broadcast#f1|hop0] ~cut");
        assert_eq!(feeder.demod.finish(), None);
    }

    #[test]
    fn test_synthetic_spectra() {
        let mut demod = Demodulator::default();
        let table = SymbolTable::default();
        let mut now = Duration::ZERO;
        let mut frames = Vec::new();
        for c in "[X->broadcast#s|hop0] ~s^".chars() {
            let tone = Spectrum::from_tone(table.frequency(c).unwrap(), 0.5, 7.8125, 1025);
            for _ in 0..5 {
                now += WINDOW;
                frames.extend(demod.push_spectrum(now, &tone));
            }
            now += WINDOW;
            frames.extend(demod.push_spectrum(now, &Spectrum::silent(7.8125, 1025)));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].text, "[X->broadcast#s|hop0] ~s^");
    }
}
