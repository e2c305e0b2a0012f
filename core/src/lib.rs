//! Acoustic short-text messaging with flood relay
//!
//! Characters become single tones (one frequency per printable ASCII symbol),
//! packets carry a small text header, and every device that hears a packet
//! re-emits it once so messages travel beyond a single hop.

pub mod error;
pub mod config;
pub mod symbols;
pub mod packet;
pub mod identity;
pub mod modulator;
pub mod channel;
pub mod spectrum;
pub mod demodulator;
pub mod relay;
pub mod node;
pub mod loopback;

pub use channel::{Pacing, ToneChannel, ToneChannelHandle, ToneSink, TransmitEvent};
pub use config::{Config, ModemConfig, RelayConfig};
pub use demodulator::{DecodedFrame, Demodulator, ReceptionPhase};
pub use error::{Result, ToneRelayError};
pub use identity::{DeviceId, DeviceIdentity, MessageId};
pub use loopback::{MeshReport, RecordedTone, RecordingSink, SimulatedMesh, SyntheticSpectrumSource, Transmission};
pub use modulator::{Modulator, ToneCommand, TonePlan, ToneSynthesizer};
pub use node::{run_session, MicrophoneRequest, MicrophoneState, Node, NodeEvent, OutboundRequest, SessionRequest};
pub use packet::{parse_frame, serialize_header, Destination, Packet};
pub use relay::{Delivery, Forward, Observation, RelayDecision, RelayEngine, SeenSet, Session};
pub use spectrum::{Peak, Spectrum, SpectrumAnalyzer, SpectrumSource};
pub use symbols::SymbolTable;

// Audio configuration
pub const SAMPLE_RATE: usize = 16000;
pub const TONE_DURATION_MS: u64 = 100;
pub const TONE_GAP_MS: u64 = 20;
pub const TONE_AMPLITUDE: f32 = 0.5;

// Symbol table configuration (shared by every device on a channel)
pub const BASE_FREQ_HZ: f32 = 400.0;
pub const STEP_HZ: f32 = 20.0;
pub const TOLERANCE_HZ: f32 = 8.0;
pub const ALPHABET_FIRST: u8 = 0x20;
pub const ALPHABET_LAST: u8 = 0x7E;
pub const ALPHABET_SIZE: usize = (ALPHABET_LAST - ALPHABET_FIRST) as usize + 1; // 95

// Analysis configuration
pub const ANALYSIS_WINDOW_SAMPLES: usize = 256; // 16ms
pub const ANALYSIS_HOP_SAMPLES: usize = 64; // 4ms, keeps one window inside every gap
pub const ANALYSIS_FFT_LEN: usize = 2048;
pub const MIN_AMPLITUDE: f32 = 0.05;
pub const STABLE_WINDOWS: u32 = 4; // 16ms of agreement before a symbol registers
pub const IDLE_TIMEOUT_MS: u64 = 2000;

// Framing
pub const START_MARKER: char = '~';
pub const END_MARKER: char = '^';
pub const HEADER_OPEN: char = '[';

// Addressing
pub const BROADCAST: &str = "broadcast";
pub const PRIVILEGED_DEVICE_ID: &str = "Iam";
pub const DEVICE_ID_LEN: usize = 5;
pub const MESSAGE_ID_RANDOM_LEN: usize = 8;
pub const MAX_DEVICE_ID_LEN: usize = 16;
pub const MAX_MESSAGE_ID_LEN: usize = 32;

/// Longest header any valid packet produces: `[src->dst#id|hopN] `
pub const MAX_HEADER_CHARS: usize =
    "[->#|hop] ".len() + 2 * MAX_DEVICE_ID_LEN + MAX_MESSAGE_ID_LEN + U32_DIGITS; // 84
const U32_DIGITS: usize = 10;
