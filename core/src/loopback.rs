//! In-memory audio: capability doubles and a lossless multi-device mesh

use crate::channel::ToneSink;
use crate::config::{Config, ModemConfig};
use crate::error::{Result, ToneRelayError};
use crate::identity::{DeviceId, DeviceIdentity};
use crate::modulator::TonePlan;
use crate::node::{Node, NodeEvent};
use crate::packet::{Destination, Packet};
use crate::relay::{Delivery, Observation};
use crate::spectrum::{Spectrum, SpectrumSource};
use log::{debug, warn};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecordedTone {
    pub at: Instant,
    pub frequency_hz: f32,
    pub duration: Duration,
}

/// Tone sink that only remembers what it was asked to play.
/// Clones share the same recording.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    tones: Arc<Mutex<Vec<RecordedTone>>>,
    fail_on: Option<f32>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose output fails for one frequency
    pub fn failing_on(frequency_hz: f32) -> Self {
        Self {
            fail_on: Some(frequency_hz),
            ..Self::default()
        }
    }

    pub fn tones(&self) -> Vec<RecordedTone> {
        self.tones
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ToneSink for RecordingSink {
    fn emit_tone(&mut self, frequency_hz: f32, duration: Duration) -> Result<()> {
        if self.fail_on == Some(frequency_hz) {
            return Err(ToneRelayError::SinkError(format!(
                "refusing {} Hz",
                frequency_hz
            )));
        }
        self.tones
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedTone {
                at: Instant::now(),
                frequency_hz,
                duration,
            });
        Ok(())
    }
}

/// Spectrum source fed from tone plans instead of a microphone
///
/// Every analysis hop of a tone yields a clean single-tone spectrum, every hop
/// of a gap yields a silent one. `capture_spectrum` returns `None` once the
/// queue is drained.
pub struct SyntheticSpectrumSource {
    queue: VecDeque<Spectrum>,
    hop: Duration,
    bin_hz: f32,
    bins: usize,
    amplitude: f32,
}

impl SyntheticSpectrumSource {
    pub fn new(config: &ModemConfig) -> Self {
        Self {
            queue: VecDeque::new(),
            hop: config.hop_duration(),
            bin_hz: config.sample_rate as f32 / config.fft_len as f32,
            bins: config.fft_len / 2 + 1,
            amplitude: config.tone_amplitude,
        }
    }

    /// Scale every queued tone, as if the speaker were further away
    pub fn with_amplitude(mut self, amplitude: f32) -> Self {
        self.amplitude = amplitude;
        self
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn hops(&self, duration: Duration) -> usize {
        if self.hop.is_zero() {
            return 0;
        }
        (duration.as_nanos() / self.hop.as_nanos()) as usize
    }

    pub fn queue_plan(&mut self, plan: &TonePlan) {
        for command in &plan.commands {
            let tone = Spectrum::from_tone(command.frequency_hz, self.amplitude, self.bin_hz, self.bins);
            for _ in 0..self.hops(command.duration).max(1) {
                self.queue.push_back(tone.clone());
            }
            // At least one silent window, or repeated letters would merge
            self.queue_silence_hops(self.hops(command.gap).max(1));
        }
    }

    pub fn queue_silence(&mut self, duration: Duration) {
        self.queue_silence_hops(self.hops(duration));
    }

    fn queue_silence_hops(&mut self, hops: usize) {
        let silent = Spectrum::silent(self.bin_hz, self.bins);
        for _ in 0..hops {
            self.queue.push_back(silent.clone());
        }
    }
}

impl SpectrumSource for SyntheticSpectrumSource {
    fn capture_spectrum(&mut self) -> Option<Spectrum> {
        self.queue.pop_front()
    }
}

/// One airborne transmission in a simulation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    pub sender: DeviceId,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct MeshReport {
    pub transmissions: Vec<Transmission>,
    pub deliveries: Vec<(DeviceId, Delivery)>,
    pub observations: Vec<(DeviceId, Observation)>,
}

impl MeshReport {
    pub fn deliveries_to(&self, id: &DeviceId) -> Vec<&Delivery> {
        self.deliveries
            .iter()
            .filter(|(receiver, _)| receiver == id)
            .map(|(_, delivery)| delivery)
            .collect()
    }

    pub fn transmissions_by(&self, id: &DeviceId) -> usize {
        self.transmissions
            .iter()
            .filter(|transmission| &transmission.sender == id)
            .count()
    }
}

struct MeshDevice {
    node: Node,
    clock: Duration,
}

/// Fully connected, lossless network of devices sharing one acoustic space
///
/// Transmissions are played one after another. Every device except the
/// sender hears each one through the real modulator and demodulator.
pub struct SimulatedMesh {
    devices: Vec<MeshDevice>,
    config: Config,
    pending: VecDeque<(usize, TonePlan)>,
    max_transmissions: usize,
}

impl SimulatedMesh {
    pub fn new(identities: Vec<DeviceIdentity>, config: &Config) -> Self {
        let devices: Vec<MeshDevice> = identities
            .into_iter()
            .map(|identity| {
                let mut node = Node::new(identity, config);
                node.microphone_resolved(&Ok(()));
                MeshDevice {
                    node,
                    clock: Duration::ZERO,
                }
            })
            .collect();
        // Bound on a runaway flood
        let max_transmissions = devices.len().max(1) * 64;
        Self {
            devices,
            config: config.clone(),
            pending: VecDeque::new(),
            max_transmissions,
        }
    }

    /// `count` devices with freshly generated identities
    pub fn generate<R: Rng + ?Sized>(count: usize, config: &Config, rng: &mut R) -> Self {
        let identities = (0..count).map(|_| DeviceIdentity::generate(&mut *rng)).collect();
        Self::new(identities, config)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.devices
            .iter()
            .map(|device| device.node.identity().id().clone())
            .collect()
    }

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.devices.get(index).map(|device| &device.node)
    }

    pub fn node_mut(&mut self, index: usize) -> Option<&mut Node> {
        self.devices.get_mut(index).map(|device| &mut device.node)
    }

    /// Queue a new message from device `from`
    pub fn send(&mut self, from: usize, destination: Destination, text: &str) -> Option<Packet> {
        let device = self.devices.get_mut(from)?;
        let (packet, plan) = device.node.send(destination, text);
        self.pending.push_back((from, plan));
        Some(packet)
    }

    /// Play queued transmissions until the air is quiet
    pub fn run(&mut self) -> MeshReport {
        let mut report = MeshReport::default();
        let hop = self.config.modem.hop_duration();

        while let Some((sender, plan)) = self.pending.pop_front() {
            if report.transmissions.len() >= self.max_transmissions {
                warn!(
                    "Stopping simulation after {} transmissions, {} still queued",
                    report.transmissions.len(),
                    self.pending.len() + 1
                );
                break;
            }

            let sender_id = self.devices[sender].node.identity().id().clone();
            debug!("{} transmits {:?}", sender_id, plan.text());
            report.transmissions.push(Transmission {
                sender: sender_id,
                text: plan.text(),
            });

            let mut source = SyntheticSpectrumSource::new(&self.config.modem);
            source.queue_plan(&plan);
            let frames: Vec<Spectrum> = std::iter::from_fn(|| source.capture_spectrum()).collect();

            for listener in 0..self.devices.len() {
                if listener == sender {
                    continue;
                }
                let device = &mut self.devices[listener];
                let mut events = Vec::new();
                for spectrum in &frames {
                    device.clock += hop;
                    events.extend(device.node.on_spectrum(device.clock, spectrum));
                }
                self.collect(listener, events, &mut report);
            }
        }

        for index in 0..self.devices.len() {
            let events = self.devices[index].node.finish();
            self.collect(index, events, &mut report);
        }
        report
    }

    fn collect(&mut self, index: usize, events: Vec<NodeEvent>, report: &mut MeshReport) {
        let id = self.devices[index].node.identity().id().clone();
        for event in events {
            match event {
                NodeEvent::MessageDecoded(delivery) => report.deliveries.push((id.clone(), delivery)),
                NodeEvent::RelayObserved(observation) => {
                    report.observations.push((id.clone(), observation))
                }
                NodeEvent::Transmit(plan) => self.pending.push_back((index, plan)),
                NodeEvent::MicrophoneUnavailable(reason) => warn!("{}: {}", id, reason),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demodulator::Demodulator;
    use crate::modulator::Modulator;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_synthetic_source_frame_count() {
        let config = ModemConfig::default();
        let mut source = SyntheticSpectrumSource::new(&config);
        source.queue_plan(&Modulator::default().plan("ab"));
        // 25 tone hops and 5 gap hops per symbol
        assert_eq!(source.len(), 60);
        source.queue_silence(Duration::from_millis(40));
        assert_eq!(source.len(), 70);
    }

    #[test]
    fn test_synthetic_source_feeds_demodulator() {
        let config = ModemConfig::default();
        let text = "[AB->broadcast#x1|hop0] ~aa  bb^";
        let mut source = SyntheticSpectrumSource::new(&config);
        source.queue_plan(&Modulator::new(&config).plan(text));

        let mut demod = Demodulator::new(&config);
        let mut now = Duration::ZERO;
        let mut frames = Vec::new();
        while let Some(spectrum) = source.capture_spectrum() {
            now += config.hop_duration();
            frames.extend(demod.push_spectrum(now, &spectrum));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].text, text);
        assert!(source.is_empty());
    }

    #[test]
    fn test_attenuated_source_is_silence() {
        let config = ModemConfig::default();
        let mut source = SyntheticSpectrumSource::new(&config).with_amplitude(config.min_amplitude / 4.0);
        source.queue_plan(&Modulator::new(&config).plan("~abc^"));
        let mut demod = Demodulator::new(&config);
        let mut now = Duration::ZERO;
        while let Some(spectrum) = source.capture_spectrum() {
            now += config.hop_duration();
            assert_eq!(demod.push_spectrum(now, &spectrum), None);
        }
        assert!(demod.buffer().is_empty());
    }

    #[test]
    fn test_recording_sink_shares_recording() {
        let sink = RecordingSink::new();
        let mut writer = sink.clone();
        writer.emit_tone(440.0, Duration::from_millis(100)).unwrap();
        assert_eq!(sink.tones().len(), 1);
        assert_eq!(sink.tones()[0].frequency_hz, 440.0);

        let mut failing = RecordingSink::failing_on(440.0);
        assert!(failing.emit_tone(440.0, Duration::from_millis(100)).is_err());
        assert!(failing.emit_tone(460.0, Duration::from_millis(100)).is_ok());
        assert_eq!(failing.tones().len(), 1);
    }

    #[test]
    fn test_mesh_broadcast_floods_once() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut mesh = SimulatedMesh::generate(4, &Config::default(), &mut rng);
        let ids = mesh.ids();
        let sent = mesh.send(0, Destination::Broadcast, "hi all").unwrap();
        let report = mesh.run();

        assert_eq!(report.transmissions.len(), 4);
        assert_eq!(report.deliveries.len(), 3);
        assert!(report.deliveries_to(&ids[0]).is_empty());
        for id in &ids[1..] {
            let delivered = report.deliveries_to(id);
            assert_eq!(delivered.len(), 1);
            assert_eq!(delivered[0].packet.payload, "hi all");
            assert_eq!(delivered[0].packet.message_id, sent.message_id);
            assert_eq!(delivered[0].packet.hop, 0);
            assert_eq!(report.transmissions_by(id), 1);
        }
    }

    #[test]
    fn test_mesh_unicast() {
        let mut rng = StdRng::seed_from_u64(12);
        let mut mesh = SimulatedMesh::generate(4, &Config::default(), &mut rng);
        let ids = mesh.ids();
        mesh.send(0, Destination::Device(ids[2].clone()), "psst").unwrap();
        let report = mesh.run();

        assert_eq!(report.deliveries.len(), 1);
        assert_eq!(report.deliveries[0].0, ids[2]);
        // The addressee never forwards; the two bystanders do
        assert_eq!(report.transmissions_by(&ids[2]), 0);
        assert_eq!(report.transmissions.len(), 3);
    }

    #[test]
    fn test_mesh_without_devices() {
        let mut mesh = SimulatedMesh::new(Vec::new(), &Config::default());
        assert!(mesh.is_empty());
        assert!(mesh.send(0, Destination::Broadcast, "x").is_none());
        assert!(mesh.run().transmissions.is_empty());
    }
}
