//! One device: hears spectra, decides, speaks tone plans

use crate::channel::ToneChannelHandle;
use crate::config::Config;
use crate::demodulator::{DecodedFrame, Demodulator, ReceptionPhase};
use crate::error::Result;
use crate::identity::DeviceIdentity;
use crate::modulator::{Modulator, TonePlan};
use crate::packet::{parse_frame, Destination, Packet};
use crate::relay::{Delivery, Observation, RelayEngine};
use crate::spectrum::{Spectrum, SpectrumSource};
use log::{debug, info, warn};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicrophoneState {
    /// Acquisition has not resolved yet
    Pending,
    Active,
    /// Input denied or missing; the node can still send
    Unavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    MessageDecoded(Delivery),
    RelayObserved(Observation),
    Transmit(TonePlan),
    MicrophoneUnavailable(String),
}

/// A message the user wants to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub destination: Destination,
    pub text: String,
}

/// One attempt at opening the microphone
pub type MicrophoneRequest<S> = Pin<Box<dyn Future<Output = Result<S>> + Send>>;

/// Input to a running session
pub enum SessionRequest<S> {
    Send(OutboundRequest),
    /// Ask for the microphone again after it failed; ignored while one is active
    RetryMicrophone(MicrophoneRequest<S>),
}

impl<S> fmt::Debug for SessionRequest<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Send(request) => f.debug_tuple("Send").field(request).finish(),
            Self::RetryMicrophone(_) => f.write_str("RetryMicrophone"),
        }
    }
}

pub struct Node {
    engine: RelayEngine,
    demodulator: Demodulator,
    modulator: Modulator,
    microphone: MicrophoneState,
}

impl Node {
    pub fn new(identity: DeviceIdentity, config: &Config) -> Self {
        Self {
            engine: RelayEngine::new(identity, config.relay.clone()),
            demodulator: Demodulator::new(&config.modem),
            modulator: Modulator::new(&config.modem),
            microphone: MicrophoneState::Pending,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        self.engine.identity()
    }

    pub fn engine(&self) -> &RelayEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut RelayEngine {
        &mut self.engine
    }

    pub fn microphone(&self) -> MicrophoneState {
        self.microphone
    }

    pub fn reception(&self) -> ReceptionPhase {
        self.demodulator.phase()
    }

    /// A new acquisition attempt started. Returns false when the microphone
    /// is already active and the attempt is not needed.
    pub fn microphone_requested(&mut self) -> bool {
        if self.microphone == MicrophoneState::Active {
            return false;
        }
        self.microphone = MicrophoneState::Pending;
        true
    }

    /// Record the outcome of a microphone acquisition attempt
    pub fn microphone_resolved<T>(&mut self, result: &Result<T>) -> Vec<NodeEvent> {
        match result {
            Ok(_) => {
                self.microphone = MicrophoneState::Active;
                Vec::new()
            }
            Err(e) => {
                warn!("Microphone unavailable: {}", e);
                self.microphone = MicrophoneState::Unavailable;
                vec![NodeEvent::MicrophoneUnavailable(e.to_string())]
            }
        }
    }

    pub fn on_spectrum(&mut self, now: Duration, spectrum: &Spectrum) -> Vec<NodeEvent> {
        if self.microphone != MicrophoneState::Active {
            return Vec::new();
        }
        match self.demodulator.push_spectrum(now, spectrum) {
            Some(frame) => self.on_frame(frame),
            None => Vec::new(),
        }
    }

    /// Advance time without audio, closing a stalled frame on timeout
    pub fn tick(&mut self, now: Duration) -> Vec<NodeEvent> {
        match self.demodulator.poll_timeout(now) {
            Some(frame) => self.on_frame(frame),
            None => Vec::new(),
        }
    }

    /// Flush a half-received frame at end of input
    pub fn finish(&mut self) -> Vec<NodeEvent> {
        match self.demodulator.finish() {
            Some(frame) => self.on_frame(frame),
            None => Vec::new(),
        }
    }

    pub fn on_frame(&mut self, frame: DecodedFrame) -> Vec<NodeEvent> {
        let packet = match parse_frame(&frame.text) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping frame {:?}: {}", frame.text, e);
                return Vec::new();
            }
        };

        let decision = self.engine.on_packet_decoded(packet, frame.complete);
        let mut events = Vec::new();
        if let Some(delivery) = decision.delivery {
            events.push(NodeEvent::MessageDecoded(delivery));
        }
        if let Some(observation) = decision.observation {
            events.push(NodeEvent::RelayObserved(observation));
        }
        if let Some(forward) = decision.forward {
            events.push(NodeEvent::Transmit(self.modulator.plan(&forward.to_wire())));
        }
        events
    }

    /// Originate a message; the plan still has to be handed to a tone channel
    pub fn send(&mut self, destination: Destination, text: &str) -> (Packet, TonePlan) {
        let packet = self.engine.originate(destination, text);
        info!("Sending {} to {}", packet.message_id, packet.destination);
        let plan = self.modulator.plan(&packet.to_wire());
        (packet, plan)
    }
}

fn dispatch(
    events: Vec<NodeEvent>,
    tones: &ToneChannelHandle,
    out: &mpsc::UnboundedSender<NodeEvent>,
) -> Result<()> {
    for event in events {
        if let NodeEvent::Transmit(plan) = &event {
            tones.transmit(plan.clone())?;
        }
        // Nobody listening is fine
        let _ = out.send(event);
    }
    Ok(())
}

/// Drive `node` until the request channel closes
///
/// `microphone` resolves to the spectrum source; while it is pending or
/// failed the node can still send, and a `RetryMicrophone` request makes
/// another attempt without losing the session. One spectrum is captured per
/// `hop`, and stream time is the time since the session started.
pub async fn run_session<S, F>(
    mut node: Node,
    microphone: F,
    hop: Duration,
    tones: ToneChannelHandle,
    mut requests: mpsc::Receiver<SessionRequest<S>>,
    events: mpsc::UnboundedSender<NodeEvent>,
) -> Result<Node>
where
    S: SpectrumSource,
    F: Future<Output = Result<S>>,
{
    let start = Instant::now();
    let acquired = microphone.await;
    dispatch(node.microphone_resolved(&acquired), &tones, &events)?;
    let mut source = acquired.ok();

    let mut ticker = tokio::time::interval(hop);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = start.elapsed();
                if let Some(spectrum) = source.as_mut().and_then(|s| s.capture_spectrum()) {
                    dispatch(node.on_spectrum(now, &spectrum), &tones, &events)?;
                }
                dispatch(node.tick(now), &tones, &events)?;
            }
            request = requests.recv() => match request {
                Some(SessionRequest::Send(request)) => {
                    let (_, plan) = node.send(request.destination, &request.text);
                    dispatch(vec![NodeEvent::Transmit(plan)], &tones, &events)?;
                }
                Some(SessionRequest::RetryMicrophone(attempt)) => {
                    if !node.microphone_requested() {
                        debug!("Microphone already active, ignoring retry");
                        continue;
                    }
                    info!("Retrying microphone");
                    let acquired = attempt.await;
                    dispatch(node.microphone_resolved(&acquired), &tones, &events)?;
                    if let Ok(acquired) = acquired {
                        source = Some(acquired);
                    }
                }
                None => {
                    debug!("Request channel closed, ending session");
                    break;
                }
            },
        }
    }

    dispatch(node.finish(), &tones, &events)?;
    Ok(node)
}
