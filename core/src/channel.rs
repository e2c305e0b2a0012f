use crate::error::{Result, ToneRelayError};
use crate::modulator::TonePlan;
use log::{debug, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Audio output capability
///
/// `emit_tone` starts a tone and must not block for its duration; pacing is
/// the channel's job.
pub trait ToneSink {
    fn emit_tone(&mut self, frequency_hz: f32, duration: Duration) -> Result<()>;

    fn silence(&mut self, _duration: Duration) -> Result<()> {
        Ok(())
    }
}

impl<S: ToneSink + ?Sized> ToneSink for Box<S> {
    fn emit_tone(&mut self, frequency_hz: f32, duration: Duration) -> Result<()> {
        (**self).emit_tone(frequency_hz, duration)
    }

    fn silence(&mut self, duration: Duration) -> Result<()> {
        (**self).silence(duration)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Wait out every tone and gap, for a live speaker
    Realtime,
    /// Hand tones to the sink back to back, for offline rendering
    Immediate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmitEvent {
    Started { text: String, symbols: usize },
    /// Transmit level: how far through the current message the channel is
    Level { sent: usize, total: usize },
    Finished { sent: usize, failed: usize },
}

/// Cloneable entry point of a running tone channel
#[derive(Debug, Clone)]
pub struct ToneChannelHandle {
    requests: mpsc::UnboundedSender<TonePlan>,
}

impl ToneChannelHandle {
    /// Queue a plan behind anything already playing
    pub fn transmit(&self, plan: TonePlan) -> Result<()> {
        self.requests
            .send(plan)
            .map_err(|_| ToneRelayError::ChannelClosed)
    }
}

/// Plays queued transmissions one at a time
///
/// Two transmissions never overlap: a request that arrives while another is
/// playing waits in the queue until the last gap of the previous one.
pub struct ToneChannel<S> {
    sink: S,
    pacing: Pacing,
    requests: mpsc::UnboundedReceiver<TonePlan>,
    events: mpsc::UnboundedSender<TransmitEvent>,
}

impl<S: ToneSink> ToneChannel<S> {
    pub fn new(
        sink: S,
        pacing: Pacing,
    ) -> (Self, ToneChannelHandle, mpsc::UnboundedReceiver<TransmitEvent>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let channel = Self {
            sink,
            pacing,
            requests: request_rx,
            events: event_tx,
        };
        (channel, ToneChannelHandle { requests: request_tx }, event_rx)
    }

    /// Serve requests until every handle is dropped, then give the sink back
    pub async fn run(mut self) -> S {
        while let Some(plan) = self.requests.recv().await {
            self.play(plan).await;
        }
        debug!("Tone channel closed");
        self.sink
    }

    async fn play(&mut self, plan: TonePlan) {
        let total = plan.len();
        self.notify(TransmitEvent::Started {
            text: plan.text(),
            symbols: total,
        });

        let pacing = self.pacing;
        let mut sent = 0;
        let mut failed = 0;
        for command in &plan.commands {
            match self.sink.emit_tone(command.frequency_hz, command.duration) {
                Ok(()) => sent += 1,
                Err(e) => {
                    // Lose this symbol only; the rest of the message still plays
                    warn!("Failed to emit {:?} at {} Hz: {}", command.symbol, command.frequency_hz, e);
                    failed += 1;
                }
            }
            pause(pacing, command.duration).await;

            if let Err(e) = self.sink.silence(command.gap) {
                warn!("Failed to emit gap after {:?}: {}", command.symbol, e);
            }
            pause(pacing, command.gap).await;

            self.notify(TransmitEvent::Level {
                sent: sent + failed,
                total,
            });
        }

        self.notify(TransmitEvent::Finished { sent, failed });
    }

    fn notify(&self, event: TransmitEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}

// Borrows nothing from the channel, so sinks only need to be Send
async fn pause(pacing: Pacing, duration: Duration) {
    if pacing == Pacing::Realtime && !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}

impl<S: ToneSink + Send + 'static> ToneChannel<S> {
    pub fn spawn(
        sink: S,
        pacing: Pacing,
    ) -> (
        ToneChannelHandle,
        mpsc::UnboundedReceiver<TransmitEvent>,
        JoinHandle<S>,
    ) {
        let (channel, handle, events) = Self::new(sink, pacing);
        let task = tokio::spawn(channel.run());
        (handle, events, task)
    }
}
