use crate::config::RelayConfig;
use crate::error::{Result, ToneRelayError};
use crate::identity::{DeviceIdentity, MessageId};
use crate::packet::{Destination, Packet};
use crate::{END_MARKER, START_MARKER};
use log::{debug, info};
use rand::Rng;
use std::collections::HashSet;
use std::time::SystemTime;

/// Message ids this session has already processed. Never evicted.
#[derive(Debug, Default)]
pub struct SeenSet {
    ids: HashSet<MessageId>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    /// Returns false if the id was already present
    pub fn insert(&mut self, id: MessageId) -> bool {
        self.ids.insert(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Everything one device keeps between startup and shutdown
#[derive(Debug)]
pub struct Session {
    identity: DeviceIdentity,
    seen: SeenSet,
    monitor: bool,
}

impl Session {
    pub fn start(identity: DeviceIdentity) -> Self {
        info!("Session started as {}", identity.id());
        Self {
            identity,
            seen: SeenSet::new(),
            monitor: false,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }

    pub fn monitor_enabled(&self) -> bool {
        self.monitor
    }

    /// Drop the session; the identity and seen ids do not outlive it
    pub fn end(self) {
        info!(
            "Session {} ended after {} messages",
            self.identity.id(),
            self.seen.len()
        );
    }
}

/// A packet addressed to this device or to everyone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub packet: Packet,
    /// False when the frame was closed by the idle timeout
    pub complete: bool,
}

/// A packet for someone else, surfaced only in monitor mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub packet: Packet,
    pub complete: bool,
}

/// Copy to put back on the air, hop already incremented
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub packet: Packet,
    /// Partial frames are re-aired without the end marker
    pub complete: bool,
}

impl Forward {
    pub fn to_wire(&self) -> String {
        self.packet.to_frame(self.complete)
    }
}

/// What to do with one decoded packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayDecision {
    /// Already processed; nothing else is set
    pub duplicate: bool,
    pub delivery: Option<Delivery>,
    pub observation: Option<Observation>,
    pub forward: Option<Forward>,
}

impl RelayDecision {
    fn duplicate() -> Self {
        Self {
            duplicate: true,
            ..Self::default()
        }
    }
}

/// Flood relay with deduplication
pub struct RelayEngine {
    session: Session,
    config: RelayConfig,
}

impl RelayEngine {
    pub fn new(identity: DeviceIdentity, config: RelayConfig) -> Self {
        Self {
            session: Session::start(identity),
            config,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn identity(&self) -> &DeviceIdentity {
        self.session.identity()
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    pub fn on_packet_decoded(&mut self, packet: Packet, complete: bool) -> RelayDecision {
        if !self.session.seen.insert(packet.message_id.clone()) {
            debug!("Duplicate message {}, dropping", packet.message_id);
            return RelayDecision::duplicate();
        }

        let me = self.session.identity.id();
        let for_me = packet.destination.is_device(me);
        let mut decision = RelayDecision::default();

        if for_me || packet.destination.is_broadcast() {
            info!(
                "Delivered {} from {} (hop {}): {:?}",
                packet.message_id, packet.source, packet.hop, packet.payload
            );
            decision.delivery = Some(Delivery {
                packet: packet.clone(),
                complete,
            });
        } else if self.session.monitor {
            decision.observation = Some(Observation {
                packet: packet.clone(),
                complete,
            });
        }

        if !for_me {
            decision.forward = self.forward_copy(&packet, complete);
        }
        decision
    }

    fn forward_copy(&self, packet: &Packet, complete: bool) -> Option<Forward> {
        if !complete && !self.config.forward_partial {
            debug!("Not forwarding partial frame {}", packet.message_id);
            return None;
        }
        let next_hop = match packet.hop.checked_add(1) {
            Some(hop) => hop,
            None => return None,
        };
        if let Some(max_hops) = self.config.max_hops {
            if next_hop > max_hops {
                debug!(
                    "Not forwarding {}: hop {} exceeds limit {}",
                    packet.message_id, next_hop, max_hops
                );
                return None;
            }
        }
        info!("Forwarding {} at hop {}", packet.message_id, next_hop);
        Some(Forward {
            packet: packet.next_hop(),
            complete,
        })
    }

    /// Build a hop-0 packet from this device and mark its id as seen
    pub fn originate(&mut self, destination: Destination, text: &str) -> Packet {
        self.originate_with(destination, text, &mut rand::thread_rng(), SystemTime::now())
    }

    pub fn originate_with<R: Rng + ?Sized>(
        &mut self,
        destination: Destination,
        text: &str,
        rng: &mut R,
        now: SystemTime,
    ) -> Packet {
        // Markers inside the payload would end or restart the frame early
        let payload: String = text
            .chars()
            .filter(|&c| c != START_MARKER && c != END_MARKER)
            .collect();

        let message_id = MessageId::generate(rng, now);
        self.session.seen.insert(message_id.clone());

        Packet {
            source: self.session.identity.id().clone(),
            destination,
            message_id,
            hop: 0,
            payload,
        }
    }

    pub fn monitor_enabled(&self) -> bool {
        self.session.monitor
    }

    pub fn set_monitor(&mut self, enabled: bool) -> Result<()> {
        if !self.session.identity.is_privileged() {
            return Err(ToneRelayError::MonitorNotPermitted);
        }
        self.session.monitor = enabled;
        info!("Monitor mode {}", if enabled { "on" } else { "off" });
        Ok(())
    }

    pub fn toggle_monitor(&mut self) -> Result<bool> {
        let enabled = !self.session.monitor;
        self.set_monitor(enabled)?;
        Ok(enabled)
    }
}
