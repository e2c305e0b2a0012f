use crate::error::{Result, ToneRelayError};
use crate::identity::{DeviceId, MessageId};
use crate::{BROADCAST, END_MARKER, HEADER_OPEN, START_MARKER};
use std::fmt;

const ARROW: &str = "->";
const ID_SEPARATOR: &str = "#";
const HOP_PREFIX: &str = "|hop";
const HEADER_CLOSE: &str = "]";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Broadcast,
    Device(DeviceId),
}

impl Destination {
    pub fn parse(value: &str) -> Result<Self> {
        if value == BROADCAST {
            Ok(Self::Broadcast)
        } else {
            DeviceId::new(value).map(Self::Device)
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::Broadcast)
    }

    pub fn is_device(&self, id: &DeviceId) -> bool {
        matches!(self, Self::Device(target) if target == id)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadcast => f.write_str(BROADCAST),
            Self::Device(id) => write!(f, "{}", id),
        }
    }
}

/// One link-layer message, rebuilt at every hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub source: DeviceId,
    pub destination: Destination,
    pub message_id: MessageId,
    pub hop: u32,
    pub payload: String,
}

impl Packet {
    /// Copy of this packet with the hop count bumped by one
    pub fn next_hop(&self) -> Self {
        Self {
            hop: self.hop.saturating_add(1),
            ..self.clone()
        }
    }

    /// Full airborne text: header, then the payload between the markers
    pub fn to_wire(&self) -> String {
        self.to_frame(true)
    }

    /// Airborne text, with the end marker only when `complete`
    pub fn to_frame(&self, complete: bool) -> String {
        let mut text = serialize_header(&self.source, &self.destination, &self.message_id, self.hop);
        text.reserve(self.payload.len() + 2);
        text.push(START_MARKER);
        text.push_str(&self.payload);
        if complete {
            text.push(END_MARKER);
        }
        text
    }
}

/// `[{source}->{destination}#{message_id}|hop{hop}] `
pub fn serialize_header(
    source: &DeviceId,
    destination: &Destination,
    message_id: &MessageId,
    hop: u32,
) -> String {
    format!(
        "{}{}{}{}{}{}{}{}{} ",
        HEADER_OPEN, source, ARROW, destination, ID_SEPARATOR, message_id, HOP_PREFIX, hop, HEADER_CLOSE
    )
}

fn malformed(reason: impl Into<String>) -> ToneRelayError {
    ToneRelayError::MalformedHeader(reason.into())
}

/// Split `text` at the first occurrence of `delimiter`
fn take_until<'a>(text: &'a str, delimiter: &str, field: &str) -> Result<(&'a str, &'a str)> {
    text.find(delimiter)
        .map(|pos| (&text[..pos], &text[pos + delimiter.len()..]))
        .ok_or_else(|| malformed(format!("missing {:?} after {}", delimiter, field)))
}

/// Parse a reassembled frame back into a packet
///
/// Fields are located by their literal delimiters, not by a grammar. Text before
/// the opening bracket is ignored. The end marker may be missing when the frame
/// was completed by the idle timeout; the payload then runs to the end of text.
pub fn parse_frame(text: &str) -> Result<Packet> {
    let open = text
        .find(HEADER_OPEN)
        .ok_or_else(|| malformed("missing header"))?;
    let rest = &text[open + HEADER_OPEN.len_utf8()..];

    let (source, rest) = take_until(rest, ARROW, "source")?;
    let (destination, rest) = take_until(rest, ID_SEPARATOR, "destination")?;
    let (message_id, rest) = take_until(rest, HOP_PREFIX, "message id")?;
    let (hop, rest) = take_until(rest, HEADER_CLOSE, "hop count")?;

    let source = DeviceId::new(source).map_err(|e| malformed(e.to_string()))?;
    let destination = Destination::parse(destination).map_err(|e| malformed(e.to_string()))?;
    let message_id = MessageId::new(message_id).map_err(|e| malformed(e.to_string()))?;
    if hop.is_empty() || !hop.chars().all(|c| c.is_ascii_digit()) {
        return Err(malformed(format!("hop count {:?} is not a number", hop)));
    }
    let hop: u32 = hop
        .parse()
        .map_err(|_| malformed(format!("hop count {:?} out of range", hop)))?;

    let body = rest.strip_prefix(' ').unwrap_or(rest);
    let body = body
        .strip_prefix(START_MARKER)
        .ok_or_else(|| malformed("missing start marker"))?;
    let payload = match body.find(END_MARKER) {
        Some(end) => &body[..end],
        None => body,
    };

    Ok(Packet {
        source,
        destination,
        message_id,
        hop,
        payload: payload.to_string(),
    })
}
