use crate::error::{Result, ToneRelayError};
use crate::{
    BROADCAST, DEVICE_ID_LEN, MAX_DEVICE_ID_LEN, MAX_MESSAGE_ID_LEN, MESSAGE_ID_RANDOM_LEN,
};
use rand::Rng;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

const BASE36_UPPER: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const BASE36_LOWER: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Ids are bounded so every header fits the receiver's header buffer
fn validate_token(kind: &str, value: &str, max_len: usize) -> Result<()> {
    if value.is_empty() {
        return Err(ToneRelayError::InvalidIdentifier(format!("empty {}", kind)));
    }
    if value.len() > max_len {
        return Err(ToneRelayError::InvalidIdentifier(format!(
            "{} is {} characters, at most {} allowed",
            kind,
            value.len(),
            max_len
        )));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ToneRelayError::InvalidIdentifier(format!(
            "{} {:?} must be ASCII alphanumeric",
            kind, value
        )));
    }
    Ok(())
}

fn random_base36<R: Rng + ?Sized>(rng: &mut R, alphabet: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| char::from(alphabet[rng.gen_range(0..alphabet.len())]))
        .collect()
}

fn to_base36(mut value: u128) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36_LOWER[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// Short per-session device address. Not globally coordinated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        validate_token("device id", &value, MAX_DEVICE_ID_LEN)?;
        if value == BROADCAST {
            return Err(ToneRelayError::InvalidIdentifier(format!(
                "{:?} is reserved",
                BROADCAST
            )));
        }
        Ok(Self(value))
    }

    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self(random_base36(rng, BASE36_UPPER, DEVICE_ID_LEN))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one origin transmission, unique with overwhelming probability
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        validate_token("message id", &value, MAX_MESSAGE_ID_LEN)?;
        Ok(Self(value))
    }

    /// Random base-36 prefix followed by the millisecond timestamp in base 36
    pub fn generate<R: Rng + ?Sized>(rng: &mut R, now: SystemTime) -> Self {
        let millis = now
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or(0);
        let mut id = random_base36(rng, BASE36_LOWER, MESSAGE_ID_RANDOM_LEN);
        id.push_str(&to_base36(millis));
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The address this device answers to for the current session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    id: DeviceId,
    privileged: bool,
}

impl DeviceIdentity {
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            id: DeviceId::generate(rng),
            privileged: false,
        }
    }

    /// The reserved identity allowed to enter monitor mode
    pub fn privileged(privileged_id: &str) -> Result<Self> {
        Ok(Self {
            id: DeviceId::new(privileged_id)?,
            privileged: true,
        })
    }

    /// Use `existing` when the session already has an id, otherwise generate one.
    /// An id equal to the privileged id ignoring case resolves to the privileged identity.
    pub fn resolve<R: Rng + ?Sized>(
        existing: Option<&str>,
        privileged_id: &str,
        rng: &mut R,
    ) -> Result<Self> {
        match existing {
            Some(value) if value.eq_ignore_ascii_case(privileged_id) => {
                Self::privileged(privileged_id)
            }
            Some(value) => Ok(Self {
                id: DeviceId::new(value)?,
                privileged: false,
            }),
            None => Ok(Self::generate(rng)),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    #[test]
    fn test_generated_device_id_shape() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let id = DeviceId::generate(&mut rng);
            assert_eq!(id.as_str().len(), DEVICE_ID_LEN);
            assert!(id
                .as_str()
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn test_device_id_rejects_delimiters() {
        assert!(DeviceId::new("AB12C").is_ok());
        assert!(DeviceId::new("").is_err());
        assert!(DeviceId::new("A-B").is_err());
        assert!(DeviceId::new("A#B").is_err());
        assert!(DeviceId::new("A B").is_err());
        assert!(DeviceId::new(BROADCAST).is_err());
    }

    #[test]
    fn test_id_length_limits() {
        assert!(DeviceId::new("D".repeat(MAX_DEVICE_ID_LEN)).is_ok());
        assert!(matches!(
            DeviceId::new("D".repeat(MAX_DEVICE_ID_LEN + 1)),
            Err(ToneRelayError::InvalidIdentifier(_))
        ));
        assert!(MessageId::new("m".repeat(MAX_MESSAGE_ID_LEN)).is_ok());
        assert!(MessageId::new("m".repeat(MAX_MESSAGE_ID_LEN + 1)).is_err());
        assert!(BROADCAST.len() <= MAX_DEVICE_ID_LEN);

        let mut rng = StdRng::seed_from_u64(5);
        let generated = MessageId::generate(&mut rng, SystemTime::now());
        assert!(MessageId::new(generated.as_str()).is_ok());
    }

    #[test]
    fn test_message_id_has_timestamp_suffix() {
        let mut rng = StdRng::seed_from_u64(1);
        let now = UNIX_EPOCH + Duration::from_millis(36 * 36);
        let id = MessageId::generate(&mut rng, now);
        assert_eq!(id.as_str().len(), MESSAGE_ID_RANDOM_LEN + 3);
        assert!(id.as_str().ends_with("100"));
        assert!(MessageId::new(id.as_str()).is_ok());
    }

    #[test]
    fn test_message_ids_differ() {
        let mut rng = StdRng::seed_from_u64(99);
        let now = SystemTime::now();
        let a = MessageId::generate(&mut rng, now);
        let b = MessageId::generate(&mut rng, now);
        assert_ne!(a, b);
    }

    #[test]
    fn test_to_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }

    #[test]
    fn test_resolve_identity() {
        let mut rng = StdRng::seed_from_u64(3);

        let generated = DeviceIdentity::resolve(None, "Iam", &mut rng).unwrap();
        assert!(!generated.is_privileged());
        assert_eq!(generated.id().as_str().len(), DEVICE_ID_LEN);

        let existing = DeviceIdentity::resolve(Some("XY9"), "Iam", &mut rng).unwrap();
        assert_eq!(existing.id().as_str(), "XY9");
        assert!(!existing.is_privileged());

        let privileged = DeviceIdentity::resolve(Some("iam"), "Iam", &mut rng).unwrap();
        assert_eq!(privileged.id().as_str(), "Iam");
        assert!(privileged.is_privileged());

        assert!(DeviceIdentity::resolve(Some("bad id"), "Iam", &mut rng).is_err());
    }
}
