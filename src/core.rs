use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A 32-byte BLAKE3 hash used for content-addressing.
///
/// Call keys can be arbitrarily long JSON documents, so every on-disk name
/// derived from a key (record files, per-task data directories) uses the hex
/// form of this hash instead of the key itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Wall-clock time of a cache write, in seconds since the UNIX epoch.
#[derive(Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(f64);

impl Timestamp {
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    pub fn from_secs(secs: f64) -> Self {
        Self(secs)
    }

    pub fn as_secs(self) -> f64 {
        self.0
    }
}

impl From<SystemTime> for Timestamp {
    fn from(value: SystemTime) -> Self {
        let secs = match value.duration_since(UNIX_EPOCH) {
            Ok(duration) => duration.as_secs_f64(),
            Err(err) => -err.duration().as_secs_f64(),
        };

        Self(secs)
    }
}

impl From<Timestamp> for SystemTime {
    fn from(value: Timestamp) -> Self {
        if value.0 >= 0.0 {
            UNIX_EPOCH + Duration::from_secs_f64(value.0)
        } else {
            UNIX_EPOCH - Duration::from_secs_f64(-value.0)
        }
    }
}

impl std::fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timestamp({:.6})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_hex() {
        let hex = Hash32::hash(b"{\"x\":3}").to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hex, Hash32::hash(b"{\"x\":3}").to_hex());
        assert_ne!(hex, Hash32::hash(b"{\"x\":4}").to_hex());
    }

    #[test]
    fn test_timestamp_order() {
        let a = Timestamp::from_secs(10.0);
        let b = Timestamp::from_secs(10.5);
        assert!(a < b);
        assert!(b >= a);
        assert!(a >= Timestamp::from_secs(10.0));
    }

    #[test]
    fn test_timestamp_system_time() {
        let time = UNIX_EPOCH + Duration::from_millis(1_500);
        let ts = Timestamp::from(time);
        assert_eq!(ts.as_secs(), 1.5);
        assert_eq!(SystemTime::from(ts), time);
    }
}
