//! Cache entries, TTL policy and their persisted form

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::{Error, Result};

const ENTRY_MAGIC: &[u8; 4] = b"HPCE";
const ENTRY_VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 8 + 8 + 8 + 4;

/// Two-threshold freshness policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ttl {
    min: Duration,
    max: Duration,
}

impl Ttl {
    /// Build a policy, rejecting `min > max`
    pub fn new(min: Duration, max: Duration) -> Result<Self> {
        if min > max {
            return Err(Error::Validation(format!(
                "min_ttl ({}) must not exceed max_ttl ({})",
                humantime::format_duration(min),
                humantime::format_duration(max)
            )));
        }
        Ok(Self { min, max })
    }

    /// Age below which an entry is served as-is
    #[must_use]
    pub fn min(&self) -> Duration {
        self.min
    }

    /// Age at or above which an entry must be recomputed before serving
    #[must_use]
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Classify an entry of the given age
    #[must_use]
    pub fn classify(&self, age: Duration) -> Freshness {
        if age < self.min {
            Freshness::Fresh
        } else if age < self.max {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}

/// State of an entry relative to a [`Ttl`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Serve without recomputing
    Fresh,
    /// Serve, then refresh in the background
    Stale,
    /// Recompute before serving
    Expired,
}

/// A computed value with the time and policy it was computed under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Store key
    pub key: String,
    /// Opaque computed value
    pub value: Bytes,
    /// When the computation finished
    pub computed_at: DateTime<Utc>,
    /// Policy in force when the value was computed
    pub ttl: Ttl,
}

impl CacheEntry {
    /// Age at `now`; a `computed_at` in the future (clock skew between
    /// instances) counts as age zero.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.computed_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Freshness at `now` under `ttl`
    #[must_use]
    pub fn freshness(&self, now: DateTime<Utc>, ttl: &Ttl) -> Freshness {
        ttl.classify(self.age(now))
    }

    /// Whether the entry has outlived the policy it was stored with
    #[must_use]
    pub fn outlived(&self, now: DateTime<Utc>) -> bool {
        self.age(now) >= self.ttl.max
    }

    /// Serialize for the backing store
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.value.len());
        buf.put_slice(ENTRY_MAGIC);
        buf.put_u8(ENTRY_VERSION);
        buf.put_i64(self.computed_at.timestamp_millis());
        buf.put_u64(duration_millis(self.ttl.min));
        buf.put_u64(duration_millis(self.ttl.max));
        // Values are buffered origin responses, well under 4 GiB
        buf.put_u32(u32::try_from(self.value.len()).unwrap_or(u32::MAX));
        buf.put_slice(&self.value);
        buf.freeze()
    }

    /// Deserialize an entry read from the backing store
    pub fn decode(key: &str, mut data: Bytes) -> Result<Self> {
        if data.remaining() < HEADER_LEN || &data[..4] != ENTRY_MAGIC {
            return Err(Error::Store(format!("corrupt cache entry for {key}")));
        }
        data.advance(4);
        let version = data.get_u8();
        if version != ENTRY_VERSION {
            return Err(Error::Store(format!(
                "cache entry for {key} has unsupported version {version}"
            )));
        }
        let computed_at = DateTime::<Utc>::from_timestamp_millis(data.get_i64())
            .ok_or_else(|| Error::Store(format!("cache entry for {key} has invalid timestamp")))?;
        let min = Duration::from_millis(data.get_u64());
        let max = Duration::from_millis(data.get_u64());
        let ttl = Ttl::new(min, max).map_err(|e| Error::Store(e.to_string()))?;
        let len = data.get_u32() as usize;
        if data.remaining() != len {
            return Err(Error::Store(format!(
                "cache entry for {key} declares {len} value bytes, has {}",
                data.remaining()
            )));
        }

        Ok(Self {
            key: key.to_string(),
            value: data,
            computed_at,
            ttl,
        })
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
