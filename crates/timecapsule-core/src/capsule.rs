//! The capsule envelope and its transport codec.
//!
//! A capsule serializes to a JSON envelope (`{"payload": ..., "buried_at":
//! ...}`), then base64, so the result is printable and safe as a sorted-set
//! member on any backend. The transport string is memoized per instance:
//! decoding caches the original input, so re-encoding a decoded capsule
//! returns the identical string byte-for-byte.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CapsuleError, Result};

/// Current UTC time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// A payload envelope with burial and dig-out timestamps.
///
/// Two structurally identical payloads buried at different times produce
/// different transport strings because `buried_at` differs, so bursts of the
/// same payload never collide as store members.
#[derive(Debug)]
pub struct Capsule<P> {
    /// The caller's payload.
    pub payload: P,
    /// Epoch ms at which the capsule was created by a bury call. Persisted.
    pub buried_at: i64,
    /// Epoch ms at which a dig judged the capsule due. Zero until then, and
    /// never part of the persisted form.
    pub dug_out_at: i64,
    /// Memoized transport string. Stable once computed.
    sealed: OnceCell<String>,
}

/// Persisted form of a capsule. `dug_out_at` deliberately does not travel —
/// it exists only on the in-memory object returned by a dig.
#[derive(Deserialize)]
struct Envelope<P> {
    payload: P,
    buried_at: i64,
}

#[derive(Serialize)]
struct EnvelopeRef<'a, P> {
    payload: &'a P,
    buried_at: i64,
}

impl<P> Capsule<P> {
    /// A fresh, not-yet-dug capsule buried at `buried_at` (epoch ms).
    pub fn new(payload: P, buried_at: i64) -> Self {
        Self {
            payload,
            buried_at,
            dug_out_at: 0,
            sealed: OnceCell::new(),
        }
    }
}

impl<P: Serialize> Capsule<P> {
    /// The transport string for this capsule: JSON envelope, then base64.
    ///
    /// Deterministic and idempotent — the first call computes and memoizes,
    /// every later call returns the same string. This string is the store
    /// member that identifies the capsule for removal.
    pub fn sealed(&self) -> Result<&str> {
        if let Some(sealed) = self.sealed.get() {
            return Ok(sealed);
        }

        let envelope = serde_json::to_vec(&EnvelopeRef {
            payload: &self.payload,
            buried_at: self.buried_at,
        })
        .map_err(CapsuleError::Encode)?;

        Ok(self.sealed.get_or_init(|| BASE64.encode(envelope)))
    }
}

impl<P: DeserializeOwned> Capsule<P> {
    /// Decode a transport string produced by [`Capsule::sealed`].
    ///
    /// The input is cached as this capsule's memoized transport string, so
    /// `decoded.sealed()` returns `sealed` unchanged (round-trip law).
    pub fn from_sealed(sealed: &str) -> Result<Self> {
        let raw = BASE64.decode(sealed)?;
        let envelope: Envelope<P> = serde_json::from_slice(&raw).map_err(CapsuleError::Decode)?;

        let capsule = Capsule::new(envelope.payload, envelope.buried_at);
        let _ = capsule.sealed.set(sealed.to_owned());

        Ok(capsule)
    }
}

impl<P: Clone> Clone for Capsule<P> {
    fn clone(&self) -> Self {
        Self {
            payload: self.payload.clone(),
            buried_at: self.buried_at,
            dug_out_at: self.dug_out_at,
            sealed: self.sealed.clone(),
        }
    }
}

/// Equality is structural: payload and timestamps. The memo cell is a cache,
/// not state.
impl<P: PartialEq> PartialEq for Capsule<P> {
    fn eq(&self, other: &Self) -> bool {
        self.payload == other.payload
            && self.buried_at == other.buried_at
            && self.dug_out_at == other.dug_out_at
    }
}

impl<P: Eq> Eq for Capsule<P> {}
