//! `timecapsule-core` — capsule envelope, codec, and the store capability.
//!
//! # Overview
//!
//! A producer buries a payload with a future due-time; the payload travels as
//! a [`Capsule`] — a small envelope carrying the payload plus its burial
//! timestamp, serialized to a printable transport string. Capsules live in a
//! sorted, score-addressable store (score = due-time in epoch milliseconds)
//! behind the [`Store`] capability trait, implemented once by
//! [`CapsuleStore`] over pluggable [`Backend`] transports:
//!
//! | Backend                | Transport                                   |
//! |------------------------|---------------------------------------------|
//! | [`MemoryBackend`]      | In-process sorted set (hermetic, testable)  |
//! | `RedisBackend`         | Redis sorted set (`timecapsule-redis`)      |
//!
//! The polling engine that digs capsules up lives in `timecapsule-digger`.

pub mod capsule;
pub mod error;
pub mod memory;
pub mod retry;
pub mod store;

pub use capsule::{now_millis, Capsule};
pub use error::{CapsuleError, Result};
pub use memory::{MemoryBackend, MemoryStore};
pub use retry::RetryPolicy;
pub use store::{Backend, CapsuleStore, Store};
