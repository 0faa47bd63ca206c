//! The store capability and the capsule lifecycle protocol.
//!
//! [`Store`] is the interface producers and diggers program against.
//! [`CapsuleStore`] implements it once — the bury/dig/destroy state machine
//! lives here — over a pluggable [`Backend`] that exposes the five sorted-set
//! primitives of the underlying transport.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::capsule::{now_millis, Capsule};
use crate::error::{CapsuleError, Result};
use crate::retry::{retry_fixed, RetryPolicy};

/// The five primitives a sorted, score-addressable transport must provide.
///
/// Members are strings; scores are due-times in epoch milliseconds. `insert`
/// is insert-or-update on the member. `pop_min` is the one operation the
/// transport must make atomic: a popped entry is observed by exactly one
/// caller.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Which transport this is. Diagnostic only.
    fn kind(&self) -> &'static str;

    /// Insert `member` at `score`, replacing any existing entry for the
    /// same member.
    async fn insert(&self, score: i64, member: &str) -> Result<()>;

    /// Whether any entry exists with score in `[0, max_score]`.
    async fn any_due(&self, max_score: i64) -> Result<bool>;

    /// Atomically remove and return the lowest-scored entry, if any.
    async fn pop_min(&self) -> Result<Option<(i64, String)>>;

    /// Remove `member` regardless of score. Removing an absent member is a
    /// no-op success.
    async fn remove(&self, member: &str) -> Result<()>;

    /// Remove every entry.
    async fn clear(&self) -> Result<()>;
}

/// The capability interface over a capsule store, parametric over the
/// payload type. Payloads plug in their serializer through serde.
#[async_trait]
pub trait Store<P>: Send + Sync {
    /// Which backend adapter is active. Diagnostic only.
    fn kind(&self) -> &'static str;

    /// Bury `payload` so it comes due `delay` from now.
    async fn bury_for(&self, payload: P, delay: Duration) -> Result<()>;

    /// Bury `payload` so it comes due at `due_at_ms` (epoch milliseconds).
    ///
    /// Every call creates a distinct entry: the fresh capsule's `buried_at`
    /// keeps even identical payloads from colliding as members.
    async fn bury_until(&self, payload: P, due_at_ms: i64) -> Result<()>;

    /// Pop the earliest due capsule, if any.
    ///
    /// Returns `Ok(None)` when nothing is due, when the pop loses a race to
    /// another digger, or when a prematurely popped entry was requeued.
    /// A capsule that fails to decode is an error and is not reinserted.
    async fn dig(&self) -> Result<Option<Capsule<P>>>;

    /// Remove `capsule`'s entry from the store. Idempotent: destroying an
    /// already-absent capsule succeeds.
    async fn destroy(&self, capsule: &Capsule<P>) -> Result<()>;

    /// Remove every entry under this store's key. Bulk teardown, not part
    /// of the steady-state protocol.
    async fn destroy_all(&self) -> Result<()>;
}

/// [`Store`] implemented over any [`Backend`].
///
/// Dig is a two-phase check-then-pop: the cheap due-probe runs every poll
/// tick, and the atomic pop only when something looked due. The probe and
/// the pop are two separate transport commands, so the popped entry can turn
/// out not to be due yet — that premature pop is requeued at its original
/// score under `requeue`, never re-scored to now.
pub struct CapsuleStore<P, B> {
    backend: B,
    requeue: RetryPolicy,
    _payload: PhantomData<fn() -> P>,
}

impl<P, B: Backend> CapsuleStore<P, B> {
    /// A store over `backend` with the default requeue policy
    /// (100 attempts, 10 ms apart).
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            requeue: RetryPolicy::default(),
            _payload: PhantomData,
        }
    }

    /// Override the bounded retry used to reinsert premature pops.
    pub fn with_requeue_policy(mut self, policy: RetryPolicy) -> Self {
        self.requeue = policy;
        self
    }

    /// The underlying transport, e.g. for diagnostics in tests.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}

#[async_trait]
impl<P, B> Store<P> for CapsuleStore<P, B>
where
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
    B: Backend,
{
    fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    async fn bury_for(&self, payload: P, delay: Duration) -> Result<()> {
        let due_at_ms = now_millis() + delay.as_millis() as i64;
        self.bury_until(payload, due_at_ms).await
    }

    async fn bury_until(&self, payload: P, due_at_ms: i64) -> Result<()> {
        let capsule = Capsule::new(payload, now_millis());
        let member = capsule.sealed()?;
        self.backend.insert(due_at_ms, member).await?;
        debug!(backend = self.backend.kind(), due_at_ms, "buried a capsule");
        Ok(())
    }

    async fn dig(&self) -> Result<Option<Capsule<P>>> {
        let now = now_millis();

        // Cheap existence probe — the common path on an idle queue.
        if !self.backend.any_due(now).await? {
            return Ok(None);
        }

        let Some((score, member)) = self.backend.pop_min().await? else {
            // Another digger won the pop between our probe and our pop.
            return Ok(None);
        };

        if score > now {
            // Premature pop: the probe and the pop are separate commands, so
            // the lowest entry can be one that was not due when the probe
            // ran. Put it back at its original score.
            warn!(
                backend = self.backend.kind(),
                score, now, "premature pop; requeueing at the original score"
            );
            return match retry_fixed(self.requeue, || self.backend.insert(score, &member)).await {
                Ok(()) => Ok(None),
                Err(last) => Err(CapsuleError::RequeueExhausted {
                    attempts: self.requeue.attempts.max(1),
                    last: Box::new(last),
                }),
            };
        }

        let mut capsule = Capsule::from_sealed(&member)?;
        capsule.dug_out_at = now;
        Ok(Some(capsule))
    }

    async fn destroy(&self, capsule: &Capsule<P>) -> Result<()> {
        let member = capsule.sealed()?;
        self.backend.remove(member).await
    }

    async fn destroy_all(&self) -> Result<()> {
        self.backend.clear().await
    }
}
