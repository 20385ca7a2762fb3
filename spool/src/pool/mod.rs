//! Transformer pool: bounded checkout of type-keyed, reusable transformers.
//!
//! Capacity is a semaphore with `max_concurrent` permits; each [`Checkout`]
//! owns one. Everything else (idle lists, counters, staleness bookkeeping)
//! lives in one `SpoolState` behind one mutex that is never held across an
//! await point.
//!
//! Flow:
//! 1. Wait for a permit (or cancellation)
//! 2. Throttled staleness check, flushing every idle list if the source moved
//! 3. Pop an idle instance, or build one through the factory outside the lock
//! 4. On release: `reset()`, back into the idle list, permit dropped

mod checkout;
mod idle;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::SystemTime;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use checkout::{Checkout, DiscardReason, ReleaseOutcome};
use idle::IdleList;

use crate::config::PoolConfig;
use crate::error::{ConfigError, PoolError, Result};
use crate::source::ModificationSource;
use crate::stats::{IdleStats, PoolStats};
use crate::sweeper::{Sweep, Sweeper};
use crate::transformer::{Transformer, TransformerFactory, TransformerType};

struct SpoolState<T> {
    lists: HashMap<TransformerType, IdleList<T>>,
    total_created: u64,
    in_use: usize,
    /// Bumped on every flush. Checkouts from an older generation are not recycled.
    generation: u64,
    last_staleness_check: Option<Instant>,
    source_modified_seen: Option<SystemTime>,
}

impl<T: Transformer> SpoolState<T> {
    fn flush(&mut self) -> usize {
        let dropped = self.lists.len();
        self.lists.clear();
        self.total_created = 0;
        self.generation += 1;
        dropped
    }
}

pub(crate) struct Shared<F: TransformerFactory> {
    id: Uuid,
    config: PoolConfig,
    factory: F,
    source: Arc<dyn ModificationSource>,
    capacity: Arc<Semaphore>,
    state: Mutex<SpoolState<F::Transformer>>,
    sweeper: Option<Sweeper>,
}

impl<F: TransformerFactory> Shared<F> {
    fn lock_state(&self) -> MutexGuard<'_, SpoolState<F::Transformer>> {
        // Every critical section leaves the counters consistent before any
        // call that could panic, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Pool state mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }

    /// Claim the staleness check if the interval has passed since the last one.
    ///
    /// The caller then reads the source without holding the lock and hands the
    /// result to [`apply_modified`](Self::apply_modified).
    fn claim_staleness_check(&self, state: &mut SpoolState<F::Transformer>) -> bool {
        let now = Instant::now();
        if let Some(last) = state.last_staleness_check
            && now.saturating_duration_since(last) < self.config.staleness_interval
        {
            return false;
        }
        state.last_staleness_check = Some(now);
        true
    }

    fn apply_modified(&self, state: &mut SpoolState<F::Transformer>, modified: Option<SystemTime>) {
        if modified > state.source_modified_seen {
            let dropped = state.flush();
            tracing::info!(
                generation = state.generation,
                idle_lists = dropped,
                "Theme source modified - flushed transformer spool"
            );
            state.source_modified_seen = modified;
        }
    }

    /// Settle a released transformer. `reset` is `None` for a foreign checkout.
    fn check_in(
        &self,
        transformer: F::Transformer,
        generation: u64,
        reset: Option<anyhow::Result<()>>,
    ) -> ReleaseOutcome {
        let ty = transformer.transformer_type().clone();

        let mut state = self.lock_state();
        state.in_use = state.in_use.saturating_sub(1);
        let in_use = state.in_use;

        let reason = match reset {
            None => Some(DiscardReason::Foreign),
            Some(Err(e)) => {
                tracing::warn!(theme = %ty, error = %e, "Transformer reset failed - discarding");
                Some(DiscardReason::ResetFailed)
            }
            Some(Ok(())) if self.capacity.is_closed() => Some(DiscardReason::Closed),
            Some(Ok(())) if generation != state.generation => Some(DiscardReason::Stale),
            Some(Ok(())) => None,
        };

        if let Some(reason) = reason {
            tracing::info!(theme = %ty, in_use, %reason, "Released transformer discarded");
            return ReleaseOutcome::Discarded(reason);
        }

        match state.lists.get_mut(&ty) {
            Some(list) => {
                list.put(transformer);
                tracing::debug!(theme = %ty, in_use, spooled = list.len(), "Released transformer");
                ReleaseOutcome::Recycled
            }
            None => {
                tracing::info!(theme = %ty, in_use, "Released transformer of evicted type - ignoring");
                ReleaseOutcome::Discarded(DiscardReason::Evicted)
            }
        }
    }

    fn abandon(&self) {
        let mut state = self.lock_state();
        state.in_use = state.in_use.saturating_sub(1);
    }

    fn evict_unused(&self) -> usize {
        let cache_time = self.config.cache_time;
        if cache_time.is_zero() {
            return 0;
        }

        let now = Instant::now();
        let mut state = self.lock_state();
        let before = state.lists.len();
        state.lists.retain(|ty, list| {
            let expired = list.is_expired(now, cache_time);
            if expired {
                tracing::info!(
                    theme = %ty,
                    spooled = list.len(),
                    last_used = ?list.last_used_at(),
                    "Removed unused transformers"
                );
            }
            !expired
        });
        before - state.lists.len()
    }
}

impl<F: TransformerFactory> Sweep for Shared<F> {
    fn sweep(&self) -> usize {
        self.evict_unused()
    }
}

/// One unit of capacity counted in `in_use` but not yet handed to a caller.
///
/// Dropped on construction failure or when the acquiring future is dropped
/// mid-construction; either way the count and the permit go back.
struct Reservation<'a, F: TransformerFactory> {
    shared: &'a Shared<F>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<F: TransformerFactory> Reservation<'_, F> {
    fn commit(mut self) -> OwnedSemaphorePermit {
        self.permit
            .take()
            .unwrap_or_else(|| unreachable!("reservation committed twice"))
    }
}

impl<F: TransformerFactory> Drop for Reservation<'_, F> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.shared.abandon();
            drop(permit);
        }
    }
}

/// Pool of transformers keyed by [`TransformerType`].
///
/// Cheap to clone; clones share the same spool and capacity.
pub struct TransformerPool<F: TransformerFactory> {
    shared: Arc<Shared<F>>,
}

impl<F: TransformerFactory> Clone for TransformerPool<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: TransformerFactory> TransformerPool<F> {
    /// Build a pool. Spawns the sweeper when `config.cache_time` is non-zero,
    /// which requires a running tokio runtime.
    pub fn new(
        config: PoolConfig,
        factory: F,
        source: Arc<dyn ModificationSource>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let seen = source.modified();
        let mut sweeper_err = None;

        let shared = Arc::new_cyclic(|weak: &Weak<Shared<F>>| {
            let sweeper = if config.sweeping_enabled() {
                let target: Weak<dyn Sweep> = weak.clone();
                match Sweeper::spawn(target, config.cache_time) {
                    Ok(s) => Some(s),
                    Err(e) => {
                        sweeper_err = Some(e);
                        None
                    }
                }
            } else {
                None
            };

            Shared {
                id: Uuid::new_v4(),
                capacity: Arc::new(Semaphore::new(config.max_concurrent)),
                config,
                factory,
                source,
                state: Mutex::new(SpoolState {
                    lists: HashMap::new(),
                    total_created: 0,
                    in_use: 0,
                    generation: 0,
                    last_staleness_check: None,
                    source_modified_seen: seen,
                }),
                sweeper,
            }
        });

        if let Some(e) = sweeper_err {
            return Err(e);
        }

        tracing::debug!(
            pool = %shared.id,
            max_concurrent = shared.config.max_concurrent,
            cache_time = ?shared.config.cache_time,
            "Transformer pool created"
        );

        Ok(Self { shared })
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn factory(&self) -> &F {
        &self.shared.factory
    }

    /// Check out a transformer of type `ty`, waiting while the pool is at capacity.
    ///
    /// Returns `Ok(None)` if `cancel` fires before capacity frees up; nothing
    /// about the pool changes in that case.
    pub async fn acquire(
        &self,
        ty: &TransformerType,
        cancel: &CancellationToken,
    ) -> Result<Option<Checkout<F>>> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(theme = %ty, "Acquire cancelled while waiting for capacity");
                return Ok(None);
            }
            permit = Arc::clone(&self.shared.capacity).acquire_owned() => {
                permit.map_err(|_| PoolError::Closed)?
            }
        };

        self.checkout(ty, permit).await.map(Some)
    }

    /// Like [`acquire`](Self::acquire) but fails with `AtCapacity` instead of waiting.
    pub async fn try_acquire(&self, ty: &TransformerType) -> Result<Checkout<F>> {
        let permit = match Arc::clone(&self.shared.capacity).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                return Err(PoolError::AtCapacity {
                    max: self.shared.config.max_concurrent,
                });
            }
            Err(TryAcquireError::Closed) => return Err(PoolError::Closed),
        };

        self.checkout(ty, permit).await
    }

    async fn checkout(
        &self,
        ty: &TransformerType,
        permit: OwnedSemaphorePermit,
    ) -> Result<Checkout<F>> {
        let poll_source = {
            let mut state = self.shared.lock_state();
            state.in_use += 1;
            debug_assert!(state.in_use <= self.shared.config.max_concurrent);
            self.shared.claim_staleness_check(&mut state)
        };
        let reservation = Reservation {
            shared: &self.shared,
            permit: Some(permit),
        };

        // Sources may touch the filesystem; never read one under the state lock.
        let modified = poll_source.then(|| self.shared.source.modified());

        let (spooled, generation) = {
            let mut state = self.shared.lock_state();
            if let Some(modified) = modified {
                self.shared.apply_modified(&mut state, modified);
            }
            let spooled = state.lists.get_mut(ty).and_then(|list| list.take());
            (spooled, state.generation)
        };

        if let Some(transformer) = spooled {
            tracing::debug!(theme = %ty, "Reserved existing transformer");
            return Ok(Checkout::new(
                transformer,
                generation,
                true,
                Arc::clone(&self.shared),
                reservation.commit(),
            ));
        }

        match self.shared.factory.create(ty).await {
            Ok(transformer) => {
                let mut state = self.shared.lock_state();
                state.total_created += 1;
                let created = state.total_created;
                // A pool shut down mid-construction keeps no idle lists.
                if !self.shared.capacity.is_closed() && !state.lists.contains_key(ty) {
                    state.lists.insert(ty.clone(), IdleList::new(ty.clone()));
                    tracing::debug!(theme = %ty, "Created new transformer type");
                }
                drop(state);

                tracing::info!(theme = %ty, created, "Created new transformer");
                Ok(Checkout::new(
                    transformer,
                    generation,
                    false,
                    Arc::clone(&self.shared),
                    reservation.commit(),
                ))
            }
            Err(source) => {
                drop(reservation);
                tracing::error!(theme = %ty, error = %source, "Transformer construction failed");
                Err(PoolError::Construction {
                    ty: ty.clone(),
                    source,
                })
            }
        }
    }

    /// Return a checkout to the pool. Equivalent to [`Checkout::release`], except
    /// that a checkout issued by a different pool is discarded as foreign.
    pub fn release(&self, checkout: Checkout<F>) -> ReleaseOutcome {
        if checkout.pool_id() != self.shared.id {
            tracing::warn!(
                theme = %checkout.transformer_type(),
                pool = %self.shared.id,
                "Tried to release transformer from another pool - discarding"
            );
            return checkout.release_foreign();
        }
        checkout.release()
    }

    /// Drop every idle list, as if the modification source had moved.
    pub fn flush(&self) {
        let mut state = self.shared.lock_state();
        let dropped = state.flush();
        tracing::info!(
            generation = state.generation,
            idle_lists = dropped,
            "Flushed transformer spool"
        );
    }

    /// One sweep pass. Returns the number of idle lists removed.
    pub fn evict_unused(&self) -> usize {
        self.shared.evict_unused()
    }

    /// Stop the sweeper, drop idle transformers, and refuse further acquires.
    ///
    /// Outstanding checkouts, including ones still under construction, can be
    /// released; they are discarded as [`DiscardReason::Closed`].
    pub fn shutdown(&self) {
        if let Some(ref sweeper) = self.shared.sweeper {
            sweeper.stop();
        }
        self.shared.capacity.close();
        let mut state = self.shared.lock_state();
        state.lists.clear();
        tracing::info!(pool = %self.shared.id, in_use = state.in_use, "Transformer pool shut down");
    }

    /// `true` while the background sweeper task is alive.
    pub fn is_sweeping(&self) -> bool {
        self.shared
            .sweeper
            .as_ref()
            .is_some_and(|sweeper| !sweeper.is_finished())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.capacity.is_closed()
    }

    pub fn in_use(&self) -> usize {
        self.shared.lock_state().in_use
    }

    pub fn available(&self) -> usize {
        self.shared.capacity.available_permits()
    }

    pub fn total_created(&self) -> u64 {
        self.shared.lock_state().total_created
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock_state();
        let mut idle: Vec<IdleStats> = state
            .lists
            .iter()
            .map(|(ty, list)| IdleStats::new(ty.clone(), list.len(), list.last_used_at()))
            .collect();
        idle.sort_by(|a, b| a.ty.cmp(&b.ty));

        PoolStats {
            pool_id: self.shared.id,
            max_concurrent: self.shared.config.max_concurrent,
            in_use: state.in_use,
            available: self.shared.config.max_concurrent.saturating_sub(state.in_use),
            total_created: state.total_created,
            generation: state.generation,
            idle,
        }
    }
}

#[cfg(test)]
mod tests;
