//! Checked-out transformers and what happens to them on release.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;

use super::Shared;
use crate::transformer::{Transformer, TransformerFactory, TransformerType};

/// Where a released transformer ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Reset and back in its type's idle list.
    Recycled,
    /// Dropped. Capacity was returned all the same.
    Discarded(DiscardReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The type's idle list was swept while checked out.
    Evicted,
    /// The pool was shut down.
    Closed,
    /// Issued before a staleness flush.
    Stale,
    /// `reset()` failed; the instance is not trusted for reuse.
    ResetFailed,
    /// Released through a pool other than the one that issued it.
    Foreign,
    /// Dropped without an explicit release.
    Abandoned,
}

impl ReleaseOutcome {
    pub fn is_recycled(&self) -> bool {
        matches!(self, ReleaseOutcome::Recycled)
    }
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiscardReason::Evicted => "evicted",
            DiscardReason::Closed => "pool closed",
            DiscardReason::Stale => "stale",
            DiscardReason::ResetFailed => "reset failed",
            DiscardReason::Foreign => "foreign",
            DiscardReason::Abandoned => "abandoned",
        })
    }
}

/// Exclusive handle on a pooled transformer.
///
/// Holds one unit of pool capacity until released. Dropping it without
/// [`Checkout::release`] returns the capacity but discards the transformer.
pub struct Checkout<F: TransformerFactory> {
    transformer: Option<F::Transformer>,
    ty: TransformerType,
    generation: u64,
    reused: bool,
    /// Still included in the pool's `in_use` count.
    counted: bool,
    shared: Arc<Shared<F>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl<F: TransformerFactory> Checkout<F> {
    pub(super) fn new(
        transformer: F::Transformer,
        generation: u64,
        reused: bool,
        shared: Arc<Shared<F>>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            ty: transformer.transformer_type().clone(),
            transformer: Some(transformer),
            generation,
            reused,
            counted: true,
            shared,
            permit: Some(permit),
        }
    }

    pub fn transformer_type(&self) -> &TransformerType {
        &self.ty
    }

    /// `true` when served from the idle list rather than freshly built.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub(super) fn pool_id(&self) -> uuid::Uuid {
        self.shared.id
    }

    /// Hand the transformer back to the pool that issued it.
    pub fn release(mut self) -> ReleaseOutcome {
        self.give_back(false)
    }

    pub(super) fn release_foreign(mut self) -> ReleaseOutcome {
        self.give_back(true)
    }

    fn give_back(&mut self, foreign: bool) -> ReleaseOutcome {
        let Some(mut transformer) = self.transformer.take() else {
            return ReleaseOutcome::Discarded(DiscardReason::Abandoned);
        };
        // If `reset()` unwinds, `Drop` still settles the in-use count.
        let reset = if foreign {
            None
        } else {
            Some(transformer.reset())
        };
        self.counted = false;
        let outcome = self.shared.check_in(transformer, self.generation, reset);
        // Capacity goes back only after the in-use count was decremented.
        drop(self.permit.take());
        outcome
    }
}

impl<F: TransformerFactory> Deref for Checkout<F> {
    type Target = F::Transformer;

    fn deref(&self) -> &Self::Target {
        // Only `give_back` takes the transformer, and it consumes the checkout.
        self.transformer
            .as_ref()
            .unwrap_or_else(|| unreachable!("checkout already released"))
    }
}

impl<F: TransformerFactory> DerefMut for Checkout<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.transformer
            .as_mut()
            .unwrap_or_else(|| unreachable!("checkout already released"))
    }
}

impl<F: TransformerFactory> fmt::Debug for Checkout<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkout")
            .field("type", &self.ty)
            .field("generation", &self.generation)
            .field("reused", &self.reused)
            .finish_non_exhaustive()
    }
}

impl<F: TransformerFactory> Drop for Checkout<F> {
    fn drop(&mut self) {
        if let Some(transformer) = self.transformer.take() {
            tracing::error!(theme = %self.ty, "Checkout dropped without release - discarding transformer");
            drop(transformer);
        }
        if self.counted {
            self.counted = false;
            self.shared.abandon();
        }
        drop(self.permit.take());
    }
}
