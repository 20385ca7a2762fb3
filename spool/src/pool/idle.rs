//! Per-type spool of idle transformers.

use std::time::{Duration, SystemTime};

use tokio::time::Instant;

use crate::transformer::{Transformer, TransformerType};

pub(crate) struct IdleList<T> {
    ty: TransformerType,
    spool: Vec<T>,
    /// Set on every release; `None` until the first one.
    last_used: Option<Instant>,
    last_used_at: Option<SystemTime>,
}

impl<T: Transformer> IdleList<T> {
    pub fn new(ty: TransformerType) -> Self {
        Self {
            ty,
            spool: Vec::new(),
            last_used: None,
            last_used_at: None,
        }
    }

    pub fn take(&mut self) -> Option<T> {
        self.spool.pop()
    }

    pub fn put(&mut self, transformer: T) {
        debug_assert_eq!(transformer.transformer_type(), &self.ty);
        self.spool.push(transformer);
        self.last_used = Some(Instant::now());
        self.last_used_at = Some(SystemTime::now());
    }

    pub fn len(&self) -> usize {
        self.spool.len()
    }

    pub fn last_used_at(&self) -> Option<SystemTime> {
        self.last_used_at
    }

    /// Released at least once, and not since `now - cache_time`.
    pub fn is_expired(&self, now: Instant, cache_time: Duration) -> bool {
        match self.last_used {
            Some(last) => now.saturating_duration_since(last) > cache_time,
            None => false,
        }
    }
}
