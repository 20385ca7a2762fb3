//! Point-in-time view of a pool, for diagnostics endpoints and logs.

use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::transformer::TransformerType;

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pool_id: Uuid,
    pub max_concurrent: usize,
    pub in_use: usize,
    pub available: usize,
    /// Transformers built since the last flush.
    pub total_created: u64,
    pub generation: u64,
    pub idle: Vec<IdleStats>,
}

impl PoolStats {
    /// All capacity checked out.
    pub fn is_busy(&self) -> bool {
        self.available == 0
    }

    pub fn spooled(&self) -> usize {
        self.idle.iter().map(|i| i.spooled).sum()
    }

    pub fn idle_for(&self, ty: &TransformerType) -> Option<&IdleStats> {
        self.idle.iter().find(|i| &i.ty == ty)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IdleStats {
    #[serde(rename = "type")]
    pub ty: TransformerType,
    pub spooled: usize,
    /// Last release (RFC 3339), absent if never released.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<String>,
}

impl IdleStats {
    pub(crate) fn new(ty: TransformerType, spooled: usize, last_used: Option<SystemTime>) -> Self {
        Self {
            ty,
            spooled,
            last_used_at: last_used
                .map(|t| DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Millis, true)),
        }
    }
}
