//! spool: bounded, theme-keyed pool of reusable UIDL transformers.

pub mod config;
pub mod error;
pub mod pool;
pub mod source;
pub mod stats;
mod sweeper;
pub mod transformer;
pub mod uidl;

pub use config::{DEFAULT_CACHE_TIME, DEFAULT_STALENESS_INTERVAL, PoolConfig};
pub use error::{ConfigError, PoolError};
pub use pool::{Checkout, DiscardReason, ReleaseOutcome, TransformerPool};
pub use source::{DirectorySource, ManualSource, ModificationSource};
pub use stats::{IdleStats, PoolStats};
pub use transformer::{Transformer, TransformerFactory, TransformerType};
pub use uidl::{UidlDocument, UidlError, UidlWriter, escape_xml};

pub use tokio_util::sync::CancellationToken;
