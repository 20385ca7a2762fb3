//! Transformer seam: the pooled worker, its type key, and the factory that builds it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Identity of a transformer configuration.
///
/// Two types are the same idle-list key when theme and variant are equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransformerType {
    theme: Arc<str>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    variant: Option<Arc<str>>,
}

impl TransformerType {
    pub fn new(theme: impl Into<Arc<str>>) -> Self {
        Self {
            theme: theme.into(),
            variant: None,
        }
    }

    /// Same theme, specialised (e.g. for a browser family).
    pub fn with_variant(mut self, variant: impl Into<Arc<str>>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    pub fn theme(&self) -> &str {
        &self.theme
    }

    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }
}

impl fmt::Display for TransformerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(variant) => write!(f, "{}/{}", self.theme, variant),
            None => f.write_str(&self.theme),
        }
    }
}

impl From<&str> for TransformerType {
    fn from(theme: &str) -> Self {
        Self::new(theme)
    }
}

/// A stateful rendering worker. Expensive to build, cheap to reset.
pub trait Transformer: Send + 'static {
    /// The key this instance was built for. Must not change over its lifetime.
    fn transformer_type(&self) -> &TransformerType;

    /// Restore the instance to a state where the next caller observes nothing
    /// of the previous use.
    fn reset(&mut self) -> anyhow::Result<()>;
}

/// Builds transformers on demand for the pool.
#[async_trait]
pub trait TransformerFactory: Send + Sync + 'static {
    type Transformer: Transformer;

    async fn create(&self, ty: &TransformerType) -> anyhow::Result<Self::Transformer>;
}
