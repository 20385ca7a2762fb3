//! spool-bench: a theme transformer and a concurrent render driver for the spool pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use spool::{
    CancellationToken, PoolStats, Transformer, TransformerFactory, TransformerPool,
    TransformerType, UidlDocument, UidlWriter,
};
use tokio::time::Instant;

/// Renders UIDL documents with a theme's header and footer.
pub struct ThemeTransformer {
    ty: TransformerType,
    header: String,
    footer: String,
    renders: u32,
}

impl ThemeTransformer {
    pub fn render(&mut self, doc: &UidlDocument) -> anyhow::Result<String> {
        if doc.theme() != self.ty.theme() {
            anyhow::bail!(
                "document painted for theme '{}' handed to '{}' transformer",
                doc.theme(),
                self.ty
            );
        }
        self.renders += 1;

        let body = doc.as_str();
        let body = body
            .split_once("?>")
            .map(|(_, rest)| rest.trim_start())
            .unwrap_or(body);

        Ok(format!("{}{}{}", self.header, body, self.footer))
    }

    /// Renders since the last reset.
    pub fn renders(&self) -> u32 {
        self.renders
    }
}

impl Transformer for ThemeTransformer {
    fn transformer_type(&self) -> &TransformerType {
        &self.ty
    }

    fn reset(&mut self) -> anyhow::Result<()> {
        self.renders = 0;
        Ok(())
    }
}

/// Builds [`ThemeTransformer`]s from an in-memory theme table, paying a fixed
/// build cost per instance.
pub struct ThemeFactory {
    themes: HashMap<String, String>,
    build_cost: Duration,
    built: AtomicU64,
}

impl ThemeFactory {
    pub fn new(build_cost: Duration) -> Self {
        Self {
            themes: HashMap::new(),
            build_cost,
            built: AtomicU64::new(0),
        }
    }

    pub fn with_theme(mut self, name: impl Into<String>, title: impl Into<String>) -> Self {
        self.themes.insert(name.into(), title.into());
        self
    }

    pub fn built(&self) -> u64 {
        self.built.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TransformerFactory for ThemeFactory {
    type Transformer = ThemeTransformer;

    async fn create(&self, ty: &TransformerType) -> anyhow::Result<ThemeTransformer> {
        let title = self
            .themes
            .get(ty.theme())
            .ok_or_else(|| anyhow::anyhow!("unknown theme '{}'", ty.theme()))?;

        if !self.build_cost.is_zero() {
            tokio::time::sleep(self.build_cost).await;
        }
        self.built.fetch_add(1, Ordering::Relaxed);

        Ok(ThemeTransformer {
            ty: ty.clone(),
            header: format!("<html><head><title>{}</title></head><body>", spool::escape_xml(title)),
            footer: "</body></html>".to_string(),
            renders: 0,
        })
    }
}

/// Paint a small window for `theme`.
pub fn sample_document(theme: &str, request: usize) -> Result<UidlDocument, spool::UidlError> {
    let mut w = UidlWriter::new(theme);
    w.start_tag("window")?;
    w.add_attribute("caption", "spool bench")?;
    w.add_attribute_int("request", request as i64)?;
    w.add_section("label", "Rendering <pooled> transformers")?;
    w.start_tag("debug")?;
    w.add_attribute_bool("invisible", request % 2 == 0)?;
    w.add_text("odd request")?;
    w.end_tag("debug")?;
    w.add_string_variable("filter", "")?;
    w.add_bool_variable("dirty", false)?;
    w.end_tag("window")?;
    w.close()
}

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub workers: usize,
    pub renders_per_worker: usize,
    pub themes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BenchReport {
    pub renders: u64,
    pub recycled: u64,
    pub discarded: u64,
    pub elapsed: Duration,
    pub stats: PoolStats,
}

impl BenchReport {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "renders": self.renders,
            "recycled": self.recycled,
            "discarded": self.discarded,
            "elapsed_ms": self.elapsed.as_millis() as u64,
            "pool": self.stats,
        })
    }
}

/// Run `workers` tasks rendering round-robin across `themes`.
///
/// Stops early when `cancel` fires; renders completed so far are reported.
pub async fn run(
    pool: TransformerPool<ThemeFactory>,
    config: &BenchConfig,
    cancel: CancellationToken,
) -> anyhow::Result<BenchReport> {
    if config.themes.is_empty() {
        anyhow::bail!("no themes to render");
    }

    let started = Instant::now();
    let renders = Arc::new(AtomicU64::new(0));
    let recycled = Arc::new(AtomicU64::new(0));
    let themes: Arc<[TransformerType]> = config
        .themes
        .iter()
        .map(|t| TransformerType::new(t.as_str()))
        .collect();

    let tasks: Vec<_> = (0..config.workers)
        .map(|worker| {
            let pool = pool.clone();
            let cancel = cancel.clone();
            let themes = Arc::clone(&themes);
            let renders = Arc::clone(&renders);
            let recycled = Arc::clone(&recycled);
            let count = config.renders_per_worker;

            tokio::spawn(async move {
                for i in 0..count {
                    let request = worker * count + i;
                    let ty = &themes[request % themes.len()];

                    let Some(mut transformer) = pool.acquire(ty, &cancel).await? else {
                        tracing::debug!(worker, "Render cancelled");
                        break;
                    };
                    let doc = sample_document(ty.theme(), request)?;
                    let html = transformer.render(&doc)?;
                    tracing::trace!(worker, request, bytes = html.len(), "Rendered");

                    renders.fetch_add(1, Ordering::Relaxed);
                    if transformer.release().is_recycled() {
                        recycled.fetch_add(1, Ordering::Relaxed);
                    }
                }
                anyhow::Ok(())
            })
        })
        .collect();

    for result in futures::future::join_all(tasks).await {
        result??;
    }

    let renders = renders.load(Ordering::Relaxed);
    let recycled = recycled.load(Ordering::Relaxed);
    Ok(BenchReport {
        renders,
        recycled,
        discarded: renders - recycled,
        elapsed: started.elapsed(),
        stats: pool.stats(),
    })
}
