use std::process;
use std::sync::Arc;
use std::time::Duration;

use spool::{CancellationToken, ManualSource, PoolConfig, TransformerPool};
use spool_bench::{BenchConfig, ThemeFactory};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const BUILD_COST: Duration = Duration::from_millis(25);

#[derive(Debug, PartialEq)]
struct Args {
    workers: usize,
    renders: usize,
    themes: Vec<String>,
    max_concurrent: Option<usize>,
    cache_ms: Option<i64>,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            workers: 8,
            renders: 100,
            themes: vec!["default".to_string(), "corporate".to_string()],
            max_concurrent: None,
            cache_ms: None,
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!(
                "Usage: spool-bench [--workers N] [--renders N] [--themes a,b,c] [--max-concurrent N] [--cache-ms N]"
            );
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --workers <n>          Concurrent render tasks [default: 8]");
            eprintln!("  --renders <n>          Renders per task [default: 100]");
            eprintln!("  --themes <list>        Comma-separated themes [default: default,corporate]");
            eprintln!("  --max-concurrent <n>   Pool capacity [default: SPOOL_MAX_CONCURRENT or 1]");
            eprintln!("  --cache-ms <ms>        Idle retention, <= 0 disables sweeping");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(args) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("SPOOL_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("info") => "info",
            Ok("error") => "error",
            _ => "warn",
        };
        EnvFilter::new(format!("spool={level},spool_bench={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut out = Args::default();

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--workers" | "--renders" | "--themes" | "--max-concurrent" | "--cache-ms" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| format!("{flag} requires a value"))?;
                match flag {
                    "--workers" => out.workers = parse_number(flag, value)?,
                    "--renders" => out.renders = parse_number(flag, value)?,
                    "--max-concurrent" => out.max_concurrent = Some(parse_number(flag, value)?),
                    "--cache-ms" => out.cache_ms = Some(parse_number(flag, value)?),
                    _ => {
                        out.themes = value
                            .split(',')
                            .map(str::trim)
                            .filter(|t| !t.is_empty())
                            .map(String::from)
                            .collect();
                        if out.themes.is_empty() {
                            return Err("--themes needs at least one theme".to_string());
                        }
                    }
                }
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(out)
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("{flag}: invalid number '{value}'"))
}

#[tokio::main]
async fn run(args: Args) -> anyhow::Result<()> {
    let mut config = PoolConfig::from_env();
    if let Some(max) = args.max_concurrent {
        config = config.with_max_concurrent(max);
    }
    if let Some(ms) = args.cache_ms {
        config = config.with_cache_time_millis(ms);
    }

    let factory = args.themes.iter().fold(ThemeFactory::new(BUILD_COST), |f, theme| {
        f.with_theme(theme.as_str(), theme.to_uppercase())
    });
    let pool = TransformerPool::new(config, factory, Arc::new(ManualSource::new()))?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing in-flight renders");
            on_signal.cancel();
        }
    });

    tracing::info!(
        workers = args.workers,
        renders = args.renders,
        max_concurrent = pool.config().max_concurrent,
        "Starting bench"
    );

    let bench = BenchConfig {
        workers: args.workers,
        renders_per_worker: args.renders,
        themes: args.themes,
    };
    let report = spool_bench::run(pool.clone(), &bench, cancel).await?;
    pool.shutdown();

    println!("{}", serde_json::to_string_pretty(&report.to_json())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(rest: &[&str]) -> Vec<String> {
        std::iter::once("spool-bench")
            .chain(rest.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_without_flags() {
        assert_eq!(parse_args(&argv(&[])).unwrap(), Args::default());
    }

    #[test]
    fn parses_all_flags() {
        let args = parse_args(&argv(&[
            "--workers",
            "3",
            "--renders",
            "7",
            "--themes",
            "a, b,,c",
            "--max-concurrent",
            "2",
            "--cache-ms",
            "-1",
        ]))
        .unwrap();

        assert_eq!(
            args,
            Args {
                workers: 3,
                renders: 7,
                themes: vec!["a".into(), "b".into(), "c".into()],
                max_concurrent: Some(2),
                cache_ms: Some(-1),
            }
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(&argv(&["--workers"])).is_err());
        assert!(parse_args(&argv(&["--workers", "many"])).is_err());
        assert!(parse_args(&argv(&["--themes", ","])).is_err());
        assert!(parse_args(&argv(&["extra"])).is_err());
        assert_eq!(parse_args(&argv(&["-h"])), Err(String::new()));
    }
}
