// crates/cli/src/main.rs
//! Cache-warming command line tool.
//!
//! Walks every cached chart (or an explicit selection) and recomputes
//! the missing and non-final cache buckets across its time scales,
//! operation fields and flagged series bindings. Meant for cron.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use dashstats_core::Interval;
use dashstats_db::{
    chart_error_message, Database, ModelRegistry, RecalculateOptions, RecalculateReport, Viewer,
};

#[derive(Parser, Debug)]
#[command(name = "dashstats", version, about = "Recalculate cached dashboard chart values")]
struct Args {
    /// SQLite database file (host data plus chart configuration).
    #[arg(long, env = "DASHSTATS_DB")]
    db: PathBuf,

    /// Model registry TOML describing the host tables.
    #[arg(long)]
    registry: PathBuf,

    /// IANA timezone charts bucket in.
    #[arg(long, default_value = "UTC")]
    timezone: String,

    /// Graph keys to recalculate; default is every cached chart.
    graph_keys: Vec<String>,

    /// Graph keys to skip, comma separated.
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,

    /// Also recompute series bindings not flagged for recalculation.
    #[arg(long)]
    all_bindings: bool,

    /// Recompute every bucket, final ones included.
    #[arg(long)]
    reload_all: bool,

    /// Report gaps without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Time scales to warm, comma separated; default is each chart's
    /// allowed intervals.
    #[arg(long, alias = "time-ranges", value_delimiter = ',')]
    time_scales: Vec<Interval>,

    /// Window length multiplier: warm `default_time_period * N` days.
    #[arg(long, default_value_t = 1)]
    periods_count: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let tz: chrono_tz::Tz = args
        .timezone
        .parse()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("invalid --timezone")?;
    let registry_toml = std::fs::read_to_string(&args.registry)
        .with_context(|| format!("reading {}", args.registry.display()))?;
    let registry = ModelRegistry::from_toml_str(&registry_toml)?;
    let db = Database::new(&args.db, registry, tz).await?;

    let options = RecalculateOptions {
        graph_keys: args.graph_keys,
        exclude: args.exclude,
        all_bindings: args.all_bindings,
        reload_all: args.reload_all,
        dry_run: args.dry_run,
        time_scales: args.time_scales,
        periods_count: args.periods_count,
        viewer: Viewer::superuser(),
    };

    let charts: Vec<_> = db
        .cached_charts()
        .await?
        .into_iter()
        .filter(|c| options.graph_keys.is_empty() || options.graph_keys.contains(&c.graph_key))
        .filter(|c| !options.exclude.contains(&c.graph_key))
        .collect();

    let bar = ProgressBar::new(charts.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );

    let mut report = RecalculateReport::default();
    for chart in &charts {
        bar.set_message(chart.graph_key.clone());
        report.charts += 1;
        if let Err(err) = db.recalculate_chart(chart, &options, &mut report).await {
            report.errors.push(chart_error_message(chart, &err));
        }
        bar.inc(1);
    }
    bar.finish_and_clear();

    if options.dry_run {
        tracing::info!(
            charts = report.charts,
            gaps = report.gaps_found,
            "dry run: nothing written"
        );
    } else {
        tracing::info!(
            charts = report.charts,
            series = report.series_recomputed,
            "cache recalculated"
        );
    }

    if !report.errors.is_empty() {
        for error in &report.errors {
            tracing::error!("{error}");
        }
        anyhow::bail!("{} chart(s) failed", report.errors.len());
    }
    Ok(())
}
