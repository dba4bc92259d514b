/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! One-shot namespace overview.
//!
//! Runs a single load cycle against the dashboard REST API, waits for
//! it to settle (or for `--timeout`), and prints the sorted, filtered
//! namespace table. Backend errors are printed to stderr; a failed
//! namespace listing exits non-zero.
//!
//! ```text
//! mesh_overview --addr 127.0.0.1:20001 --sort health --direction descending
//! ```

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use clap::ValueEnum;
use mesh_overview::FilterSet;
use mesh_overview::HealthKind;
use mesh_overview::HttpBackend;
use mesh_overview::NamespaceFilter;
use mesh_overview::NamespaceRecord;
use mesh_overview::OverviewConfig;
use mesh_overview::OverviewPipeline;
use mesh_overview::SortDirection;
use mesh_overview::SortField;
use mesh_overview::pipeline::DisplayMode;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Display {
    Compact,
    Expand,
}

impl From<Display> for DisplayMode {
    fn from(display: Display) -> Self {
        match display {
            Display::Compact => DisplayMode::Compact,
            Display::Expand => DisplayMode::Expand,
        }
    }
}

/// Command-line arguments for the overview.
#[derive(Debug, Parser)]
#[command(name = "mesh_overview", about = "Namespace overview for a service mesh")]
struct Args {
    /// Dashboard address (e.g., 127.0.0.1:20001 or https://kiali.example)
    #[arg(long, short)]
    addr: String,

    /// PEM CA certificate; enables HTTPS when no scheme is given
    #[arg(long)]
    tls_ca: Option<PathBuf>,

    /// Sort field: name, health, mtls, validations or metrics
    #[arg(long, default_value_t = SortField::Name)]
    sort: SortField,

    /// Sort direction: ascending or descending
    #[arg(long, default_value = "ascending")]
    direction: SortDirection,

    /// Entity kind health is computed for (overrides the environment)
    #[arg(long)]
    health_kind: Option<HealthKind>,

    /// Namespaces per batch (overrides the environment)
    #[arg(long)]
    batch_size: Option<NonZeroUsize>,

    /// Query window, e.g. 10m (overrides the environment)
    #[arg(long)]
    duration: Option<humantime::Duration>,

    /// Only show namespaces whose name contains one of these
    #[arg(long = "name")]
    names: Vec<String>,

    /// Force a display mode instead of choosing by namespace count
    #[arg(long, value_enum)]
    display: Option<Display>,

    /// Per-request timeout
    #[arg(long, default_value = "5s")]
    request_timeout: humantime::Duration,

    /// Give up waiting for batches after this long and print what
    /// has arrived
    #[arg(long, default_value = "30s")]
    timeout: humantime::Duration,
}

fn health_cell(record: &NamespaceRecord) -> String {
    match &record.status {
        None => "-".to_string(),
        Some(status) if status.is_empty() => "no entities".to_string(),
        Some(status) => format!(
            "{} err / {} warn / {} ok",
            status.in_error.len(),
            status.in_warning.len(),
            status.in_success.len()
        ),
    }
}

fn print_table(records: &[&NamespaceRecord], total: usize, injection_label: &str) {
    println!(
        "{:<32} {:<28} {:<12} {:<14} {:<10} {:>10}",
        "NAMESPACE", "HEALTH", "MTLS", "VALIDATIONS", "INJECTION", "RPS"
    );
    for record in records {
        let mtls = record
            .tls_status
            .map_or_else(|| "-".to_string(), |s| s.to_string());
        let validations = record.validations.map_or_else(
            || "-".to_string(),
            |v| format!("{}E {}W", v.errors, v.warnings),
        );
        let rate = record.metrics.as_deref().map_or_else(
            || "-".to_string(),
            |m| format!("{:.2}", mesh_overview::model::mean_rate(m)),
        );
        let injection = if record.auto_injection(injection_label) {
            "on"
        } else {
            "off"
        };
        println!(
            "{:<32} {:<28} {:<12} {:<14} {:<10} {:>10}",
            record.name,
            health_cell(record),
            mtls,
            validations,
            injection,
            rate
        );
    }
    println!("{} of {} namespaces", records.len(), total);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = OverviewConfig::from_env().context("reading overview configuration")?;
    if let Some(kind) = args.health_kind {
        config.health_kind = kind;
    }
    if let Some(size) = args.batch_size {
        config.batch_size = size;
    }
    if let Some(duration) = args.duration {
        config.duration = duration.into();
    }

    let backend = HttpBackend::connect(
        &args.addr,
        args.tls_ca.as_deref(),
        args.request_timeout.into(),
    )
    .with_context(|| format!("connecting to {}", args.addr))?;
    let (mut pipeline, mut alerts) = OverviewPipeline::new(Arc::new(backend), config);

    pipeline.set_sort(args.sort, args.direction)?;
    if !args.names.is_empty() {
        pipeline.set_filters(FilterSet::new(vec![NamespaceFilter::NameContains(
            args.names.clone(),
        )]))?;
    }
    if let Some(display) = args.display {
        pipeline.set_display_mode(display.into())?;
    }

    pipeline.load().await.context("loading namespaces")?;
    if tokio::time::timeout(args.timeout.into(), pipeline.settle_all())
        .await
        .is_err()
    {
        tracing::warn!(timeout = %args.timeout, "giving up on outstanding batches");
        pipeline.teardown();
    }

    while let Ok(alert) = alerts.try_recv() {
        eprintln!("{}", alert);
    }
    print_table(
        &pipeline.visible(),
        pipeline.records().len(),
        &pipeline.config().injection_label,
    );
    Ok(())
}
