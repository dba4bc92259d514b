/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Namespace aggregation pipeline for the mesh overview dashboard.
//!
//! For a (possibly large, possibly changing) list of namespaces, the
//! pipeline fetches four independent facets of status from a
//! [`MeshBackend`]: health, mTLS posture, validation results and
//! traffic metrics. Each facet is fetched in fixed-size batches,
//! merged into a shared per-namespace view model as batches arrive,
//! and projected into a sorted, filtered list for the rendering layer.
//!
//! # Invariants
//!
//! - **One record per name**: a reload rebuilds the record list
//!   wholesale; duplicate names from the backend collapse to the
//!   first occurrence.
//! - **Facet independence**: a merge only writes the field of the
//!   facet that produced it. Merging the same batch twice is a no-op
//!   the second time, and merges of different facets commute.
//! - **Stale-while-revalidate**: a namespace that survives a reload
//!   keeps its previously known facet values until a fresh batch for
//!   that facet lands.
//! - **Advisory cancellation**: the namespace listing and every batch
//!   are registered under a key in an [`OperationRegistry`] owned by
//!   the pipeline. A reload or teardown cancels the tokens; cancelled
//!   operations still settle through the registry, which discards them
//!   before they touch the records.
//! - **Single owner**: the record list is owned by
//!   [`OverviewPipeline`]; every operation is a future polled by the
//!   task that owns the pipeline, so no locks guard the records and no
//!   entry point waits on the backend.
//! - **Relevant resort only**: after a merge the list is resorted
//!   only when the active sort field reads the facet just merged. A
//!   reload always sorts the rebuilt list.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # use mesh_overview::*;
//! # async fn run() -> anyhow::Result<()> {
//! let backend = Arc::new(HttpBackend::connect(
//!     "127.0.0.1:20001",
//!     None,
//!     Duration::from_secs(5),
//! )?);
//! let (mut pipeline, _alerts) = OverviewPipeline::new(backend, OverviewConfig::from_env()?);
//! pipeline.load().await?;
//! pipeline.settle_all().await;
//! for record in pipeline.visible() {
//!     println!("{}", record.name);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod client;
pub mod config;
pub mod error;
pub mod filter;
pub mod handle;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod sort;
pub mod testing;
pub mod view;

pub use backend::HealthKind;
pub use backend::MeshBackend;
pub use backend::MetricsOptions;
pub use backend::MtlsSource;
pub use backend::NamespacePatch;
pub use client::HttpBackend;
pub use config::OverviewConfig;
pub use error::ConfigError;
pub use error::OverviewError;
pub use error::TransportError;
pub use filter::FilterSet;
pub use filter::HealthFilter;
pub use filter::NamespaceFilter;
pub use handle::OverviewHandle;
pub use model::Facet;
pub use model::FacetValue;
pub use model::HealthStatus;
pub use model::MtlsState;
pub use model::NamespaceRecord;
pub use model::NamespaceSource;
pub use model::StatusBuckets;
pub use model::TimeSeries;
pub use model::ValidationSummary;
pub use pipeline::CycleState;
pub use pipeline::DisplayMode;
pub use pipeline::FacetPhase;
pub use pipeline::MergeEvent;
pub use pipeline::OverviewPipeline;
pub use pipeline::OverviewSnapshot;
pub use registry::Cancelled;
pub use registry::OperationRegistry;
pub use registry::Registered;
pub use registry::Settled;
pub use sort::SortDirection;
pub use sort::SortField;
pub use sort::SortSpec;

#[cfg(test)]
mod tests;
