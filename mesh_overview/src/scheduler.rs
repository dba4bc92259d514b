/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Chunked facet fetches.
//!
//! The namespace list is cut into batches of at most `batch_size`
//! names, in list order. Every batch of every facet becomes one
//! chained operation in the registry, keyed `"{facet-key}/{index}"`,
//! so a reload that re-issues batch `i` supersedes the previous
//! cycle's batch `i`. Batches of one facet run concurrently with each
//! other and with the other facets; each request covers at most
//! `batch_size` namespaces.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;

use crate::backend::MeshBackend;
use crate::backend::HealthKind;
use crate::backend::MetricsOptions;
use crate::backend::REQUEST_COUNT;
use crate::error::TransportError;
use crate::model::Facet;
use crate::model::FacetValue;
use crate::model::MtlsState;
use crate::model::NamespaceRecord;
use crate::model::StatusBuckets;
use crate::registry::OperationRegistry;
use crate::registry::Registered;

/// A slice of namespace names fetched together for one facet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Batch {
    /// Position of the batch in list order.
    pub index: usize,
    pub namespaces: Vec<String>,
}

/// Iterator over the batches of a record list.
pub struct Batches<'a> {
    chunks: std::iter::Enumerate<std::slice::Chunks<'a, NamespaceRecord>>,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let (index, chunk) = self.chunks.next()?;
        Some(Batch {
            index,
            namespaces: chunk.iter().map(|r| r.name.clone()).collect(),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for Batches<'_> {}

/// Cut `records` into batches of at most `size` in list order. Only
/// the last batch may be smaller.
pub fn batches(records: &[NamespaceRecord], size: NonZeroUsize) -> Batches<'_> {
    Batches {
        chunks: records.chunks(size.get()).enumerate(),
    }
}

/// Registry key for batch `index` of `facet`.
pub fn batch_key(facet: Facet, index: usize) -> String {
    format!("{}/{}", facet.key(), index)
}

/// Everything a batch fetch needs besides the backend and the names.
#[derive(Clone, Debug)]
pub struct FetchPlan {
    pub cycle: u64,
    pub duration: Duration,
    pub health_kind: HealthKind,
    pub mesh_mtls: MtlsState,
    pub metrics: MetricsOptions,
}

/// The settled result of one batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub facet: Facet,
    pub cycle: u64,
    pub index: usize,
    pub namespaces: Vec<String>,
    pub result: Result<Vec<(String, FacetValue)>, TransportError>,
}

/// Register one chained fetch per batch of `facet` over `records`.
/// Nothing runs until the returned operations are polled.
pub fn schedule_facet(
    registry: &mut OperationRegistry,
    backend: &Arc<dyn MeshBackend>,
    plan: &FetchPlan,
    facet: Facet,
    records: &[NamespaceRecord],
    batch_size: NonZeroUsize,
) -> Vec<Registered<BatchOutcome>> {
    batches(records, batch_size)
        .map(|batch| {
            let backend = Arc::clone(backend);
            let plan = plan.clone();
            tracing::debug!(
                %facet,
                cycle = plan.cycle,
                index = batch.index,
                size = batch.namespaces.len(),
                "issuing batch"
            );
            registry.register_chained(batch_key(facet, batch.index), move || {
                fetch_batch(backend, plan, facet, batch)
            })
        })
        .collect()
}

/// Fetch one batch of one facet. Any failing call fails the whole
/// batch; siblings are unaffected.
pub async fn fetch_batch(
    backend: Arc<dyn MeshBackend>,
    plan: FetchPlan,
    facet: Facet,
    batch: Batch,
) -> BatchOutcome {
    let result = match facet {
        Facet::Health => fetch_health(backend.as_ref(), &plan, &batch.namespaces).await,
        Facet::Tls => fetch_tls(backend.as_ref(), &plan, &batch.namespaces).await,
        Facet::Validations => fetch_validations(backend.as_ref(), &batch.namespaces).await,
        Facet::Metrics => fetch_metrics(backend.as_ref(), &plan, &batch.namespaces).await,
    };
    BatchOutcome {
        facet,
        cycle: plan.cycle,
        index: batch.index,
        namespaces: batch.namespaces,
        result,
    }
}

async fn fetch_health(
    backend: &dyn MeshBackend,
    plan: &FetchPlan,
    namespaces: &[String],
) -> Result<Vec<(String, FacetValue)>, TransportError> {
    let mut health = backend
        .get_health(namespaces, plan.duration, plan.health_kind)
        .await?;
    // Keep batch order; names the backend didn't answer for are left
    // untouched.
    Ok(namespaces
        .iter()
        .filter_map(|ns| {
            let entities = health.remove(ns)?;
            Some((ns.clone(), FacetValue::Health(StatusBuckets::classify(entities))))
        })
        .collect())
}

async fn fetch_tls(
    backend: &dyn MeshBackend,
    plan: &FetchPlan,
    namespaces: &[String],
) -> Result<Vec<(String, FacetValue)>, TransportError> {
    try_join_all(namespaces.iter().map(|ns| async move {
        let source = backend.get_mtls_status(ns).await?;
        let state = MtlsState::namespace_wide(source.status, plan.mesh_mtls);
        Ok::<_, TransportError>((ns.clone(), FacetValue::Tls(state)))
    }))
    .await
}

async fn fetch_validations(
    backend: &dyn MeshBackend,
    namespaces: &[String],
) -> Result<Vec<(String, FacetValue)>, TransportError> {
    try_join_all(namespaces.iter().map(|ns| async move {
        let summary = backend.get_validations(ns).await?;
        Ok::<_, TransportError>((ns.clone(), FacetValue::Validations(summary)))
    }))
    .await
}

async fn fetch_metrics(
    backend: &dyn MeshBackend,
    plan: &FetchPlan,
    namespaces: &[String],
) -> Result<Vec<(String, FacetValue)>, TransportError> {
    try_join_all(namespaces.iter().map(|ns| async move {
        let mut metrics = backend.get_metrics(ns, &plan.metrics).await?;
        Ok::<_, TransportError>((ns.clone(), FacetValue::Metrics(metrics.remove(REQUEST_COUNT))))
    }))
    .await
}
