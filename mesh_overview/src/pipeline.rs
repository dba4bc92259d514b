/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The load cycle.
//!
//! [`OverviewPipeline`] owns the registry, the view model and every
//! in-flight operation. A cycle starts with [`reload`], which cancels
//! whatever the previous cycle left pending and issues the namespace
//! listing without waiting for it. Operations are driven by
//! [`next_event`] (or [`settle_all`]) on the owning task: each settled
//! operation goes through the registry, and only live results reach
//! the view. When the listing lands the records are rebuilt and one
//! batch per chunk per facet is scheduled.
//!
//! Namespace updates ([`set_auto_injection`]) ride along in the same
//! set but outlive reloads; a successful update starts a new cycle.
//!
//! ```text
//! Idle -> FetchingNamespaces -> Merging -> Stable
//!   ^                                        |
//!   +------------- cancel_all / teardown ----+
//! ```
//!
//! [`reload`]: OverviewPipeline::reload
//! [`next_event`]: OverviewPipeline::next_event
//! [`settle_all`]: OverviewPipeline::settle_all
//! [`set_auto_injection`]: OverviewPipeline::set_auto_injection

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use futures::FutureExt;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::watch;

use crate::backend::HealthKind;
use crate::backend::MeshBackend;
use crate::backend::NamespacePatch;
use crate::config::OverviewConfig;
use crate::error::OverviewError;
use crate::error::TransportError;
use crate::filter::FilterSet;
use crate::model::Facet;
use crate::model::NamespaceRecord;
use crate::model::NamespaceSource;
use crate::registry::Cancelled;
use crate::registry::OperationRegistry;
use crate::registry::Registered;
use crate::registry::Settled;
use crate::scheduler::BatchOutcome;
use crate::scheduler::FetchPlan;
use crate::scheduler::schedule_facet;
use crate::sort::SortDirection;
use crate::sort::SortField;
use crate::sort::SortSpec;
use crate::sort::natural_name_cmp;
use crate::view::NamespaceView;

/// Registry key of the namespace listing.
pub const NAMESPACES_KEY: &str = "namespaces";

/// Registry key prefix of namespace updates.
pub const UPDATE_KEY: &str = "update-namespace";

const NAMESPACES_CONTEXT: &str = "Could not fetch namespaces";

fn update_key(namespace: &str) -> String {
    format!("{}/{}", UPDATE_KEY, namespace)
}

fn is_update_key(key: &str) -> bool {
    key.strip_prefix(UPDATE_KEY)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Where the current load cycle is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CycleState {
    #[default]
    Idle,
    FetchingNamespaces,
    /// At least one facet still has batches outstanding.
    Merging,
    /// Every batch of the cycle has settled.
    Stable,
}

/// Progress of one facet within the current cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FacetPhase {
    /// Scheduled; no batch has settled yet.
    Pending,
    /// Some batches have settled.
    PartiallyMerged,
    /// Every batch has settled, successfully or not.
    Complete,
}

/// How much detail the overview shows. Metrics are only fetched in
/// [`DisplayMode::Expand`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisplayMode {
    Compact,
    #[default]
    Expand,
}

/// What happened when one in-flight operation settled.
#[derive(Clone, Debug, PartialEq)]
pub enum MergeEvent {
    /// The current cycle's listing landed: the records were rebuilt
    /// and batches scheduled.
    Listed { namespaces: usize },
    /// The current cycle's listing failed; the previous records stay.
    ListingFailed { error: OverviewError },
    /// A live batch was merged into the view.
    Merged {
        facet: Facet,
        index: usize,
        /// The merge reordered the list.
        resorted: bool,
    },
    /// A live batch failed; the facet keeps its previous values for
    /// the batch's namespaces.
    Failed {
        facet: Facet,
        index: usize,
        error: OverviewError,
    },
    /// A namespace patch was applied and a reload started.
    Updated { namespace: String },
    /// A namespace patch failed.
    UpdateFailed {
        namespace: String,
        error: OverviewError,
    },
    /// A cancelled operation settled and was dropped.
    Discarded { key: String },
}

/// What consumers of the pipeline observe.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OverviewSnapshot {
    /// Filtered records, in display order.
    pub records: Vec<NamespaceRecord>,
    /// Number of records before filtering.
    pub total: usize,
    pub sort: SortSpec,
    pub filters: FilterSet,
    pub state: CycleState,
    pub facets: BTreeMap<Facet, FacetPhase>,
    pub display_mode: DisplayMode,
    pub cycle: u64,
}

#[derive(Debug)]
struct FacetProgress {
    outstanding: usize,
    settled: usize,
    failed: Vec<String>,
}

impl FacetProgress {
    fn new(batches: usize) -> Self {
        Self {
            outstanding: batches,
            settled: 0,
            failed: Vec::new(),
        }
    }

    fn phase(&self) -> FacetPhase {
        if self.outstanding == 0 {
            FacetPhase::Complete
        } else if self.settled == 0 {
            FacetPhase::Pending
        } else {
            FacetPhase::PartiallyMerged
        }
    }
}

#[derive(Debug)]
struct ListingOutcome {
    cycle: u64,
    result: Result<Vec<NamespaceSource>, TransportError>,
}

#[derive(Debug)]
struct UpdateOutcome {
    namespace: String,
    enable: bool,
    result: Result<(), TransportError>,
}

/// Anything the pipeline has in flight.
enum Operation {
    Listing(Registered<ListingOutcome>),
    Batch(Registered<BatchOutcome>),
    Update(Registered<UpdateOutcome>),
}

enum SettledOperation {
    Listing(Settled<ListingOutcome>),
    Batch(Settled<BatchOutcome>),
    Update(Settled<UpdateOutcome>),
}

impl Future for Operation {
    type Output = SettledOperation;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut() {
            Operation::Listing(op) => op.poll_unpin(cx).map(SettledOperation::Listing),
            Operation::Batch(op) => op.poll_unpin(cx).map(SettledOperation::Batch),
            Operation::Update(op) => op.poll_unpin(cx).map(SettledOperation::Update),
        }
    }
}

/// Aggregates per-namespace status from a [`MeshBackend`] into a
/// sorted, filtered view.
pub struct OverviewPipeline {
    backend: Arc<dyn MeshBackend>,
    config: OverviewConfig,
    registry: OperationRegistry,
    view: NamespaceView,
    in_flight: FuturesUnordered<Operation>,
    progress: BTreeMap<Facet, FacetProgress>,
    state: CycleState,
    cycle: u64,
    display_mode: DisplayMode,
    /// The caller chose the display mode; reloads leave it alone.
    display_mode_pinned: bool,
    alerts: mpsc::UnboundedSender<OverviewError>,
    snapshots: watch::Sender<OverviewSnapshot>,
    torn_down: bool,
}

impl OverviewPipeline {
    /// Create an idle pipeline. Errors are reported on the returned
    /// alert channel as they happen; a dropped receiver silences them.
    pub fn new(
        backend: Arc<dyn MeshBackend>,
        config: OverviewConfig,
    ) -> (Self, mpsc::UnboundedReceiver<OverviewError>) {
        let (alerts, alerts_rx) = mpsc::unbounded_channel();
        let (snapshots, _) = watch::channel(OverviewSnapshot::default());
        let pipeline = Self {
            backend,
            config,
            registry: OperationRegistry::new(),
            view: NamespaceView::default(),
            in_flight: FuturesUnordered::new(),
            progress: BTreeMap::new(),
            state: CycleState::Idle,
            cycle: 0,
            display_mode: DisplayMode::default(),
            display_mode_pinned: false,
            alerts,
            snapshots,
            torn_down: false,
        };
        (pipeline, alerts_rx)
    }

    pub fn config(&self) -> &OverviewConfig {
        &self.config
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.display_mode
    }

    /// All records in display order, ignoring filters.
    pub fn records(&self) -> &[NamespaceRecord] {
        self.view.records()
    }

    /// Filtered records in display order.
    pub fn visible(&self) -> Vec<&NamespaceRecord> {
        self.view.visible()
    }

    pub fn facet_phase(&self, facet: Facet) -> Option<FacetPhase> {
        self.progress.get(&facet).map(FacetProgress::phase)
    }

    /// Whether any operation, live or cancelled, is still to settle.
    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn subscribe(&self) -> watch::Receiver<OverviewSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> OverviewSnapshot {
        OverviewSnapshot {
            records: self.view.visible().into_iter().cloned().collect(),
            total: self.view.len(),
            sort: self.view.sort(),
            filters: self.view.filters().clone(),
            state: self.state,
            facets: self
                .progress
                .iter()
                .map(|(facet, progress)| (*facet, progress.phase()))
                .collect(),
            display_mode: self.display_mode,
            cycle: self.cycle,
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }

    fn report(&self, error: OverviewError) {
        if self.alerts.send(error).is_err() {
            tracing::debug!("alert receiver dropped");
        }
    }

    fn ensure_live(&self) -> Result<(), OverviewError> {
        if self.torn_down {
            Err(OverviewError::TornDown)
        } else {
            Ok(())
        }
    }

    /// Start a new load cycle.
    ///
    /// Everything the previous cycle left pending is cancelled and the
    /// namespace listing is issued; pending namespace updates are left
    /// alone. Returns as soon as the listing is registered: the cycle
    /// advances as [`next_event`](Self::next_event) settles it. Fails
    /// only once the pipeline is torn down.
    #[tracing::instrument(level = "debug", skip_all, fields(cycle = self.cycle + 1))]
    pub fn reload(&mut self) -> Result<(), OverviewError> {
        self.ensure_live()?;
        self.cycle += 1;
        self.registry.cancel_matching(|key| !is_update_key(key));
        self.progress.clear();
        self.state = CycleState::FetchingNamespaces;

        let backend = Arc::clone(&self.backend);
        let cycle = self.cycle;
        let listing = self.registry.register(NAMESPACES_KEY, async move {
            ListingOutcome {
                cycle,
                result: backend.list_namespaces().await,
            }
        });
        self.in_flight.push(Operation::Listing(listing));
        tracing::debug!("namespace listing issued");
        self.publish();
        Ok(())
    }

    /// [`reload`](Self::reload), then settle operations until the new
    /// cycle's listing has landed. A failed listing is returned (and
    /// reported). Batches are scheduled but not awaited.
    pub async fn load(&mut self) -> Result<(), OverviewError> {
        self.reload()?;
        while let Some(event) = self.next_event().await {
            match event {
                MergeEvent::Listed { .. } => break,
                MergeEvent::ListingFailed { error } => return Err(error),
                _ => {}
            }
        }
        Ok(())
    }

    /// Rebuild from a settled listing of the current cycle. A failure
    /// ends the cycle in [`CycleState::Idle`] with the previous records
    /// kept.
    fn apply_listing(
        &mut self,
        result: Result<Vec<NamespaceSource>, TransportError>,
    ) -> MergeEvent {
        let sources = match result {
            Ok(sources) => sources,
            Err(source) => {
                let error = OverviewError::transport(NAMESPACES_CONTEXT, source);
                tracing::warn!(cycle = self.cycle, %error, "namespace listing failed");
                self.state = CycleState::Idle;
                self.report(error.clone());
                return MergeEvent::ListingFailed { error };
            }
        };

        self.view.rebuild(sources);
        if !self.display_mode_pinned {
            self.display_mode = if self.view.len() > self.config.compact_threshold {
                DisplayMode::Compact
            } else {
                DisplayMode::Expand
            };
        }
        tracing::info!(
            cycle = self.cycle,
            namespaces = self.view.len(),
            display_mode = ?self.display_mode,
            "namespaces loaded"
        );

        self.schedule(Facet::Health);
        self.schedule(Facet::Tls);
        self.schedule(Facet::Validations);
        if self.display_mode == DisplayMode::Expand {
            self.schedule(Facet::Metrics);
        }
        if self.progress.is_empty() {
            // An empty listing has nothing to merge.
            self.state = CycleState::Stable;
        }
        MergeEvent::Listed {
            namespaces: self.view.len(),
        }
    }

    fn plan(&self) -> FetchPlan {
        FetchPlan {
            cycle: self.cycle,
            duration: self.config.duration,
            health_kind: self.config.health_kind,
            mesh_mtls: self.config.mesh_mtls,
            metrics: self.config.metrics_options(),
        }
    }

    fn schedule(&mut self, facet: Facet) {
        if self.view.is_empty() {
            return;
        }
        let plan = self.plan();
        let operations = schedule_facet(
            &mut self.registry,
            &self.backend,
            &plan,
            facet,
            self.view.records(),
            self.config.batch_size,
        );
        self.progress
            .insert(facet, FacetProgress::new(operations.len()));
        self.in_flight
            .extend(operations.into_iter().map(Operation::Batch));
    }

    fn update_state(&mut self) {
        if self.progress.is_empty() {
            return;
        }
        let next = if self.progress.values().all(|p| p.outstanding == 0) {
            CycleState::Stable
        } else {
            CycleState::Merging
        };
        if next == CycleState::Stable && self.state != CycleState::Stable {
            tracing::info!(cycle = self.cycle, "cycle stable");
        }
        self.state = next;
    }

    /// Wait for the next in-flight operation to settle and apply it.
    /// Returns `None` when nothing is in flight.
    pub async fn next_event(&mut self) -> Option<MergeEvent> {
        let event = match self.in_flight.next().await? {
            SettledOperation::Listing(settled) => {
                let key = settled.key().to_string();
                match self.registry.settle(settled) {
                    Ok(outcome) if outcome.cycle == self.cycle => {
                        self.apply_listing(outcome.result)
                    }
                    Ok(_) | Err(Cancelled) => discard(key),
                }
            }
            SettledOperation::Batch(settled) => {
                let key = settled.key().to_string();
                match self.registry.settle(settled) {
                    Ok(outcome) if outcome.cycle == self.cycle => self.apply(outcome),
                    Ok(_) | Err(Cancelled) => discard(key),
                }
            }
            SettledOperation::Update(settled) => {
                let key = settled.key().to_string();
                match self.registry.settle(settled) {
                    Ok(outcome) => self.apply_update(outcome),
                    Err(Cancelled) => discard(key),
                }
            }
        };
        self.update_state();
        self.publish();
        Some(event)
    }

    fn apply(&mut self, outcome: BatchOutcome) -> MergeEvent {
        let BatchOutcome {
            facet,
            index,
            namespaces,
            result,
            ..
        } = outcome;
        let mut failed = Vec::new();
        let event = match result {
            Ok(values) => {
                let resorted = self.view.merge(facet, values);
                tracing::debug!(%facet, index, resorted, "merged batch");
                MergeEvent::Merged {
                    facet,
                    index,
                    resorted,
                }
            }
            Err(source) => {
                let error = OverviewError::transport(facet.failure_context(), source);
                tracing::warn!(%facet, index, %error, "batch failed");
                self.report(error.clone());
                failed = namespaces;
                MergeEvent::Failed {
                    facet,
                    index,
                    error,
                }
            }
        };

        let partial = match self.progress.get_mut(&facet) {
            Some(progress) => {
                progress.outstanding = progress.outstanding.saturating_sub(1);
                progress.settled += 1;
                progress.failed.extend(failed);
                if progress.outstanding == 0 && !progress.failed.is_empty() {
                    let mut namespaces = std::mem::take(&mut progress.failed);
                    namespaces.sort_by(|a, b| natural_name_cmp(a, b));
                    Some(OverviewError::PartialData { facet, namespaces })
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some(error) = partial {
            tracing::warn!(%error, "facet incomplete");
            self.report(error);
        }
        event
    }

    fn apply_update(&mut self, outcome: UpdateOutcome) -> MergeEvent {
        let UpdateOutcome {
            namespace,
            enable,
            result,
        } = outcome;
        match result {
            Ok(()) => {
                tracing::info!(namespace, enable, "namespace updated");
                if let Err(error) = self.reload() {
                    tracing::debug!(%error, "no reload after update");
                }
                MergeEvent::Updated { namespace }
            }
            Err(source) => {
                let error = OverviewError::UpdateNamespace {
                    namespace: namespace.clone(),
                    source,
                };
                tracing::warn!(%error, "namespace update failed");
                self.report(error.clone());
                MergeEvent::UpdateFailed { namespace, error }
            }
        }
    }

    /// Drive every in-flight operation to completion.
    pub async fn settle_all(&mut self) {
        while self.next_event().await.is_some() {}
    }

    pub fn set_sort(&mut self, field: SortField, direction: SortDirection) -> Result<(), OverviewError> {
        self.ensure_live()?;
        self.view.set_sort(SortSpec::new(field, direction));
        self.publish();
        Ok(())
    }

    /// Replace the active filters. Filtering only changes what is
    /// projected; no fetch is issued.
    pub fn set_filters(&mut self, filters: FilterSet) -> Result<(), OverviewError> {
        self.ensure_live()?;
        self.view.set_filters(filters);
        self.publish();
        Ok(())
    }

    /// Pin the display mode. Switching to [`DisplayMode::Expand`]
    /// fetches metrics for the current records.
    pub fn set_display_mode(&mut self, mode: DisplayMode) -> Result<(), OverviewError> {
        self.ensure_live()?;
        let previous = std::mem::replace(&mut self.display_mode, mode);
        self.display_mode_pinned = true;
        // While listing, the settled listing schedules metrics itself.
        if mode == DisplayMode::Expand
            && previous != DisplayMode::Expand
            && self.state != CycleState::FetchingNamespaces
        {
            self.schedule(Facet::Metrics);
            self.update_state();
        }
        self.publish();
        Ok(())
    }

    /// Change the entity kind health is computed for, and reload.
    pub fn set_health_kind(&mut self, kind: HealthKind) -> Result<(), OverviewError> {
        self.ensure_live()?;
        self.config.health_kind = kind;
        self.reload()
    }

    /// Change the query window for health and metrics, and reload.
    pub fn set_duration(&mut self, duration: Duration) -> Result<(), OverviewError> {
        self.ensure_live()?;
        self.config.duration = duration;
        self.reload()
    }

    /// Turn sidecar auto injection on or off for `namespace` by
    /// setting or removing the configured injection label. The patch
    /// settles through [`next_event`](Self::next_event): success
    /// reloads, failure is reported on the alert channel. A second
    /// call for the same namespace supersedes the first.
    #[tracing::instrument(level = "debug", skip_all, fields(namespace = %namespace, enable = enable))]
    pub fn set_auto_injection(&mut self, namespace: &str, enable: bool) -> Result<(), OverviewError> {
        self.ensure_live()?;
        let patch = NamespacePatch::injection(&self.config.injection_label, enable);
        let backend = Arc::clone(&self.backend);
        let name = namespace.to_string();
        let update = self.registry.register(update_key(namespace), async move {
            let result = backend.update_namespace(&name, &patch).await;
            UpdateOutcome {
                namespace: name,
                enable,
                result,
            }
        });
        self.in_flight.push(Operation::Update(update));
        tracing::debug!("namespace update issued");
        Ok(())
    }

    /// Cancel every pending operation, namespace updates included, and
    /// return to [`CycleState::Idle`]. Cancelled operations still
    /// settle through [`next_event`](Self::next_event) and are
    /// discarded there.
    pub fn cancel_all(&mut self) -> usize {
        let cancelled = self.registry.cancel_all();
        self.progress.clear();
        self.state = CycleState::Idle;
        self.publish();
        cancelled
    }

    /// Cancel everything, drop in-flight work and refuse further
    /// requests. Idempotent.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        let cancelled = self.cancel_all();
        self.in_flight = FuturesUnordered::new();
        self.torn_down = true;
        tracing::info!(cancelled, "overview pipeline torn down");
        self.publish();
    }
}

fn discard(key: String) -> MergeEvent {
    tracing::debug!(key, "discarding cancelled operation");
    MergeEvent::Discarded { key }
}
