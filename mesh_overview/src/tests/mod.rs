/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Tests that exercise the pipeline end to end (registry + scheduler +
//! view + sort/filter) against the scripted backend. Per-module unit
//! tests live in each module's own `#[cfg(test)] mod tests` block.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::backend::MeshBackend;
use crate::config::OverviewConfig;
use crate::error::OverviewError;
use crate::filter::FilterSet;
use crate::filter::HealthFilter;
use crate::filter::NamespaceFilter;
use crate::model::Facet;
use crate::model::HealthStatus;
use crate::model::ValidationSummary;
use crate::pipeline::CycleState;
use crate::pipeline::DisplayMode;
use crate::pipeline::FacetPhase;
use crate::pipeline::MergeEvent;
use crate::pipeline::NAMESPACES_KEY;
use crate::pipeline::OverviewPipeline;
use crate::sort::SortDirection;
use crate::sort::SortField;
use crate::testing::Endpoint;
use crate::testing::ScriptedBackend;

fn pipeline(
    backend: &Arc<ScriptedBackend>,
) -> (OverviewPipeline, mpsc::UnboundedReceiver<OverviewError>) {
    let backend: Arc<dyn MeshBackend> = backend.clone();
    OverviewPipeline::new(backend, OverviewConfig::default())
}

fn names(pipeline: &OverviewPipeline) -> Vec<&str> {
    pipeline.records().iter().map(|r| r.name.as_str()).collect()
}

fn alerts(rx: &mut mpsc::UnboundedReceiver<OverviewError>) -> Vec<OverviewError> {
    let mut out = Vec::new();
    while let Ok(error) = rx.try_recv() {
        out.push(error);
    }
    out
}

/// Keep settling events until `done` holds. Held calls never settle,
/// so each wait is bounded.
async fn drive_until(pipeline: &mut OverviewPipeline, mut done: impl FnMut() -> bool) {
    while !done() {
        let _ = tokio::time::timeout(Duration::from_millis(10), pipeline.next_event()).await;
    }
}

// 23 namespaces in batches of 10 make 10, 10 and 3 per facet.
#[tokio::test]
async fn chunk_sizing() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_namespaces((0..23).map(|i| format!("ns-{i}")));
    let (mut pipeline, _alerts) = pipeline(&backend);
    pipeline.set_display_mode(DisplayMode::Expand).unwrap();
    pipeline.load().await.unwrap();
    pipeline.settle_all().await;

    let mut sizes: Vec<usize> = backend
        .calls(Endpoint::Health)
        .iter()
        .map(Vec::len)
        .collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![3, 10, 10]);

    // Per-namespace facets issue one call per namespace, 23 in all.
    for endpoint in [Endpoint::Tls, Endpoint::Validations, Endpoint::Metrics] {
        assert_eq!(backend.calls(endpoint).len(), 23, "{:?}", endpoint);
    }

    // Every namespace was in exactly one health batch.
    let mut seen: Vec<String> = backend.calls(Endpoint::Health).concat();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 23);
    assert_eq!(pipeline.state(), CycleState::Stable);
}

// Auto display mode is compact above the threshold, and compact skips
// metrics.
#[tokio::test]
async fn large_listing_goes_compact() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_namespaces((0..23).map(|i| format!("ns-{i}")));
    let (mut pipeline, _alerts) = pipeline(&backend);
    pipeline.load().await.unwrap();
    assert_eq!(pipeline.display_mode(), DisplayMode::Compact);
    pipeline.settle_all().await;
    assert!(backend.calls(Endpoint::Metrics).is_empty());
    assert_eq!(pipeline.facet_phase(Facet::Metrics), None);
}

// A superseded reload's batch never reaches the view, whatever order
// the batches complete in.
#[tokio::test]
async fn cancellation_across_reloads() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_namespaces(["bookinfo"]);
    backend.set_health("bookinfo", [("reviews", HealthStatus::Failure)]);
    let gate = backend.hold(Endpoint::Health);
    let (mut pipeline, mut alerts_rx) = pipeline(&backend);

    pipeline.load().await.unwrap();
    // Let the first cycle's health call start; it is held at the gate
    // with the old answer already computed.
    drive_until(&mut pipeline, || !backend.calls(Endpoint::Health).is_empty()).await;

    backend.set_health("bookinfo", [("reviews", HealthStatus::Healthy)]);
    pipeline.load().await.unwrap();
    assert_eq!(pipeline.cycle(), 2);

    // The second cycle completes first, then the old call is released.
    drive_until(&mut pipeline, || {
        backend.calls(Endpoint::Health).len() == 2
    })
    .await;
    gate.open();

    let mut discarded = Vec::new();
    while let Some(event) = pipeline.next_event().await {
        if let MergeEvent::Discarded { key } = event {
            discarded.push(key);
        }
    }
    assert!(discarded.contains(&"health-chunk/0".to_string()), "{:?}", discarded);

    let status = pipeline.records()[0].status.clone().unwrap();
    assert_eq!(status.in_success, vec!["reviews"]);
    assert!(status.in_error.is_empty());
    assert!(alerts(&mut alerts_rx).is_empty());
    assert_eq!(pipeline.state(), CycleState::Stable);
}

// Known values stay visible through a reload until fresh ones land, and
// through a failed refresh.
#[tokio::test]
async fn stale_while_revalidate() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_namespaces(["ns1", "ns2"]);
    let summary = ValidationSummary {
        errors: 2,
        warnings: 1,
        object_count: 7,
    };
    backend.set_validations("ns1", summary);
    let (mut pipeline, _alerts) = pipeline(&backend);
    pipeline.load().await.unwrap();
    pipeline.settle_all().await;
    assert_eq!(pipeline.records()[0].validations, Some(summary));

    backend.set_namespaces(["ns1", "ns3"]);
    backend.fail(Endpoint::Validations, "ns1");
    pipeline.load().await.unwrap();

    // Rebuilt, not yet merged: ns1 keeps its values, ns3 has none.
    assert_eq!(names(&pipeline), vec!["ns1", "ns3"]);
    assert_eq!(pipeline.records()[0].validations, Some(summary));
    assert_eq!(pipeline.records()[1].validations, None);

    pipeline.settle_all().await;
    assert_eq!(pipeline.records()[0].validations, Some(summary));
    assert_eq!(pipeline.records()[1].validations, None);
}

// Sorted by name, a metrics batch leaves the order alone.
#[tokio::test]
async fn irrelevant_facet_keeps_order() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_namespaces(["team-10", "team-2", "team-1"]);
    backend.set_rate("team-1", 100.0);
    backend.set_rate("team-2", 1.0);
    backend.set_rate("team-10", 50.0);
    let (mut pipeline, _alerts) = pipeline(&backend);
    pipeline.load().await.unwrap();
    assert_eq!(names(&pipeline), vec!["team-1", "team-2", "team-10"]);

    while let Some(event) = pipeline.next_event().await {
        if let MergeEvent::Merged { resorted, .. } = event {
            assert!(!resorted);
        }
        assert_eq!(names(&pipeline), vec!["team-1", "team-2", "team-10"]);
    }
    assert!(pipeline.records().iter().all(|r| r.metrics.is_some()));
}

// Sorted by metrics, the metrics batch reorders the list as it lands.
#[tokio::test]
async fn relevant_facet_resorts() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_namespaces(["a", "b", "c"]);
    backend.set_rate("a", 1.0);
    backend.set_rate("b", 50.0);
    backend.set_rate("c", 5.0);
    let (mut pipeline, _alerts) = pipeline(&backend);
    pipeline
        .set_sort(SortField::Metrics, SortDirection::Descending)
        .unwrap();
    pipeline.load().await.unwrap();

    let mut resorted = false;
    while let Some(event) = pipeline.next_event().await {
        if let MergeEvent::Merged {
            facet: Facet::Metrics,
            resorted: r,
            ..
        } = event
        {
            resorted = r;
        }
    }
    assert!(resorted);
    assert_eq!(names(&pipeline), vec!["b", "c", "a"]);

    // Ascending puts the quietest namespace first.
    pipeline
        .set_sort(SortField::Metrics, SortDirection::Ascending)
        .unwrap();
    assert_eq!(names(&pipeline), vec!["a", "c", "b"]);
}

// One failing batch leaves its siblings and the other facets merged,
// and reports the gap once.
#[tracing_test::traced_test]
#[tokio::test]
async fn partial_failure_isolation() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_namespaces((0..12).map(|i| format!("ns-{i}")));
    backend.fail(Endpoint::Health, "ns-11");
    let (mut pipeline, mut alerts_rx) = pipeline(&backend);
    pipeline.load().await.unwrap();
    pipeline.settle_all().await;

    for record in pipeline.records() {
        let in_failed_batch = record.name == "ns-10" || record.name == "ns-11";
        assert_eq!(record.status.is_none(), in_failed_batch, "{}", record.name);
        assert!(record.tls_status.is_some(), "{}", record.name);
        assert!(record.validations.is_some(), "{}", record.name);
    }
    assert_eq!(pipeline.facet_phase(Facet::Health), Some(FacetPhase::Complete));
    assert_eq!(pipeline.state(), CycleState::Stable);

    let alerts = alerts(&mut alerts_rx);
    assert_eq!(alerts.len(), 2, "{:?}", alerts);
    assert!(
        alerts[0].to_string().starts_with("Could not fetch health: HTTP 500"),
        "{}",
        alerts[0]
    );
    assert_eq!(
        alerts[1],
        OverviewError::PartialData {
            facet: Facet::Health,
            namespaces: vec!["ns-10".into(), "ns-11".into()],
        }
    );
    assert!(logs_contain("batch failed"));
}

// A failed listing ends the cycle and keeps what was already shown.
#[tokio::test]
async fn failed_listing_keeps_previous_records() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_namespaces(["a", "b"]);
    let (mut pipeline, mut alerts_rx) = pipeline(&backend);
    pipeline.load().await.unwrap();
    pipeline.settle_all().await;
    let before = pipeline.records().to_vec();

    backend.fail(Endpoint::Namespaces, "");
    let err = pipeline.load().await.unwrap_err();
    assert!(
        err.to_string().starts_with("Could not fetch namespaces"),
        "{}",
        err
    );
    assert_eq!(pipeline.state(), CycleState::Idle);
    assert_eq!(pipeline.records(), before.as_slice());
    assert!(!pipeline.has_in_flight());
    assert_eq!(alerts(&mut alerts_rx), vec![err]);

    backend.recover(Endpoint::Namespaces, "");
    pipeline.load().await.unwrap();
    pipeline.settle_all().await;
    assert_eq!(pipeline.state(), CycleState::Stable);
}

// Filters narrow the published records without touching the list.
#[tokio::test]
async fn filters_project_snapshots() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_namespaces(["bookinfo", "default", "istio-system"]);
    backend.set_health("bookinfo", [("reviews", HealthStatus::Failure)]);
    backend.set_health("istio-system", [("istiod", HealthStatus::Healthy)]);
    let (mut pipeline, _alerts) = pipeline(&backend);
    let snapshots = pipeline.subscribe();
    pipeline.load().await.unwrap();
    pipeline.settle_all().await;

    pipeline
        .set_filters(FilterSet::new(vec![NamespaceFilter::Health(
            HealthFilter::Failure,
        )]))
        .unwrap();
    let snapshot = snapshots.borrow().clone();
    assert_eq!(snapshot.total, 3);
    let visible: Vec<&str> = snapshot.records.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(visible, vec!["bookinfo"]);

    pipeline
        .set_filters(FilterSet::new(vec![NamespaceFilter::Health(
            HealthFilter::NoEntities,
        )]))
        .unwrap();
    let visible: Vec<String> = pipeline.visible().iter().map(|r| r.name.clone()).collect();
    assert_eq!(visible, vec!["default"]);
    assert_eq!(pipeline.records().len(), 3);
}

// Changing the health kind refreshes with the new kind.
#[tokio::test]
async fn health_kind_change_reloads() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_namespaces(["a"]);
    let (mut pipeline, _alerts) = pipeline(&backend);
    pipeline.load().await.unwrap();
    pipeline.settle_all().await;
    pipeline
        .set_health_kind(crate::backend::HealthKind::Workload)
        .unwrap();
    pipeline.settle_all().await;
    assert_eq!(pipeline.cycle(), 2);
    assert_eq!(backend.calls(Endpoint::Health).len(), 2);
    assert_eq!(
        pipeline.config().health_kind,
        crate::backend::HealthKind::Workload
    );
}

// A listing superseded by a second reload is discarded, even when it
// lands after the newer one.
#[tokio::test]
async fn superseded_listing_is_discarded() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_namespaces(["old"]);
    let gate = backend.hold(Endpoint::Namespaces);
    let (mut pipeline, mut alerts_rx) = pipeline(&backend);

    pipeline.reload().unwrap();
    // The first listing starts and is held with ["old"] computed.
    drive_until(&mut pipeline, || backend.calls(Endpoint::Namespaces).len() == 1).await;
    assert_eq!(pipeline.state(), CycleState::FetchingNamespaces);

    backend.set_namespaces(["new"]);
    pipeline.load().await.unwrap();
    assert_eq!(pipeline.cycle(), 2);
    assert_eq!(names(&pipeline), vec!["new"]);

    gate.open();
    let mut discarded = Vec::new();
    while let Some(event) = pipeline.next_event().await {
        if let MergeEvent::Discarded { key } = event {
            discarded.push(key);
        }
    }
    assert_eq!(discarded, vec![NAMESPACES_KEY.to_string()]);
    assert_eq!(names(&pipeline), vec!["new"]);
    assert_eq!(pipeline.state(), CycleState::Stable);
    assert!(alerts(&mut alerts_rx).is_empty());
}

// Enabling auto injection patches the label and reloads, so the new
// label shows up in the records.
#[tokio::test]
async fn auto_injection_patches_then_reloads() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_namespaces(["bookinfo", "default"]);
    let (mut pipeline, mut alerts_rx) = pipeline(&backend);
    pipeline.load().await.unwrap();
    pipeline.settle_all().await;
    let label = pipeline.config().injection_label.clone();
    assert!(!pipeline.records()[0].auto_injection(&label));

    pipeline.set_auto_injection("bookinfo", true).unwrap();
    let mut events = Vec::new();
    while let Some(event) = pipeline.next_event().await {
        events.push(event);
    }
    assert_eq!(
        events[0],
        MergeEvent::Updated {
            namespace: "bookinfo".to_string()
        }
    );
    assert!(events.contains(&MergeEvent::Listed { namespaces: 2 }));
    assert_eq!(pipeline.cycle(), 2);
    assert_eq!(pipeline.state(), CycleState::Stable);
    assert!(pipeline.records()[0].auto_injection(&label));
    assert!(!pipeline.records()[1].auto_injection(&label));

    pipeline.set_auto_injection("bookinfo", false).unwrap();
    pipeline.settle_all().await;
    assert_eq!(pipeline.cycle(), 3);
    assert!(!pipeline.records()[0].auto_injection(&label));
    assert_eq!(backend.labels("bookinfo"), Some(Default::default()));
    assert!(alerts(&mut alerts_rx).is_empty());
}

// A failed patch is reported and leaves the cycle alone.
#[tracing_test::traced_test]
#[tokio::test]
async fn auto_injection_failure_is_reported() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_namespaces(["bookinfo"]);
    backend.fail(Endpoint::UpdateNamespace, "bookinfo");
    let (mut pipeline, mut alerts_rx) = pipeline(&backend);
    pipeline.load().await.unwrap();
    pipeline.settle_all().await;

    pipeline.set_auto_injection("bookinfo", true).unwrap();
    let event = pipeline.next_event().await.unwrap();
    let MergeEvent::UpdateFailed { namespace, error } = event else {
        panic!("unexpected event {:?}", event);
    };
    assert_eq!(namespace, "bookinfo");
    assert!(
        error.to_string().starts_with("Could not update namespace bookinfo: HTTP 500"),
        "{}",
        error
    );
    assert_eq!(alerts(&mut alerts_rx), vec![error]);
    assert_eq!(pipeline.cycle(), 1);
    assert_eq!(pipeline.state(), CycleState::Stable);
    assert!(!pipeline.has_in_flight());
    assert!(logs_contain("namespace update failed"));
}

// A pending patch survives a reload; its success still reloads.
#[tokio::test]
async fn update_outlives_reload() {
    let backend = Arc::new(ScriptedBackend::new());
    backend.set_namespaces(["bookinfo"]);
    let gate = backend.hold(Endpoint::UpdateNamespace);
    let (mut pipeline, _alerts) = pipeline(&backend);
    pipeline.load().await.unwrap();
    pipeline.settle_all().await;

    pipeline.set_auto_injection("bookinfo", true).unwrap();
    drive_until(&mut pipeline, || {
        backend.calls(Endpoint::UpdateNamespace).len() == 1
    })
    .await;
    pipeline.load().await.unwrap();
    assert_eq!(pipeline.cycle(), 2);

    gate.open();
    let mut updated = false;
    while let Some(event) = pipeline.next_event().await {
        updated |= matches!(event, MergeEvent::Updated { .. });
    }
    assert!(updated);
    assert_eq!(pipeline.cycle(), 3);
    let label = pipeline.config().injection_label.clone();
    assert!(pipeline.records()[0].auto_injection(&label));
}
