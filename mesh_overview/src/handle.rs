/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Run an [`OverviewPipeline`] on its own task.
//!
//! The task multiplexes three sources: a shutdown token, a command
//! channel, and the pipeline's in-flight operations. Commands never
//! wait on the backend, so a pending listing or batch does not hold
//! up the next command. Consumers only see the pipeline through its
//! snapshot channel.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::HealthKind;
use crate::error::OverviewError;
use crate::filter::FilterSet;
use crate::pipeline::DisplayMode;
use crate::pipeline::OverviewPipeline;
use crate::pipeline::OverviewSnapshot;
use crate::sort::SortDirection;
use crate::sort::SortField;

#[derive(Debug)]
enum Command {
    Reload,
    SetSort(SortField, SortDirection),
    SetFilters(FilterSet),
    SetDisplayMode(DisplayMode),
    SetHealthKind(HealthKind),
    SetDuration(Duration),
    SetAutoInjection { namespace: String, enable: bool },
}

/// Owner of a spawned pipeline. Dropping the handle tears the
/// pipeline down.
pub struct OverviewHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<OverviewSnapshot>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl OverviewHandle {
    /// Move `pipeline` onto a new task. Must be called from within a
    /// tokio runtime.
    pub fn spawn(pipeline: OverviewPipeline) -> Self {
        let snapshots = pipeline.subscribe();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(pipeline, commands_rx, shutdown.clone()));
        Self {
            commands,
            snapshots,
            shutdown,
            task: Some(task),
        }
    }

    fn send(&self, command: Command) -> Result<(), OverviewError> {
        self.commands
            .send(command)
            .map_err(|_| OverviewError::TornDown)
    }

    pub fn reload(&self) -> Result<(), OverviewError> {
        self.send(Command::Reload)
    }

    pub fn set_sort(&self, field: SortField, direction: SortDirection) -> Result<(), OverviewError> {
        self.send(Command::SetSort(field, direction))
    }

    pub fn set_filters(&self, filters: FilterSet) -> Result<(), OverviewError> {
        self.send(Command::SetFilters(filters))
    }

    pub fn set_display_mode(&self, mode: DisplayMode) -> Result<(), OverviewError> {
        self.send(Command::SetDisplayMode(mode))
    }

    pub fn set_health_kind(&self, kind: HealthKind) -> Result<(), OverviewError> {
        self.send(Command::SetHealthKind(kind))
    }

    pub fn set_duration(&self, duration: Duration) -> Result<(), OverviewError> {
        self.send(Command::SetDuration(duration))
    }

    pub fn set_auto_injection(
        &self,
        namespace: impl Into<String>,
        enable: bool,
    ) -> Result<(), OverviewError> {
        self.send(Command::SetAutoInjection {
            namespace: namespace.into(),
            enable,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<OverviewSnapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> OverviewSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Tear the pipeline down and wait for its task to exit.
    pub async fn teardown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("overview task failed: {}", e);
            }
        }
    }
}

impl Drop for OverviewHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tracing::instrument(level = "debug", skip_all)]
async fn run(
    mut pipeline: OverviewPipeline,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            command = commands.recv() => {
                let Some(command) = command else { break };
                tracing::debug!(?command, "overview command");
                if let Err(e) = execute(&mut pipeline, command) {
                    tracing::debug!("command failed: {}", e);
                }
            }
            Some(event) = pipeline.next_event(), if pipeline.has_in_flight() => {
                tracing::trace!(?event, "settled");
            }
        }
    }
    pipeline.teardown();
}

fn execute(pipeline: &mut OverviewPipeline, command: Command) -> Result<(), OverviewError> {
    match command {
        Command::Reload => pipeline.reload(),
        Command::SetSort(field, direction) => pipeline.set_sort(field, direction),
        Command::SetFilters(filters) => pipeline.set_filters(filters),
        Command::SetDisplayMode(mode) => pipeline.set_display_mode(mode),
        Command::SetHealthKind(kind) => pipeline.set_health_kind(kind),
        Command::SetDuration(duration) => pipeline.set_duration(duration),
        Command::SetAutoInjection { namespace, enable } => {
            pipeline.set_auto_injection(&namespace, enable)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::MeshBackend;
    use crate::config::OverviewConfig;
    use crate::model::HealthStatus;
    use crate::pipeline::CycleState;
    use crate::testing::Endpoint;
    use crate::testing::ScriptedBackend;

    fn spawn(backend: &Arc<ScriptedBackend>) -> OverviewHandle {
        let backend: Arc<dyn MeshBackend> = backend.clone();
        let (pipeline, _alerts) = OverviewPipeline::new(backend, OverviewConfig::default());
        OverviewHandle::spawn(pipeline)
    }

    fn names(snapshot: &OverviewSnapshot) -> Vec<String> {
        snapshot.records.iter().map(|r| r.name.clone()).collect()
    }

    #[tokio::test]
    async fn reload_publishes_stable_snapshot() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.set_namespaces(["istio-system", "bookinfo"]);
        backend.set_health("bookinfo", [("reviews", HealthStatus::Failure)]);
        let handle = spawn(&backend);
        let mut rx = handle.subscribe();

        handle.reload().unwrap();
        let snapshot = rx
            .wait_for(|s| s.cycle == 1 && s.state == CycleState::Stable)
            .await
            .unwrap()
            .clone();
        assert_eq!(names(&snapshot), vec!["bookinfo", "istio-system"]);
        let bookinfo = &snapshot.records[0];
        assert_eq!(
            bookinfo.status.as_ref().map(|s| s.in_error.clone()),
            Some(vec!["reviews".to_string()])
        );
        handle.teardown().await;
    }

    #[tokio::test]
    async fn sort_commands_reorder_the_snapshot() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.set_namespaces(["a", "b"]);
        backend.set_health("b", [("x", HealthStatus::Failure)]);
        let handle = spawn(&backend);
        let mut rx = handle.subscribe();
        handle.reload().unwrap();
        rx.wait_for(|s| s.state == CycleState::Stable).await.unwrap();

        handle
            .set_sort(SortField::Health, SortDirection::Ascending)
            .unwrap();
        let snapshot = rx
            .wait_for(|s| s.sort.field == SortField::Health)
            .await
            .unwrap()
            .clone();
        assert_eq!(names(&snapshot), vec!["b", "a"]);
        handle.teardown().await;
    }

    #[tokio::test]
    async fn commands_apply_while_listing_is_held() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.set_namespaces(["a", "b"]);
        backend.set_health("b", [("x", HealthStatus::Failure)]);
        // One gate per listing: neither can land before the sort.
        let gates = [
            backend.hold(Endpoint::Namespaces),
            backend.hold(Endpoint::Namespaces),
        ];
        let handle = spawn(&backend);
        let mut rx = handle.subscribe();

        handle.reload().unwrap();
        handle.reload().unwrap();
        handle
            .set_sort(SortField::Health, SortDirection::Ascending)
            .unwrap();
        let snapshot = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.sort.field == SortField::Health),
        )
        .await
        .expect("sort applied while the listing is held")
        .unwrap()
        .clone();
        assert_eq!(snapshot.cycle, 2);
        assert_eq!(snapshot.state, CycleState::FetchingNamespaces);
        assert!(snapshot.records.is_empty());

        for gate in &gates {
            gate.open();
        }
        let snapshot = rx
            .wait_for(|s| s.cycle == 2 && s.state == CycleState::Stable)
            .await
            .unwrap()
            .clone();
        assert_eq!(names(&snapshot), vec!["b", "a"]);
        assert_eq!(backend.calls(Endpoint::Namespaces).len(), 2);
        handle.teardown().await;
    }

    #[tokio::test]
    async fn auto_injection_command_patches_and_reloads() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.set_namespaces(["bookinfo"]);
        let handle = spawn(&backend);
        let mut rx = handle.subscribe();
        handle.reload().unwrap();
        rx.wait_for(|s| s.cycle == 1 && s.state == CycleState::Stable)
            .await
            .unwrap();

        handle.set_auto_injection("bookinfo", true).unwrap();
        let snapshot = rx
            .wait_for(|s| s.cycle == 2 && s.state == CycleState::Stable)
            .await
            .unwrap()
            .clone();
        assert!(snapshot.records[0].auto_injection("istio-injection"));
        assert_eq!(backend.calls(Endpoint::UpdateNamespace).len(), 1);
        handle.teardown().await;
    }

    #[tokio::test]
    async fn teardown_abandons_held_batches() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.set_namespaces(["a"]);
        let _gate = backend.hold(Endpoint::Health);
        let handle = spawn(&backend);
        let mut rx = handle.subscribe();
        handle.reload().unwrap();
        rx.wait_for(|s| s.state == CycleState::Merging).await.unwrap();

        // The held health call never completes; teardown must not wait
        // for it.
        handle.teardown().await;
        assert_eq!(rx.borrow().state, CycleState::Idle);
        assert!(rx.borrow().records[0].status.is_none());
    }

    #[tokio::test]
    async fn dropping_the_handle_stops_the_task() {
        let backend = Arc::new(ScriptedBackend::new());
        let handle = spawn(&backend);
        let mut rx = handle.subscribe();
        drop(handle);
        while rx.changed().await.is_ok() {}
        assert_eq!(rx.borrow().state, CycleState::Idle);
    }
}
