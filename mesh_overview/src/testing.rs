/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Test utilities: an in-memory, scriptable [`MeshBackend`].
//!
//! Responses are computed from the script when a call starts. A call
//! can additionally be held at a [`Gate`] until the test opens it,
//! which lets tests force any completion order.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::backend::HealthKind;
use crate::backend::MeshBackend;
use crate::backend::MetricsOptions;
use crate::backend::MtlsSource;
use crate::backend::NamespacePatch;
use crate::backend::REQUEST_COUNT;
use crate::error::TransportError;
use crate::model::Facet;
use crate::model::HealthStatus;
use crate::model::MtlsState;
use crate::model::NamespaceSource;
use crate::model::TimeSeries;
use crate::model::ValidationSummary;

/// One backend query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Namespaces,
    Health,
    Tls,
    Validations,
    Metrics,
    UpdateNamespace,
}

impl From<Facet> for Endpoint {
    fn from(facet: Facet) -> Self {
        match facet {
            Facet::Health => Endpoint::Health,
            Facet::Tls => Endpoint::Tls,
            Facet::Validations => Endpoint::Validations,
            Facet::Metrics => Endpoint::Metrics,
        }
    }
}

/// Holds one call until [`Gate::open`] is called (or the gate is
/// dropped).
#[derive(Debug)]
pub struct Gate {
    tx: watch::Sender<bool>,
}

impl Gate {
    pub fn open(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Default)]
struct Script {
    namespaces: Vec<NamespaceSource>,
    health: HashMap<String, BTreeMap<String, HealthStatus>>,
    tls: HashMap<String, MtlsState>,
    validations: HashMap<String, ValidationSummary>,
    metrics: HashMap<String, Vec<TimeSeries>>,
    failures: HashSet<(Endpoint, String)>,
    gates: HashMap<Endpoint, VecDeque<watch::Receiver<bool>>>,
    calls: HashMap<Endpoint, Vec<Vec<String>>>,
}

/// In-memory backend driven by a script.
#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<Script>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        // A panicking test poisons the lock; the script is still usable.
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_namespaces<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script().namespaces = names.into_iter().map(NamespaceSource::new).collect();
    }

    pub fn set_namespace_sources(&self, sources: Vec<NamespaceSource>) {
        self.script().namespaces = sources;
    }

    pub fn set_health<I, S>(&self, namespace: &str, entities: I)
    where
        I: IntoIterator<Item = (S, HealthStatus)>,
        S: Into<String>,
    {
        self.script().health.insert(
            namespace.to_string(),
            entities.into_iter().map(|(e, s)| (e.into(), s)).collect(),
        );
    }

    pub fn set_tls(&self, namespace: &str, state: MtlsState) {
        self.script().tls.insert(namespace.to_string(), state);
    }

    pub fn set_validations(&self, namespace: &str, summary: ValidationSummary) {
        self.script()
            .validations
            .insert(namespace.to_string(), summary);
    }

    /// Script a constant request rate for `namespace`.
    pub fn set_rate(&self, namespace: &str, rate: f64) {
        let series = TimeSeries {
            labels: BTreeMap::new(),
            samples: vec![(0.0, rate), (60.0, rate)],
        };
        self.script()
            .metrics
            .insert(namespace.to_string(), vec![series]);
    }

    /// Labels the script currently lists for `namespace`.
    pub fn labels(&self, namespace: &str) -> Option<BTreeMap<String, String>> {
        self.script()
            .namespaces
            .iter()
            .find(|source| source.name == namespace)
            .map(|source| source.labels.clone())
    }

    /// Calls to `endpoint` that touch `namespace` fail. For
    /// [`Endpoint::Namespaces`] the namespace is ignored.
    pub fn fail(&self, endpoint: Endpoint, namespace: &str) {
        self.script()
            .failures
            .insert((endpoint, namespace.to_string()));
    }

    pub fn recover(&self, endpoint: Endpoint, namespace: &str) {
        self.script()
            .failures
            .remove(&(endpoint, namespace.to_string()));
    }

    /// Hold the next call to `endpoint` until the returned gate opens.
    /// Gates queue up: each call consumes one.
    pub fn hold(&self, endpoint: Endpoint) -> Gate {
        let (tx, rx) = watch::channel(false);
        self.script()
            .gates
            .entry(endpoint)
            .or_default()
            .push_back(rx);
        Gate { tx }
    }

    /// Namespace lists of every call made to `endpoint`, in call
    /// order.
    pub fn calls(&self, endpoint: Endpoint) -> Vec<Vec<String>> {
        self.script()
            .calls
            .get(&endpoint)
            .cloned()
            .unwrap_or_default()
    }

    /// Record the call, check for injected failures, and take the next
    /// gate, all under one lock.
    fn begin(
        &self,
        endpoint: Endpoint,
        namespaces: &[String],
    ) -> (Result<(), TransportError>, Option<watch::Receiver<bool>>) {
        let mut script = self.script();
        script
            .calls
            .entry(endpoint)
            .or_default()
            .push(namespaces.to_vec());
        let failed = if endpoint == Endpoint::Namespaces {
            script.failures.iter().any(|(e, _)| *e == Endpoint::Namespaces)
        } else {
            namespaces
                .iter()
                .any(|ns| script.failures.contains(&(endpoint, ns.clone())))
        };
        let gate = script
            .gates
            .get_mut(&endpoint)
            .and_then(VecDeque::pop_front);
        let result = if failed {
            Err(TransportError::Status {
                url: format!("scripted://{:?}/{}", endpoint, namespaces.join(",")),
                status: 500,
            })
        } else {
            Ok(())
        };
        (result, gate)
    }

    async fn wait(gate: Option<watch::Receiver<bool>>) {
        if let Some(mut gate) = gate {
            // A dropped gate counts as open.
            let _ = gate.wait_for(|open| *open).await;
        }
    }
}

#[async_trait]
impl MeshBackend for ScriptedBackend {
    async fn list_namespaces(&self) -> Result<Vec<NamespaceSource>, TransportError> {
        let (status, gate) = self.begin(Endpoint::Namespaces, &[]);
        let response = status.map(|()| self.script().namespaces.clone());
        Self::wait(gate).await;
        response
    }

    async fn get_health(
        &self,
        namespaces: &[String],
        _duration: Duration,
        _kind: HealthKind,
    ) -> Result<HashMap<String, BTreeMap<String, HealthStatus>>, TransportError> {
        let (status, gate) = self.begin(Endpoint::Health, namespaces);
        let response = status.map(|()| {
            let script = self.script();
            namespaces
                .iter()
                .map(|ns| (ns.clone(), script.health.get(ns).cloned().unwrap_or_default()))
                .collect()
        });
        Self::wait(gate).await;
        response
    }

    async fn get_mtls_status(&self, namespace: &str) -> Result<MtlsSource, TransportError> {
        let names = [namespace.to_string()];
        let (status, gate) = self.begin(Endpoint::Tls, &names);
        let response = status.map(|()| MtlsSource {
            status: self
                .script()
                .tls
                .get(namespace)
                .copied()
                .unwrap_or(MtlsState::NotEnabled),
        });
        Self::wait(gate).await;
        response
    }

    async fn get_validations(&self, namespace: &str) -> Result<ValidationSummary, TransportError> {
        let names = [namespace.to_string()];
        let (status, gate) = self.begin(Endpoint::Validations, &names);
        let response = status.map(|()| {
            self.script()
                .validations
                .get(namespace)
                .copied()
                .unwrap_or_default()
        });
        Self::wait(gate).await;
        response
    }

    async fn get_metrics(
        &self,
        namespace: &str,
        _options: &MetricsOptions,
    ) -> Result<HashMap<String, Vec<TimeSeries>>, TransportError> {
        let names = [namespace.to_string()];
        let (status, gate) = self.begin(Endpoint::Metrics, &names);
        let response = status.map(|()| {
            self.script()
                .metrics
                .get(namespace)
                .map(|matrix| HashMap::from([(REQUEST_COUNT.to_string(), matrix.clone())]))
                .unwrap_or_default()
        });
        Self::wait(gate).await;
        response
    }

    async fn update_namespace(
        &self,
        namespace: &str,
        patch: &NamespacePatch,
    ) -> Result<(), TransportError> {
        let names = [namespace.to_string()];
        let (status, gate) = self.begin(Endpoint::UpdateNamespace, &names);
        if status.is_ok() {
            let mut script = self.script();
            match script.namespaces.iter_mut().find(|s| s.name == namespace) {
                Some(source) => patch.apply_to(&mut source.labels),
                None => {
                    return Err(TransportError::Status {
                        url: format!("scripted://UpdateNamespace/{}", namespace),
                        status: 404,
                    });
                }
            }
        }
        Self::wait(gate).await;
        status
    }
}
