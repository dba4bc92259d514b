/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The query surface the pipeline consumes.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::error::TransportError;
use crate::model::HealthStatus;
use crate::model::MtlsState;
use crate::model::NamespaceSource;
use crate::model::TimeSeries;
use crate::model::ValidationSummary;

/// Metric name of the inbound request rate.
pub const REQUEST_COUNT: &str = "request_count";

/// Which kind of entity health is computed for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthKind {
    #[default]
    App,
    Service,
    Workload,
}

impl HealthKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthKind::App => "app",
            HealthKind::Service => "service",
            HealthKind::Workload => "workload",
        }
    }
}

impl fmt::Display for HealthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "app" | "apps" => Ok(HealthKind::App),
            "service" | "services" => Ok(HealthKind::Service),
            "workload" | "workloads" => Ok(HealthKind::Workload),
            other => Err(format!("unknown health kind {:?}", other)),
        }
    }
}

/// Namespace mTLS status as reported by the backend, before the
/// mesh-wide status is folded in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MtlsSource {
    pub status: MtlsState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reporter {
    Source,
    Destination,
}

impl Reporter {
    pub fn as_str(self) -> &'static str {
        match self {
            Reporter::Source => "source",
            Reporter::Destination => "destination",
        }
    }
}

/// Value the injection label is set to when auto injection is enabled.
pub const INJECTION_ENABLED: &str = "enabled";

/// A JSON merge patch against a namespace. Only labels can be
/// patched; a `None` value removes the label.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespacePatch {
    pub metadata: PatchMetadata,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchMetadata {
    pub labels: BTreeMap<String, Option<String>>,
}

impl NamespacePatch {
    /// Turn sidecar auto injection on or off by setting or removing
    /// `label`.
    pub fn injection(label: &str, enable: bool) -> Self {
        let value = enable.then(|| INJECTION_ENABLED.to_string());
        Self {
            metadata: PatchMetadata {
                labels: BTreeMap::from([(label.to_string(), value)]),
            },
        }
    }

    /// Apply the patch to `labels`.
    pub fn apply_to(&self, labels: &mut BTreeMap<String, String>) {
        for (key, value) in &self.metadata.labels {
            match value {
                Some(value) => {
                    labels.insert(key.clone(), value.clone());
                }
                None => {
                    labels.remove(key);
                }
            }
        }
    }
}

/// Query options for a namespace metrics request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricsOptions {
    pub filters: Vec<String>,
    pub duration: Duration,
    pub step: Duration,
    pub rate_interval: Duration,
    pub direction: Direction,
    pub reporter: Reporter,
}

impl MetricsOptions {
    /// Inbound request rate as seen by the destination, sampled at
    /// roughly `data_points` points over `duration`.
    ///
    /// The step never goes below the scrape interval, and the rate
    /// window always spans at least two scrapes.
    pub fn request_rate(duration: Duration, data_points: u32, scrape_interval: Duration) -> Self {
        let step = (duration / data_points.max(1)).max(scrape_interval);
        let step = Duration::from_secs(step.as_secs().max(1));
        let rate_interval = step.max(scrape_interval.saturating_mul(2));
        Self {
            filters: vec![REQUEST_COUNT.to_string()],
            duration,
            step,
            rate_interval,
            direction: Direction::Inbound,
            reporter: Reporter::Destination,
        }
    }
}

/// Backend data service.
///
/// Every call may fail on its own; the pipeline isolates failures
/// per batch.
#[async_trait]
pub trait MeshBackend: Send + Sync + 'static {
    async fn list_namespaces(&self) -> Result<Vec<NamespaceSource>, TransportError>;

    /// Health of every `kind` entity in each of `namespaces`, keyed by
    /// namespace and then entity name. Namespaces the backend knows
    /// nothing about may be missing from the result.
    async fn get_health(
        &self,
        namespaces: &[String],
        duration: Duration,
        kind: HealthKind,
    ) -> Result<HashMap<String, BTreeMap<String, HealthStatus>>, TransportError>;

    async fn get_mtls_status(&self, namespace: &str) -> Result<MtlsSource, TransportError>;

    async fn get_validations(&self, namespace: &str) -> Result<ValidationSummary, TransportError>;

    /// Rate matrices keyed by metric name.
    async fn get_metrics(
        &self,
        namespace: &str,
        options: &MetricsOptions,
    ) -> Result<HashMap<String, Vec<TimeSeries>>, TransportError>;

    /// Patch the labels of `namespace`.
    async fn update_namespace(
        &self,
        namespace: &str,
        patch: &NamespacePatch,
    ) -> Result<(), TransportError>;
}
