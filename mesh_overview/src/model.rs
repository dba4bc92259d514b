/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! View-model types for the namespace overview.
//!
//! A [`NamespaceRecord`] is keyed by namespace name and carries up to
//! four independently fetched facets. Every facet is an `Option`:
//! `None` means "not known yet", never "zero".

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// A namespace as listed by the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSource {
    /// Namespace name; the record identity.
    pub name: String,
    /// Labels from the source of truth. Never mutated by the
    /// pipeline.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl NamespaceSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Global health of one monitored entity (app, service or workload).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    Failure,
    Degraded,
    Healthy,
    Idle,
    /// Anything the backend could not classify.
    #[serde(other, rename = "NA")]
    NotAvailable,
}

/// Entities of a namespace partitioned by health. The buckets are
/// disjoint: each entity lands in exactly one of them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBuckets {
    pub in_idle: Vec<String>,
    pub in_error: Vec<String>,
    pub in_warning: Vec<String>,
    pub in_success: Vec<String>,
    pub not_available: Vec<String>,
}

impl StatusBuckets {
    /// Bucket entities by their global health status.
    pub fn classify<I, S>(entities: I) -> Self
    where
        I: IntoIterator<Item = (S, HealthStatus)>,
        S: Into<String>,
    {
        let mut buckets = Self::default();
        for (entity, status) in entities {
            let bucket = match status {
                HealthStatus::Failure => &mut buckets.in_error,
                HealthStatus::Degraded => &mut buckets.in_warning,
                HealthStatus::Healthy => &mut buckets.in_success,
                HealthStatus::Idle => &mut buckets.in_idle,
                HealthStatus::NotAvailable => &mut buckets.not_available,
            };
            bucket.push(entity.into());
        }
        buckets
    }

    /// True when no entity is in error, warning, success or
    /// unavailable. Idle entities do not count.
    pub fn is_empty(&self) -> bool {
        self.in_error.len()
            + self.in_success.len()
            + self.in_warning.len()
            + self.not_available.len()
            == 0
    }

    pub fn total(&self) -> usize {
        self.in_idle.len()
            + self.in_error.len()
            + self.in_warning.len()
            + self.in_success.len()
            + self.not_available.len()
    }
}

/// mTLS posture of a namespace.
///
/// Declaration order is the sort order used by the mTLS comparator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MtlsState {
    #[serde(rename = "MTLS_ENABLED")]
    Enabled,
    #[serde(rename = "MTLS_PARTIALLY_ENABLED")]
    PartiallyEnabled,
    #[serde(rename = "MTLS_NOT_ENABLED")]
    NotEnabled,
    #[serde(rename = "MTLS_DISABLED")]
    Disabled,
}

impl MtlsState {
    /// Resolve the status shown for a namespace given the mesh-wide
    /// status: a namespace that does not enable mTLS itself inherits
    /// a mesh-wide `Enabled`.
    pub fn namespace_wide(namespace: MtlsState, mesh: MtlsState) -> MtlsState {
        match (namespace, mesh) {
            (MtlsState::NotEnabled, MtlsState::Enabled) => MtlsState::Enabled,
            (namespace, _) => namespace,
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            MtlsState::Enabled => "MTLS_ENABLED",
            MtlsState::PartiallyEnabled => "MTLS_PARTIALLY_ENABLED",
            MtlsState::NotEnabled => "MTLS_NOT_ENABLED",
            MtlsState::Disabled => "MTLS_DISABLED",
        }
    }
}

impl fmt::Display for MtlsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MtlsState::Enabled => "enabled",
            MtlsState::PartiallyEnabled => "partial",
            MtlsState::NotEnabled => "not-enabled",
            MtlsState::Disabled => "disabled",
        })
    }
}

impl FromStr for MtlsState {
    type Err = String;

    /// Accepts both the short display names and the wire names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "enabled" | "full" | "mtls_enabled" => Ok(MtlsState::Enabled),
            "partial" | "partially-enabled" | "mtls_partially_enabled" => {
                Ok(MtlsState::PartiallyEnabled)
            }
            "not-enabled" | "none" | "mtls_not_enabled" => Ok(MtlsState::NotEnabled),
            "disabled" | "mtls_disabled" => Ok(MtlsState::Disabled),
            other => Err(format!("unknown mTLS state {:?}", other)),
        }
    }
}

/// Istio config validation counts for a namespace.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationSummary {
    pub errors: u32,
    pub warnings: u32,
    /// Number of objects that were validated.
    pub object_count: u32,
}

/// One series of a rate matrix.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    #[serde(rename = "metric", default)]
    pub labels: BTreeMap<String, String>,
    /// `(unix seconds, value)` pairs.
    #[serde(rename = "values", default)]
    pub samples: Vec<(f64, f64)>,
}

/// Mean of every finite sample across all series of a matrix.
///
/// A matrix with no samples means the namespace served no traffic,
/// so it averages to `0.0`.
pub fn mean_rate(matrix: &[TimeSeries]) -> f64 {
    let (sum, count) = matrix
        .iter()
        .flat_map(|series| series.samples.iter())
        .map(|(_, value)| *value)
        .filter(|value| value.is_finite())
        .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

/// One independently fetched dimension of a namespace's status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facet {
    Health,
    Tls,
    Validations,
    Metrics,
}

impl Facet {
    pub const ALL: [Facet; 4] = [Facet::Health, Facet::Tls, Facet::Validations, Facet::Metrics];

    /// Registry key prefix for this facet's batches.
    pub fn key(self) -> &'static str {
        match self {
            Facet::Health => "health-chunk",
            Facet::Tls => "tls-chunk",
            Facet::Validations => "validation-chunk",
            Facet::Metrics => "metrics-chunk",
        }
    }

    /// Human readable prefix for errors reported on this facet.
    pub fn failure_context(self) -> &'static str {
        match self {
            Facet::Health => "Could not fetch health",
            Facet::Tls => "Could not fetch TLS status",
            Facet::Validations => "Could not fetch validations status",
            Facet::Metrics => "Could not fetch metrics",
        }
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Facet::Health => "health",
            Facet::Tls => "mTLS",
            Facet::Validations => "validations",
            Facet::Metrics => "metrics",
        })
    }
}

/// A freshly fetched value for one facet of one namespace.
#[derive(Clone, Debug, PartialEq)]
pub enum FacetValue {
    Health(StatusBuckets),
    Tls(MtlsState),
    Validations(ValidationSummary),
    /// `None` when the backend returned no request-rate matrix; this
    /// clears the facet.
    Metrics(Option<Vec<TimeSeries>>),
}

impl FacetValue {
    pub fn facet(&self) -> Facet {
        match self {
            FacetValue::Health(_) => Facet::Health,
            FacetValue::Tls(_) => Facet::Tls,
            FacetValue::Validations(_) => Facet::Validations,
            FacetValue::Metrics(_) => Facet::Metrics,
        }
    }
}

/// Per-namespace view model.
#[derive(Clone, Debug, PartialEq)]
pub struct NamespaceRecord {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub status: Option<StatusBuckets>,
    pub tls_status: Option<MtlsState>,
    pub validations: Option<ValidationSummary>,
    pub metrics: Option<Vec<TimeSeries>>,
}

impl NamespaceRecord {
    /// A record with every facet absent.
    pub fn new(source: NamespaceSource) -> Self {
        Self {
            name: source.name,
            labels: source.labels,
            status: None,
            tls_status: None,
            validations: None,
            metrics: None,
        }
    }

    /// Whether sidecar auto injection is on, i.e. the namespace
    /// carries `injection_label` with any value.
    pub fn auto_injection(&self, injection_label: &str) -> bool {
        self.labels.contains_key(injection_label)
    }

    /// Rebuild a record from a fresh listing, keeping the facet
    /// values of `previous` until new ones arrive. Labels always come
    /// from `source`.
    pub fn carry_forward(source: NamespaceSource, previous: Option<&NamespaceRecord>) -> Self {
        let mut record = Self::new(source);
        if let Some(previous) = previous {
            record.status = previous.status.clone();
            record.tls_status = previous.tls_status;
            record.validations = previous.validations;
            record.metrics = previous.metrics.clone();
        }
        record
    }

    /// Overwrite the one field `value` belongs to.
    pub fn apply(&mut self, value: FacetValue) {
        match value {
            FacetValue::Health(status) => self.status = Some(status),
            FacetValue::Tls(state) => self.tls_status = Some(state),
            FacetValue::Validations(summary) => self.validations = Some(summary),
            FacetValue::Metrics(matrix) => self.metrics = matrix,
        }
    }

    pub fn has_facet(&self, facet: Facet) -> bool {
        match facet {
            Facet::Health => self.status.is_some(),
            Facet::Tls => self.tls_status.is_some(),
            Facet::Validations => self.validations.is_some(),
            Facet::Metrics => self.metrics.is_some(),
        }
    }

    /// Health is known and the namespace has no monitored entities.
    pub fn is_empty(&self) -> bool {
        self.status.as_ref().is_some_and(StatusBuckets::is_empty)
    }
}
