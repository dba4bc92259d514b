/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Configuration for the overview pipeline.
//!
//! Each field has a default and an environment variable that
//! overrides it. Durations use humantime syntax (`10m`, `15s`).

use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::backend::HealthKind;
use crate::backend::MetricsOptions;
use crate::error::ConfigError;
use crate::model::MtlsState;

/// Namespaces per batch, for every facet.
pub const BATCH_SIZE_ENV: &str = "MESH_OVERVIEW_BATCH_SIZE";
/// Time window for health and metrics queries.
pub const DURATION_ENV: &str = "MESH_OVERVIEW_DURATION";
/// Entity kind health is computed for: `app`, `service` or `workload`.
pub const HEALTH_KIND_ENV: &str = "MESH_OVERVIEW_HEALTH_KIND";
/// Above this many namespaces a reload picks the compact display mode.
pub const COMPACT_THRESHOLD_ENV: &str = "MESH_OVERVIEW_COMPACT_THRESHOLD";
/// Points per metrics series.
pub const METRICS_DATA_POINTS_ENV: &str = "MESH_OVERVIEW_METRICS_DATA_POINTS";
/// Prometheus scrape interval; lower bound for the metrics step.
pub const SCRAPE_INTERVAL_ENV: &str = "MESH_OVERVIEW_SCRAPE_INTERVAL";
/// Mesh-wide mTLS status.
pub const MESH_MTLS_ENV: &str = "MESH_OVERVIEW_MESH_MTLS";
/// Namespace label that turns on sidecar auto injection.
pub const INJECTION_LABEL_ENV: &str = "MESH_OVERVIEW_INJECTION_LABEL";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverviewConfig {
    pub batch_size: NonZeroUsize,
    #[serde(with = "humantime_secs")]
    pub duration: Duration,
    pub health_kind: HealthKind,
    pub compact_threshold: usize,
    pub metrics_data_points: u32,
    #[serde(with = "humantime_secs")]
    pub scrape_interval: Duration,
    pub mesh_mtls: MtlsState,
    pub injection_label: String,
}

impl Default for OverviewConfig {
    fn default() -> Self {
        Self {
            batch_size: NonZeroUsize::new(10).unwrap_or(NonZeroUsize::MIN),
            duration: Duration::from_secs(600),
            health_kind: HealthKind::App,
            compact_threshold: 16,
            metrics_data_points: 10,
            scrape_interval: Duration::from_secs(15),
            mesh_mtls: MtlsState::NotEnabled,
            injection_label: "istio-injection".to_string(),
        }
    }
}

impl OverviewConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from `lookup`, keyed by environment variable
    /// name. Unset variables keep the current value.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(BATCH_SIZE_ENV) {
            let size: usize = parse_env(BATCH_SIZE_ENV, &value)?;
            self.batch_size = NonZeroUsize::new(size).ok_or(ConfigError::ZeroBatchSize)?;
        }
        if let Some(value) = lookup(DURATION_ENV) {
            self.duration = parse_duration(DURATION_ENV, &value)?;
        }
        if let Some(value) = lookup(HEALTH_KIND_ENV) {
            self.health_kind = parse_env(HEALTH_KIND_ENV, &value)?;
        }
        if let Some(value) = lookup(COMPACT_THRESHOLD_ENV) {
            self.compact_threshold = parse_env(COMPACT_THRESHOLD_ENV, &value)?;
        }
        if let Some(value) = lookup(METRICS_DATA_POINTS_ENV) {
            self.metrics_data_points = parse_env(METRICS_DATA_POINTS_ENV, &value)?;
        }
        if let Some(value) = lookup(SCRAPE_INTERVAL_ENV) {
            self.scrape_interval = parse_duration(SCRAPE_INTERVAL_ENV, &value)?;
        }
        if let Some(value) = lookup(MESH_MTLS_ENV) {
            self.mesh_mtls = parse_env(MESH_MTLS_ENV, &value)?;
        }
        if let Some(value) = lookup(INJECTION_LABEL_ENV) {
            let label = value.trim();
            if label.is_empty() {
                return Err(ConfigError::InvalidEnv {
                    var: INJECTION_LABEL_ENV,
                    value,
                    reason: "label name is empty".to_string(),
                });
            }
            self.injection_label = label.to_string();
        }
        Ok(self)
    }

    pub fn metrics_options(&self) -> MetricsOptions {
        MetricsOptions::request_rate(
            self.duration,
            self.metrics_data_points,
            self.scrape_interval,
        )
    }
}

fn parse_env<T>(var: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn parse_duration(var: &'static str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|e| ConfigError::InvalidEnv {
        var,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Serialize durations as humantime strings.
mod humantime_secs {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
