/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! [`MeshBackend`] over the dashboard's REST API, using `reqwest`.
//!
//! Address handling:
//! - `addr` may be `host:port` (no scheme) or an explicit
//!   `http://...` / `https://...`.
//! - An explicit scheme is authoritative. Without one, the client
//!   speaks HTTPS exactly when a CA certificate was supplied.
//!
//! Endpoints (JSON bodies):
//!
//! | call | method | path |
//! |---|---|---|
//! | namespaces | `GET` | `/api/namespaces` |
//! | health | `GET` | `/api/namespaces/{ns}/health?type=..&rateInterval=..` |
//! | mTLS | `GET` | `/api/namespaces/{ns}/tls` |
//! | validations | `GET` | `/api/namespaces/{ns}/validations` |
//! | metrics | `GET` | `/api/namespaces/{ns}/metrics?filters[]=..&duration=..` |
//! | update | `PATCH` | `/api/namespaces/{ns}` (JSON merge patch) |
//!
//! The REST API serves health per namespace, so
//! [`get_health`](MeshBackend::get_health) fans a batch out into one
//! request per namespace and fails if any of them fails.
//!
//! The health body is expected to map each entity name to an object
//! that already carries its global status, as `globalStatus` or
//! `status` (`"Failure"`, `"Degraded"`, `"Healthy"`, `"Idle"`; anything
//! else reads as not available). A server that returns only raw
//! request and workload-status counters, leaving the status to be
//! computed by the client, is not understood by this backend; put a
//! translating proxy or another [`MeshBackend`] in front of it.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::backend::HealthKind;
use crate::backend::MeshBackend;
use crate::backend::MetricsOptions;
use crate::backend::MtlsSource;
use crate::backend::NamespacePatch;
use crate::error::TransportError;
use crate::model::HealthStatus;
use crate::model::NamespaceSource;
use crate::model::TimeSeries;
use crate::model::ValidationSummary;

/// Split an address into an optional `http`/`https` scheme and the
/// remaining host part.
fn parse_addr(addr: &str) -> (Option<&str>, &str) {
    if let Some(host) = addr.strip_prefix("https://") {
        (Some("https"), host)
    } else if let Some(host) = addr.strip_prefix("http://") {
        (Some("http"), host)
    } else {
        (None, addr)
    }
}

/// Install the PEM CA at `ca_path` as the only extra trust anchor.
fn add_tls(
    builder: reqwest::ClientBuilder,
    ca_path: &Path,
) -> Result<reqwest::ClientBuilder, TransportError> {
    let ca_bytes = std::fs::read(ca_path).map_err(|e| {
        TransportError::Backend(format!("TLS: cannot read CA file {}: {}", ca_path.display(), e))
    })?;
    let root_cert = reqwest::Certificate::from_pem(&ca_bytes)
        .map_err(|e| TransportError::Backend(format!("TLS: invalid CA PEM: {}", e)))?;
    Ok(builder.add_root_certificate(root_cert))
}

/// Health of one entity as served by the health endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntityHealth {
    #[serde(alias = "status")]
    global_status: HealthStatus,
}

#[derive(Debug, Default, Deserialize)]
struct MetricsResponse {
    #[serde(default)]
    metrics: HashMap<String, MetricMatrix>,
}

#[derive(Debug, Deserialize)]
struct MetricMatrix {
    #[serde(default)]
    matrix: Vec<TimeSeries>,
}

impl MetricsResponse {
    fn into_matrices(self) -> HashMap<String, Vec<TimeSeries>> {
        self.metrics
            .into_iter()
            .map(|(name, metric)| (name, metric.matrix))
            .collect()
    }
}

fn namespaces_url(base_url: &str) -> String {
    format!("{}/api/namespaces", base_url)
}

fn health_url(base_url: &str, namespace: &str, duration: Duration, kind: HealthKind) -> String {
    format!(
        "{}/api/namespaces/{}/health?type={}&rateInterval={}s",
        base_url,
        urlencoding::encode(namespace),
        kind,
        duration.as_secs()
    )
}

fn namespace_url(base_url: &str, namespace: &str) -> String {
    format!("{}/api/namespaces/{}", base_url, urlencoding::encode(namespace))
}

fn tls_url(base_url: &str, namespace: &str) -> String {
    format!("{}/api/namespaces/{}/tls", base_url, urlencoding::encode(namespace))
}

fn validations_url(base_url: &str, namespace: &str) -> String {
    format!(
        "{}/api/namespaces/{}/validations",
        base_url,
        urlencoding::encode(namespace)
    )
}

fn metrics_url(base_url: &str, namespace: &str, options: &MetricsOptions) -> String {
    let mut query: Vec<String> = options
        .filters
        .iter()
        .map(|f| format!("filters[]={}", urlencoding::encode(f)))
        .collect();
    query.push(format!("duration={}", options.duration.as_secs()));
    query.push(format!("step={}", options.step.as_secs()));
    query.push(format!("rateInterval={}s", options.rate_interval.as_secs()));
    query.push(format!("direction={}", options.direction.as_str()));
    query.push(format!("reporter={}", options.reporter.as_str()));
    format!(
        "{}/api/namespaces/{}/metrics?{}",
        base_url,
        urlencoding::encode(namespace),
        query.join("&")
    )
}

/// HTTP client for the dashboard REST API.
#[derive(Clone, Debug)]
pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpBackend {
    /// Use a pre-built client. `base_url` includes the scheme and no
    /// trailing slash.
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Build a client for `addr`. When `tls_ca` is given the server
    /// certificate is verified against it and the default scheme
    /// becomes `https`.
    pub fn connect(
        addr: &str,
        tls_ca: Option<&Path>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let (explicit_scheme, host) = parse_addr(addr);
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(ca_path) = tls_ca {
            builder = add_tls(builder, ca_path)?;
        }
        let scheme = explicit_scheme.unwrap_or(if tls_ca.is_some() { "https" } else { "http" });
        let client = builder
            .build()
            .map_err(|e| TransportError::Backend(format!("cannot build HTTP client: {}", e)))?;
        let backend = Self::new(format!("{}://{}", scheme, host), client);
        tracing::debug!(base_url = %backend.base_url, "connected HTTP backend");
        Ok(backend)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send `request` and fail on anything but a success status.
    async fn send(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, TransportError> {
        let resp = request.send().await.map_err(|e| TransportError::Request {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(resp)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, TransportError> {
        tracing::trace!(%url, "GET");
        let resp = self.send(&url, self.client.get(&url)).await?;
        resp.json::<T>().await.map_err(|e| TransportError::Decode {
            url,
            message: e.to_string(),
        })
    }

    async fn patch_json<B: Serialize + ?Sized>(
        &self,
        url: String,
        body: &B,
    ) -> Result<(), TransportError> {
        tracing::trace!(%url, "PATCH");
        self.send(&url, self.client.patch(&url).json(body)).await?;
        Ok(())
    }
}

#[async_trait]
impl MeshBackend for HttpBackend {
    async fn list_namespaces(&self) -> Result<Vec<NamespaceSource>, TransportError> {
        self.get_json(namespaces_url(&self.base_url)).await
    }

    async fn get_health(
        &self,
        namespaces: &[String],
        duration: Duration,
        kind: HealthKind,
    ) -> Result<HashMap<String, BTreeMap<String, HealthStatus>>, TransportError> {
        let per_namespace = try_join_all(namespaces.iter().map(|ns| async move {
            let url = health_url(&self.base_url, ns, duration, kind);
            let entities: HashMap<String, EntityHealth> = self.get_json(url).await?;
            let statuses = entities
                .into_iter()
                .map(|(entity, health)| (entity, health.global_status))
                .collect::<BTreeMap<_, _>>();
            Ok::<_, TransportError>((ns.clone(), statuses))
        }))
        .await?;
        Ok(per_namespace.into_iter().collect())
    }

    async fn get_mtls_status(&self, namespace: &str) -> Result<MtlsSource, TransportError> {
        self.get_json(tls_url(&self.base_url, namespace)).await
    }

    async fn get_validations(&self, namespace: &str) -> Result<ValidationSummary, TransportError> {
        self.get_json(validations_url(&self.base_url, namespace))
            .await
    }

    async fn get_metrics(
        &self,
        namespace: &str,
        options: &MetricsOptions,
    ) -> Result<HashMap<String, Vec<TimeSeries>>, TransportError> {
        let response: MetricsResponse = self
            .get_json(metrics_url(&self.base_url, namespace, options))
            .await?;
        Ok(response.into_matrices())
    }

    async fn update_namespace(
        &self,
        namespace: &str,
        patch: &NamespacePatch,
    ) -> Result<(), TransportError> {
        self.patch_json(namespace_url(&self.base_url, namespace), patch)
            .await
    }
}
