/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Error types for the overview pipeline.
//!
//! Cancellation has no [`OverviewError`] variant: a
//! cancelled batch is discarded by the registry and never surfaces.

use crate::model::Facet;

/// A backend call failed.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The request never produced a response.
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },

    /// The backend answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    /// The response body could not be decoded.
    #[error("parse error from {url}: {message}")]
    Decode { url: String, message: String },

    /// Some other backend failure.
    #[error("{0}")]
    Backend(String),
}

/// Errors reported by the pipeline on its alert channel, or returned
/// from its entry points.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum OverviewError {
    /// A backend call for one batch (or the namespace listing) failed.
    #[error("{context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: TransportError,
    },

    /// Patching a namespace failed.
    #[error("Could not update namespace {namespace}: {source}")]
    UpdateNamespace {
        namespace: String,
        #[source]
        source: TransportError,
    },

    /// Every batch of `facet` has settled for this cycle, and the
    /// facet could not be refreshed for `namespaces`.
    #[error(
        "{facet} unavailable for {} namespace(s): {}",
        .namespaces.len(),
        .namespaces.join(", ")
    )]
    PartialData {
        facet: Facet,
        namespaces: Vec<String>,
    },

    /// The pipeline was torn down and accepts no more work.
    #[error("overview pipeline has been torn down")]
    TornDown,
}

impl OverviewError {
    pub fn transport(context: &'static str, source: TransportError) -> Self {
        OverviewError::Transport { context, source }
    }
}

/// Invalid configuration value.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidEnv {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("batch size must be greater than zero")]
    ZeroBatchSize,
}
