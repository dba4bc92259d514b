/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use serde::Deserialize;
use serde::Serialize;

use crate::model::MtlsState;
use crate::model::NamespaceRecord;

/// Health condition a namespace must show to pass a health filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthFilter {
    /// At least one entity in error.
    Failure,
    /// At least one entity degraded.
    Degraded,
    /// At least one healthy entity.
    Healthy,
    /// Health is known and there are no monitored entities.
    NoEntities,
}

/// A single predicate over a namespace record.
///
/// Predicates on a facet never match a record whose facet is still
/// absent: "not fetched yet" is not the same as "zero".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamespaceFilter {
    /// Name contains any of the given substrings.
    NameContains(Vec<String>),
    /// Label `key` is present, and equals `value` when one is given.
    Label { key: String, value: Option<String> },
    Health(HealthFilter),
    Mtls(MtlsState),
}

impl NamespaceFilter {
    pub fn matches(&self, record: &NamespaceRecord) -> bool {
        match self {
            NamespaceFilter::NameContains(needles) => needles
                .iter()
                .any(|needle| record.name.contains(needle.as_str())),
            NamespaceFilter::Label { key, value } => match (record.labels.get(key), value) {
                (Some(actual), Some(expected)) => actual == expected,
                (Some(_), None) => true,
                (None, _) => false,
            },
            NamespaceFilter::Health(wanted) => {
                record.status.as_ref().is_some_and(|status| match wanted {
                    HealthFilter::Failure => !status.in_error.is_empty(),
                    HealthFilter::Degraded => !status.in_warning.is_empty(),
                    HealthFilter::Healthy => !status.in_success.is_empty(),
                    HealthFilter::NoEntities => status.is_empty(),
                })
            }
            NamespaceFilter::Mtls(wanted) => record.tls_status == Some(*wanted),
        }
    }
}

/// Active filters, combined with AND. An empty set passes everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
    filters: Vec<NamespaceFilter>,
}

impl FilterSet {
    pub fn new(filters: Vec<NamespaceFilter>) -> Self {
        Self { filters }
    }

    pub fn matches(&self, record: &NamespaceRecord) -> bool {
        self.filters.iter().all(|f| f.matches(record))
    }

    /// The records that pass, in their current order. Never mutates
    /// the records.
    pub fn project<'a>(&self, records: &'a [NamespaceRecord]) -> Vec<&'a NamespaceRecord> {
        records.iter().filter(|r| self.matches(r)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamespaceFilter> {
        self.filters.iter()
    }
}

impl From<Vec<NamespaceFilter>> for FilterSet {
    fn from(filters: Vec<NamespaceFilter>) -> Self {
        Self::new(filters)
    }
}

impl FromIterator<NamespaceFilter> for FilterSet {
    fn from_iter<I: IntoIterator<Item = NamespaceFilter>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
