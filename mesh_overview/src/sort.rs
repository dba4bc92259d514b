/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Comparators over [`NamespaceRecord`]s.
//!
//! Every field comparator is a total order: a primary key, then a
//! tie-break chain that always ends in the namespace name. Records
//! with a known facet value order before records where the facet is
//! still absent. Descending order swaps the comparator arguments.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::model::Facet;
use crate::model::NamespaceRecord;
use crate::model::mean_rate;

/// Field the namespace list can be sorted by.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    #[default]
    Name,
    Health,
    Mtls,
    Validations,
    Metrics,
}

impl SortField {
    /// The facet whose merges can change this field's order.
    pub fn facet(self) -> Option<Facet> {
        match self {
            SortField::Name => None,
            SortField::Health => Some(Facet::Health),
            SortField::Mtls => Some(Facet::Tls),
            SortField::Validations => Some(Facet::Validations),
            SortField::Metrics => Some(Facet::Metrics),
        }
    }

    pub fn id(self) -> &'static str {
        match self {
            SortField::Name => "name",
            SortField::Health => "health",
            SortField::Mtls => "mtls",
            SortField::Validations => "validations",
            SortField::Metrics => "metrics",
        }
    }

    pub fn compare(self, a: &NamespaceRecord, b: &NamespaceRecord) -> Ordering {
        match self {
            SortField::Name => compare_names(a, b),
            SortField::Health => compare_health(a, b),
            SortField::Mtls => compare_mtls(a, b),
            SortField::Validations => compare_validations(a, b),
            SortField::Metrics => compare_metrics(a, b),
        }
    }
}

impl fmt::Display for SortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "name" | "namespace" => Ok(SortField::Name),
            "health" => Ok(SortField::Health),
            "mtls" | "tls" => Ok(SortField::Mtls),
            "validations" | "config" => Ok(SortField::Validations),
            "metrics" | "traffic" => Ok(SortField::Metrics),
            other => Err(format!("unknown sort field {:?}", other)),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl FromStr for SortDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortDirection::Ascending),
            "desc" | "descending" => Ok(SortDirection::Descending),
            other => Err(format!("unknown sort direction {:?}", other)),
        }
    }
}

/// The active sort: a field and a direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: SortField,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn new(field: SortField, direction: SortDirection) -> Self {
        Self { field, direction }
    }

    /// Compare two records under this spec. Descending swaps the
    /// arguments rather than reversing the result.
    pub fn compare(&self, a: &NamespaceRecord, b: &NamespaceRecord) -> Ordering {
        match self.direction {
            SortDirection::Ascending => self.field.compare(a, b),
            SortDirection::Descending => self.field.compare(b, a),
        }
    }

    /// True when merging `facet` can change the order under this
    /// spec.
    pub fn depends_on(&self, facet: Facet) -> bool {
        self.field.facet() == Some(facet)
    }
}

/// Sort `records` in place.
pub fn sort_records(records: &mut [NamespaceRecord], spec: SortSpec) {
    records.sort_by(|a, b| spec.compare(a, b));
}

/// Known values first, absent values last; `None` means both are
/// known and the caller decides.
fn presence<T>(a: &Option<T>, b: &Option<T>) -> Option<Ordering> {
    match (a, b) {
        (Some(_), Some(_)) => None,
        (Some(_), None) => Some(Ordering::Less),
        (None, Some(_)) => Some(Ordering::Greater),
        (None, None) => Some(Ordering::Equal),
    }
}

fn compare_names(a: &NamespaceRecord, b: &NamespaceRecord) -> Ordering {
    natural_name_cmp(&a.name, &b.name)
}

/// More errors first, then more warnings, then name.
fn compare_health(a: &NamespaceRecord, b: &NamespaceRecord) -> Ordering {
    let primary = match (&a.status, &b.status) {
        (Some(sa), Some(sb)) => sb
            .in_error
            .len()
            .cmp(&sa.in_error.len())
            .then_with(|| sb.in_warning.len().cmp(&sa.in_warning.len())),
        (sa, sb) => presence(sa, sb).unwrap_or(Ordering::Equal),
    };
    primary.then_with(|| compare_names(a, b))
}

fn compare_mtls(a: &NamespaceRecord, b: &NamespaceRecord) -> Ordering {
    let primary = match (&a.tls_status, &b.tls_status) {
        (Some(ta), Some(tb)) => ta.cmp(tb),
        (ta, tb) => presence(ta, tb).unwrap_or(Ordering::Equal),
    };
    primary.then_with(|| compare_names(a, b))
}

/// More errors first, then more warnings, then name.
fn compare_validations(a: &NamespaceRecord, b: &NamespaceRecord) -> Ordering {
    let primary = match (&a.validations, &b.validations) {
        (Some(va), Some(vb)) => vb
            .errors
            .cmp(&va.errors)
            .then_with(|| vb.warnings.cmp(&va.warnings)),
        (va, vb) => presence(va, vb).unwrap_or(Ordering::Equal),
    };
    primary.then_with(|| compare_names(a, b))
}

/// Lower mean request rate first, then name.
fn compare_metrics(a: &NamespaceRecord, b: &NamespaceRecord) -> Ordering {
    let primary = match (&a.metrics, &b.metrics) {
        (Some(ma), Some(mb)) => mean_rate(ma).total_cmp(&mean_rate(mb)),
        (ma, mb) => presence(ma, mb).unwrap_or(Ordering::Equal),
    };
    primary.then_with(|| compare_names(a, b))
}

/// A run of digits or a run of non-digits within a name.
///
/// Numbers order before text; numbers compare by significant length
/// and then by digits, so `2` < `10` and `007` == `7`.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Segment<'a> {
    Number(usize, &'a str),
    Text(&'a str),
}

fn segments(s: &str) -> impl Iterator<Item = Segment<'_>> {
    let mut rest = s;
    std::iter::from_fn(move || {
        let first = rest.chars().next()?;
        let digit = first.is_ascii_digit();
        let end = rest
            .find(|c: char| c.is_ascii_digit() != digit)
            .unwrap_or(rest.len());
        let (run, tail) = rest.split_at(end);
        rest = tail;
        Some(if digit {
            let significant = run.trim_start_matches('0');
            Segment::Number(significant.len(), significant)
        } else {
            Segment::Text(run)
        })
    })
}

/// Compare names using a "natural" order for embedded numbers, so
/// `team-2` sorts before `team-10`. Names that are naturally equal
/// (`ns-07` and `ns-7`) fall back to plain byte order, keeping the
/// order total.
pub fn natural_name_cmp(a: &str, b: &str) -> Ordering {
    segments(a).cmp(segments(b)).then_with(|| a.cmp(b))
}
