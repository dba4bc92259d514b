/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The shared namespace view model.
//!
//! [`NamespaceView`] owns the ordered record list, the active sort
//! and the active filters. It changes in exactly two ways: a
//! wholesale [`rebuild`](NamespaceView::rebuild) on reload, and a
//! per-facet [`merge`](NamespaceView::merge) when a batch lands.

use std::collections::HashMap;
use std::collections::HashSet;

use crate::filter::FilterSet;
use crate::model::Facet;
use crate::model::FacetValue;
use crate::model::NamespaceRecord;
use crate::model::NamespaceSource;
use crate::sort::SortSpec;
use crate::sort::sort_records;

#[derive(Clone, Debug, Default)]
pub struct NamespaceView {
    records: Vec<NamespaceRecord>,
    sort: SortSpec,
    filters: FilterSet,
}

impl NamespaceView {
    pub fn new(sort: SortSpec, filters: FilterSet) -> Self {
        Self {
            records: Vec::new(),
            sort,
            filters,
        }
    }

    /// All records, in display order, ignoring filters.
    pub fn records(&self) -> &[NamespaceRecord] {
        &self.records
    }

    pub fn sort(&self) -> SortSpec {
        self.sort
    }

    pub fn filters(&self) -> &FilterSet {
        &self.filters
    }

    /// The filtered projection, in display order.
    pub fn visible(&self) -> Vec<&NamespaceRecord> {
        self.filters.project(&self.records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Replace the record list from a fresh listing.
    ///
    /// Namespaces already known keep their facet values until new
    /// ones arrive; a name listed twice keeps its first occurrence.
    /// The rebuilt list is always sorted.
    pub fn rebuild(&mut self, sources: Vec<NamespaceSource>) {
        let previous: HashMap<&str, &NamespaceRecord> = self
            .records
            .iter()
            .map(|r| (r.name.as_str(), r))
            .collect();
        let mut seen = HashSet::with_capacity(sources.len());
        let mut rebuilt = Vec::with_capacity(sources.len());
        for source in sources {
            if !seen.insert(source.name.clone()) {
                tracing::warn!(namespace = %source.name, "duplicate namespace in listing");
                continue;
            }
            let prior = previous.get(source.name.as_str()).copied();
            rebuilt.push(NamespaceRecord::carry_forward(source, prior));
        }
        sort_records(&mut rebuilt, self.sort);
        self.records = rebuilt;
    }

    /// Apply one batch of `facet` values. Only that facet's field of
    /// the named records is written; names not in the list are
    /// ignored. Resorts when the active sort reads `facet`, and
    /// returns whether it did.
    pub fn merge(&mut self, facet: Facet, values: Vec<(String, FacetValue)>) -> bool {
        let positions: HashMap<&str, usize> = self
            .records
            .iter()
            .enumerate()
            .map(|(index, r)| (r.name.as_str(), index))
            .collect();
        let mut updates = Vec::with_capacity(values.len());
        for (name, value) in values {
            if value.facet() != facet {
                tracing::warn!(%facet, namespace = %name, "dropping value for another facet");
                continue;
            }
            match positions.get(name.as_str()) {
                Some(&index) => updates.push((index, value)),
                None => tracing::debug!(%facet, namespace = %name, "namespace no longer listed"),
            }
        }
        for (index, value) in updates {
            self.records[index].apply(value);
        }
        if self.sort.depends_on(facet) {
            self.resort();
            true
        } else {
            false
        }
    }

    pub fn set_sort(&mut self, sort: SortSpec) {
        self.sort = sort;
        self.resort();
    }

    pub fn resort(&mut self) {
        sort_records(&mut self.records, self.sort);
    }

    pub fn set_filters(&mut self, filters: FilterSet) {
        self.filters = filters;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::NamespaceFilter;
    use crate::model::HealthStatus;
    use crate::model::MtlsState;
    use crate::model::StatusBuckets;
    use crate::model::TimeSeries;
    use crate::sort::SortDirection;
    use crate::sort::SortField;

    fn view(names: &[&str], field: SortField) -> NamespaceView {
        let mut view = NamespaceView::new(
            SortSpec::new(field, SortDirection::Ascending),
            FilterSet::default(),
        );
        view.rebuild(names.iter().map(|n| NamespaceSource::new(*n)).collect());
        view
    }

    fn names(view: &NamespaceView) -> Vec<&str> {
        view.records().iter().map(|r| r.name.as_str()).collect()
    }

    fn rate(ns: &str, value: f64) -> (String, FacetValue) {
        (
            ns.to_string(),
            FacetValue::Metrics(Some(vec![TimeSeries {
                labels: Default::default(),
                samples: vec![(0.0, value)],
            }])),
        )
    }

    fn health(ns: &str, errors: usize) -> (String, FacetValue) {
        (
            ns.to_string(),
            FacetValue::Health(StatusBuckets::classify(
                (0..errors).map(|i| (format!("app-{i}"), HealthStatus::Failure)),
            )),
        )
    }

    #[test]
    fn rebuild_dedupes_and_sorts() {
        let view = view(&["b", "a", "b", "c"], SortField::Name);
        assert_eq!(names(&view), vec!["a", "b", "c"]);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut once = view(&["a", "b"], SortField::Name);
        let batch = vec![health("a", 2), health("b", 0)];
        once.merge(Facet::Health, batch.clone());
        let mut twice = once.clone();
        twice.merge(Facet::Health, batch);
        assert_eq!(once.records(), twice.records());
    }

    #[test]
    fn facets_commute() {
        let health_batch = vec![health("a", 1)];
        let tls_batch = vec![("a".to_string(), FacetValue::Tls(MtlsState::Enabled))];

        let mut first = view(&["a", "b"], SortField::Name);
        first.merge(Facet::Health, health_batch.clone());
        first.merge(Facet::Tls, tls_batch.clone());

        let mut second = view(&["a", "b"], SortField::Name);
        second.merge(Facet::Tls, tls_batch);
        second.merge(Facet::Health, health_batch);

        assert_eq!(first.records(), second.records());
    }

    #[test]
    fn unrelated_facet_does_not_reorder() {
        let mut view = view(&["a", "b", "c"], SortField::Name);
        let resorted = view.merge(Facet::Metrics, vec![rate("a", 100.0), rate("c", 1.0)]);
        assert!(!resorted);
        assert_eq!(names(&view), vec!["a", "b", "c"]);
    }

    #[test]
    fn relevant_facet_reorders_immediately() {
        let mut view = view(&["a", "b", "c"], SortField::Metrics);
        let resorted = view.merge(
            Facet::Metrics,
            vec![rate("a", 100.0), rate("b", 5.0), rate("c", 1.0)],
        );
        assert!(resorted);
        assert_eq!(names(&view), vec!["c", "b", "a"]);
    }

    #[test]
    fn stale_values_survive_rebuild() {
        let mut view = view(&["ns1", "ns2"], SortField::Name);
        view.merge(Facet::Health, vec![health("ns1", 3)]);
        let before = view.records()[0].status.clone();
        assert!(before.is_some());

        view.rebuild(vec![NamespaceSource::new("ns1"), NamespaceSource::new("ns3")]);
        assert_eq!(names(&view), vec!["ns1", "ns3"]);
        assert_eq!(view.records()[0].status, before);
        assert!(view.records()[1].status.is_none());
    }

    #[test]
    fn unknown_names_and_foreign_facets_are_ignored() {
        let mut view = view(&["a"], SortField::Name);
        let snapshot = view.records().to_vec();
        view.merge(Facet::Health, vec![health("gone", 1)]);
        view.merge(
            Facet::Health,
            vec![("a".to_string(), FacetValue::Tls(MtlsState::Disabled))],
        );
        assert_eq!(view.records(), snapshot.as_slice());
    }

    #[test]
    fn merge_targets_records_in_a_large_list() {
        let names: Vec<String> = (0..2000).map(|i| format!("ns-{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut view = view(&refs, SortField::Name);

        // Out of list order, with a name that is not listed.
        let batch = vec![health("ns-1999", 4), health("missing", 1), health("ns-7", 1)];
        view.merge(Facet::Health, batch);

        let errors = |name: &str| {
            view.records()
                .iter()
                .find(|r| r.name == name)
                .and_then(|r| r.status.as_ref())
                .map(|s| s.in_error.len())
        };
        assert_eq!(errors("ns-1999"), Some(4));
        assert_eq!(errors("ns-7"), Some(1));
        assert_eq!(errors("ns-8"), None);
        assert_eq!(view.records().iter().filter(|r| r.status.is_some()).count(), 2);
        assert_eq!(view.len(), 2000);
    }

    #[test]
    fn filters_project_without_mutating() {
        let mut view = view(&["bookinfo", "default"], SortField::Name);
        view.set_filters(FilterSet::new(vec![NamespaceFilter::NameContains(vec![
            "book".into(),
        ])]));
        assert_eq!(view.visible().len(), 1);
        assert_eq!(view.len(), 2);
    }
}
