// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

/// Identifies one stat: a `(group, name)` pair.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct StatKey {
    group: String,
    name: String,
}

impl StatKey {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for StatKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}

/// A pointwise-additive map from [`StatKey`] to a signed count. The empty
/// map is the monoid identity. A missing key is distinct from an explicit
/// zero for [`get`](Self::get), but not for [`value`](Self::value).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    values: BTreeMap<StatKey, i64>,
}

impl Counters {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &StatKey) -> Option<i64> {
        self.values.get(key).copied()
    }

    /// The count for `key`, treating a missing key as zero.
    pub fn value(&self, key: &StatKey) -> i64 {
        self.get(key).unwrap_or(0)
    }

    pub fn keys(&self) -> impl Iterator<Item = &StatKey> {
        self.values.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Pointwise sum.
    pub fn merge(&self, other: &Counters) -> Counters {
        let mut merged = self.values.clone();
        for (key, count) in &other.values {
            *merged.entry(key.clone()).or_insert(0) += count;
        }
        Counters { values: merged }
    }
}

impl FromIterator<(StatKey, i64)> for Counters {
    fn from_iter<I: IntoIterator<Item = (StatKey, i64)>>(iter: I) -> Self {
        let mut counters = Counters::empty();
        for (key, count) in iter {
            *counters.values.entry(key).or_insert(0) += count;
        }
        counters
    }
}

/// One fresh id per `Writer::execute` call, the outer key of the
/// counters-by-submission structure.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubmissionId(u64);

impl SubmissionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "submission-{}", self.0)
    }
}

/// Counters keyed by the submission that produced them. Peer evaluations of
/// a coalesced write observe the same submission entry, so merging is a set
/// union and flattening only happens on request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CountersById {
    by_submission: BTreeMap<SubmissionId, Counters>,
}

impl CountersById {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn singleton(id: SubmissionId, counters: Counters) -> Self {
        Self {
            by_submission: BTreeMap::from([(id, counters)]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_submission.is_empty()
    }

    /// Union by submission id. Two entries under the same id necessarily
    /// came from the same submission, so either copy is authoritative.
    pub fn merge(&self, other: &CountersById) -> CountersById {
        let mut merged = self.by_submission.clone();
        for (id, counters) in &other.by_submission {
            merged.insert(*id, counters.clone());
        }
        CountersById {
            by_submission: merged,
        }
    }

    pub fn flatten(&self) -> Counters {
        self.by_submission
            .values()
            .fold(Counters::empty(), |acc, counters| acc.merge(counters))
    }
}
