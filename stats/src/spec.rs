// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

use metrics::{Level, Unit};
use serde::Serialize;
use std::collections::BTreeMap;

/// Declarative description of one metric, used both to register it on the
/// recorder and to report it over the administrative surface.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSpec {
    /// Metric name as exported.
    pub id: String,
    /// Unit reported to the recorder.
    #[serde(skip)]
    pub unit: Unit,
    /// Verbosity the metric is recorded at.
    #[serde(skip)]
    pub level: Level,
    /// Human-readable description.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Key/value labels attached to every sample.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl MetricSpec {
    /// Creates a spec with the given id and unit.
    pub fn new(id: impl AsRef<str>, unit: Unit) -> MetricSpec {
        MetricSpec {
            id: id.as_ref().to_string(),
            unit,
            level: Level::INFO,
            description: String::new(),
            labels: BTreeMap::new(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn describe(mut self, description: impl AsRef<str>) -> MetricSpec {
        self.description = description.as_ref().to_string();
        self
    }

    /// Adds one label.
    #[must_use]
    pub fn label(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> MetricSpec {
        self.labels
            .insert(key.as_ref().to_string(), value.as_ref().to_string());
        self
    }

    pub(crate) fn key(&self) -> metrics::Key {
        let labels: Vec<metrics::Label> = self
            .labels
            .iter()
            .map(|(k, v)| metrics::Label::new(k.clone(), v.clone()))
            .collect();
        metrics::Key::from_parts(self.id.clone(), labels)
    }

    pub(crate) fn metadata(&self) -> metrics::Metadata<'_> {
        metrics::Metadata::new("flowgate", self.level, None)
    }
}
