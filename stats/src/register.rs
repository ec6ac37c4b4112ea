// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

use crate::MetricSpec;
use serde::Serialize;

/// Registers a metric described by a [`MetricSpec`] on the current recorder.
pub trait Register<T> {
    /// Describes and registers the metric, returning the live handle.
    fn register(self) -> Registered<T>;
}

/// A live metric handle paired with the spec that registered it.
#[derive(Debug, Serialize)]
pub struct Registered<T> {
    #[serde(flatten)]
    details: MetricSpec,
    /// The handle to record on.
    #[serde(skip)]
    pub metric: T,
}

impl<T> Registered<T> {
    /// The spec the metric was registered with.
    pub fn details(&self) -> &MetricSpec {
        &self.details
    }
}

impl Register<metrics::Counter> for MetricSpec {
    fn register(self) -> Registered<metrics::Counter> {
        let k = self.key();
        let m = self.metadata();
        let metric = metrics::with_recorder(|r| {
            r.describe_counter(
                self.id.to_string().into(),
                Some(self.unit),
                self.description.to_string().into(),
            );
            r.register_counter(&k, &m)
        });
        Registered {
            details: self,
            metric,
        }
    }
}

impl Register<metrics::Gauge> for MetricSpec {
    fn register(self) -> Registered<metrics::Gauge> {
        let k = self.key();
        let m = self.metadata();
        let metric = metrics::with_recorder(|r| {
            r.describe_gauge(
                self.id.to_string().into(),
                Some(self.unit),
                self.description.to_string().into(),
            );
            r.register_gauge(&k, &m)
        });
        Registered {
            details: self,
            metric,
        }
    }
}
