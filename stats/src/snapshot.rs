// SPDX-License-Identifier: Apache-2.0
// Copyright Flowgate Authors

use serde::Serialize;

/// Point-in-time status of one worker thread, collected on that thread and
/// merged by the worker manager.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct WorkerStatus {
    /// Worker thread index.
    pub thread: usize,
    /// Codebase version the worker is running.
    pub version: String,
    /// Live pipelines on the thread.
    pub active_pipelines: usize,
    /// Live inbound connections/sessions on the thread.
    pub inbound_count: usize,
}

impl WorkerStatus {
    /// Folds another worker's status into this one. Versions agree except in
    /// the middle of a reload; the first worker's version wins.
    pub fn merge(&mut self, other: &WorkerStatus) {
        self.active_pipelines += other.active_pipelines;
        self.inbound_count += other.inbound_count;
        if self.version.is_empty() {
            self.version.clone_from(&other.version);
        }
    }
}

/// Per-thread metric sample, summed across workers by the manager.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct MetricData {
    /// Net chunks referenced by buffers, as accounted by the thread.
    pub chunks_allocated: i64,
    /// Spare chunks on the thread's free list.
    pub chunks_pooled: usize,
    /// Live pipelines.
    pub active_pipelines: usize,
    /// Bytes received from peers.
    pub traffic_in: u64,
    /// Bytes sent to peers.
    pub traffic_out: u64,
}

impl MetricData {
    /// Accumulates `other`; `initial` restarts the sum.
    pub fn sum(&mut self, other: &MetricData, initial: bool) {
        if initial {
            self.clone_from(other);
        } else {
            self.chunks_allocated += other.chunks_allocated;
            self.chunks_pooled += other.chunks_pooled;
            self.active_pipelines += other.active_pipelines;
            self.traffic_in += other.traffic_in;
            self.traffic_out += other.traffic_out;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_merge_adds_counts() {
        let mut merged = WorkerStatus {
            thread: 0,
            version: "v1".to_string(),
            active_pipelines: 2,
            inbound_count: 1,
        };
        merged.merge(&WorkerStatus {
            thread: 1,
            version: "v1".to_string(),
            active_pipelines: 3,
            inbound_count: 4,
        });
        assert_eq!(merged.active_pipelines, 5);
        assert_eq!(merged.inbound_count, 5);
        assert_eq!(merged.version, "v1");
    }

    #[test]
    fn metric_sum_restarts_on_initial() {
        let sample = MetricData {
            chunks_allocated: 1,
            chunks_pooled: 2,
            active_pipelines: 3,
            traffic_in: 10,
            traffic_out: 20,
        };
        let mut sum = MetricData::default();
        sum.sum(&sample, true);
        sum.sum(&sample, false);
        assert_eq!(sum.traffic_in, 20);
        assert_eq!(sum.chunks_allocated, 2);

        sum.sum(&sample, true);
        assert_eq!(sum, sample);
    }
}
