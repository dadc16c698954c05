// swarmloc_core/src/frames/aggregator.rs

use std::collections::{BTreeMap, BTreeSet};

use crate::config::SolverConfig;
use crate::frames::{NodeFrame, SwarmFrame};
use crate::pose::Pose;
use crate::types::{sec_to_ts, DroneId, Timestamp};

#[derive(Debug, Clone, Copy)]
struct OdometrySample {
    ts: Timestamp,
    pose: Pose,
}

#[derive(Debug, Clone, Copy)]
struct DistanceSample {
    ts: Timestamp,
    distance: f64,
}

/// Collects the asynchronous per-robot streams (odometry and ranges) and
/// snapshots them into one `SwarmFrame` per requested timestamp.
#[derive(Debug, Clone)]
pub struct FrameAggregator {
    max_odometry_age: Timestamp,
    max_distance_age: Timestamp,
    odometry: BTreeMap<DroneId, OdometrySample>,
    /// Latest range reading, keyed by (from, to).
    distances: BTreeMap<(DroneId, DroneId), DistanceSample>,
    static_nodes: BTreeSet<DroneId>,
}

impl FrameAggregator {
    /// `max_odometry_age` and `max_distance_age` are in seconds.
    pub fn new(max_odometry_age: f64, max_distance_age: f64) -> Self {
        Self {
            max_odometry_age: sec_to_ts(max_odometry_age),
            max_distance_age: sec_to_ts(max_distance_age),
            odometry: BTreeMap::new(),
            distances: BTreeMap::new(),
            static_nodes: BTreeSet::new(),
        }
    }

    pub fn from_config(config: &SolverConfig) -> Self {
        Self::new(config.max_odometry_age, config.max_distance_age)
    }

    /// Declares `id` to be a fixed infrastructure node.
    pub fn mark_static(&mut self, id: DroneId) {
        self.static_nodes.insert(id);
    }

    /// Records the latest odometry of a robot. Out-of-order samples are ignored.
    pub fn push_odometry(&mut self, id: DroneId, ts: Timestamp, pose: Pose) {
        match self.odometry.get(&id) {
            Some(prev) if prev.ts > ts => {
                tracing::trace!(id, ts, "Dropping out-of-order odometry sample");
            }
            _ => {
                self.odometry.insert(id, OdometrySample { ts, pose });
            }
        }
    }

    /// Records a range reading taken by `from` towards `to`.
    pub fn push_distance(&mut self, from: DroneId, to: DroneId, ts: Timestamp, distance: f64) {
        if from == to || !distance.is_finite() || distance < 0.0 {
            tracing::debug!(from, to, distance, "Ignoring invalid range reading");
            return;
        }
        let entry = self.distances.entry((from, to)).or_insert(DistanceSample { ts, distance });
        if entry.ts <= ts {
            *entry = DistanceSample { ts, distance };
        }
    }

    /// Snapshots the streams at `ts`.
    ///
    /// Every robot that ever reported odometry appears in the frame; robots whose
    /// last sample is older than `max_odometry_age` are marked without odometry.
    /// Ranges older than `max_distance_age` are left out. Returns `None` when no
    /// robot has reported yet.
    pub fn build_frame(&self, ts: Timestamp) -> Option<SwarmFrame> {
        if self.odometry.is_empty() {
            return None;
        }

        let mut frame = SwarmFrame::new(ts);
        for (&id, sample) in &self.odometry {
            if sample.ts > ts {
                continue;
            }
            let fresh = ts - sample.ts <= self.max_odometry_age;
            let mut nf = NodeFrame::new(id, sample.ts, sample.pose)
                .with_vo_available(fresh)
                .with_static(self.static_nodes.contains(&id));

            for (&(from, to), reading) in self.distances.range((id, DroneId::MIN)..=(id, DroneId::MAX)) {
                debug_assert_eq!(from, id);
                if reading.ts <= ts && ts - reading.ts <= self.max_distance_age {
                    nf = nf.with_distance(to, reading.distance);
                }
            }
            frame.insert(nf);
        }

        if frame.is_empty() {
            None
        } else {
            Some(frame)
        }
    }
}
