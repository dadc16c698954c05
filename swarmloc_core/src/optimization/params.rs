// swarmloc_core/src/optimization/params.rs

//! Storage for the optimized `[x, y, z, yaw]` parameter blocks.
//!
//! Every block lives once in a `SlotMap` arena. Two ordered indices map
//! (keyframe ts, robot) and (robot, keyframe ts) to the same stable handle, so
//! several keyframes of a stationary robot may share one block and evicting a
//! keyframe can never leave a dangling reference.

use slotmap::{new_key_type, SecondaryMap, SlotMap};
use std::collections::BTreeMap;

use crate::pose::Pose;
use crate::types::{DroneId, Timestamp};

new_key_type! {
    /// Stable handle of one parameter block.
    pub struct PoseHandle;
}

/// A single `[x, y, z, yaw]` parameter block.
pub type PoseParams = [f64; 4];

/// An owned snapshot of every block value, e.g. the best result of a restart search.
pub type ParameterSet = SecondaryMap<PoseHandle, PoseParams>;

#[derive(Debug, Clone, Default)]
pub struct PoseArena {
    blocks: SlotMap<PoseHandle, PoseParams>,
    by_ts: BTreeMap<Timestamp, BTreeMap<DroneId, PoseHandle>>,
    by_id: BTreeMap<DroneId, BTreeMap<Timestamp, PoseHandle>>,
}

impl PoseArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blocks (shared blocks count once).
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Allocates a new block for `(ts, id)`.
    pub fn insert(&mut self, ts: Timestamp, id: DroneId, value: PoseParams) -> PoseHandle {
        let handle = self.blocks.insert(value);
        self.link(ts, id, handle);
        handle
    }

    /// Makes `(ts, id)` refer to an existing block.
    pub fn link(&mut self, ts: Timestamp, id: DroneId, handle: PoseHandle) {
        self.by_ts.entry(ts).or_default().insert(id, handle);
        self.by_id.entry(id).or_default().insert(ts, handle);
    }

    pub fn handle(&self, ts: Timestamp, id: DroneId) -> Option<PoseHandle> {
        self.by_ts.get(&ts).and_then(|m| m.get(&id)).copied()
    }

    pub fn contains(&self, ts: Timestamp, id: DroneId) -> bool {
        self.handle(ts, id).is_some()
    }

    pub fn has_drone(&self, id: DroneId) -> bool {
        self.by_id.get(&id).is_some_and(|m| !m.is_empty())
    }

    pub fn get(&self, handle: PoseHandle) -> Option<&PoseParams> {
        self.blocks.get(handle)
    }

    pub fn set(&mut self, handle: PoseHandle, value: PoseParams) {
        if let Some(block) = self.blocks.get_mut(handle) {
            *block = value;
        }
    }

    /// The estimate of `(ts, id)` as a yaw-only pose.
    pub fn pose(&self, ts: Timestamp, id: DroneId) -> Option<Pose> {
        self.handle(ts, id)
            .and_then(|h| self.blocks.get(h))
            .map(|p| Pose::from_xyzyaw(p))
    }

    /// All keyframe blocks of one robot, ordered by timestamp.
    pub fn drone_blocks(&self, id: DroneId) -> impl Iterator<Item = (Timestamp, PoseHandle)> + '_ {
        self.by_id
            .get(&id)
            .into_iter()
            .flat_map(|m| m.iter().map(|(ts, h)| (*ts, *h)))
    }

    pub fn first_of(&self, id: DroneId) -> Option<(Timestamp, PoseHandle)> {
        self.by_id
            .get(&id)
            .and_then(|m| m.iter().next())
            .map(|(ts, h)| (*ts, *h))
    }

    pub fn last_of(&self, id: DroneId) -> Option<(Timestamp, PoseHandle)> {
        self.by_id
            .get(&id)
            .and_then(|m| m.iter().next_back())
            .map(|(ts, h)| (*ts, *h))
    }

    /// The blocks of one keyframe, ordered by robot id.
    pub fn frame_blocks(&self, ts: Timestamp) -> impl Iterator<Item = (DroneId, PoseHandle)> + '_ {
        self.by_ts
            .get(&ts)
            .into_iter()
            .flat_map(|m| m.iter().map(|(id, h)| (*id, *h)))
    }

    pub fn drone_ids(&self) -> impl Iterator<Item = DroneId> + '_ {
        self.by_id
            .iter()
            .filter(|(_, m)| !m.is_empty())
            .map(|(id, _)| *id)
    }

    /// Drops a keyframe from both indices and frees any block that no other
    /// keyframe still refers to.
    pub fn remove_frame(&mut self, ts: Timestamp) {
        let Some(entries) = self.by_ts.remove(&ts) else {
            return;
        };
        for (id, handle) in entries {
            let still_used = match self.by_id.get_mut(&id) {
                Some(per_id) => {
                    per_id.remove(&ts);
                    let used = per_id.values().any(|h| *h == handle);
                    if per_id.is_empty() {
                        self.by_id.remove(&id);
                    }
                    used
                }
                None => false,
            };
            if !still_used {
                self.blocks.remove(handle);
            }
        }
    }

    /// Copies out every block value.
    pub fn snapshot(&self) -> ParameterSet {
        let mut set = ParameterSet::with_capacity(self.blocks.len());
        for (h, p) in &self.blocks {
            set.insert(h, *p);
        }
        set
    }

    /// Writes a snapshot back. Blocks freed since the snapshot was taken are skipped.
    pub fn apply(&mut self, set: &ParameterSet) {
        for (h, p) in set {
            if let Some(block) = self.blocks.get_mut(h) {
                *block = *p;
            }
        }
    }
}
