// swarmloc_core/src/estimation/localizer.rs

//! The sliding-window swarm localization engine.
//!
//! Frames, loop closures and detections are ingested between solves. Each
//! `solve` rebuilds the pose graph over the window, minimizes it, and, once
//! the fit is good enough, publishes the estimate to the committed store that
//! prediction queries read from.

use nalgebra::Vector3;
use parking_lot::{Mutex, RwLock};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SolverConfig;
use crate::diagnostics;
use crate::error::{LocalizationError, Pending, SolverError};
use crate::estimation::curator::{curate, CuratedMeasurements};
use crate::estimation::keyframe::{KeyframeDecision, KeyframeSelector};
use crate::estimation::observability::{estimate_observability, Observability};
use crate::estimation::sync::CommittedState;
use crate::estimation::window::SlidingWindow;
use crate::estimation::SwarmEstimator;
use crate::frames::{NodeFrame, SwarmFrame};
use crate::messages::{DroneDetection, LocalizerInput, LoopConnection, PredictedPose, SwarmFrameState};
use crate::optimization::graph::{cutting_edges, PoseGraphBuilder};
use crate::optimization::lm::{LevenbergMarquardt, SolverOptions, SolverSummary, Termination};
use crate::optimization::normalized_cost;
use crate::optimization::params::{ParameterSet, PoseArena};
use crate::pose::Pose;
use crate::types::{ts_short, DroneId, Timestamp};

/// Running counters of the solver, for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct SolveStats {
    /// Solves that actually ran an optimization.
    pub solve_count: usize,
    /// Individual least-squares runs, restart trials included.
    pub trial_count: usize,
    pub total_solve_time: Duration,
    pub last_num_residuals: usize,
    pub last_termination: Option<Termination>,
}

/// One minimization from one starting point.
#[derive(Debug, Clone)]
pub struct SolveOutcome {
    pub values: ParameterSet,
    pub cost: f64,
    pub summary: SolverSummary,
}

/// The result of a multi-start search.
#[derive(Debug, Clone, Default)]
pub struct RestartResult {
    /// The lowest-cost trial.
    pub best: Option<SolveOutcome>,
    pub summaries: Vec<SolverSummary>,
}

fn symmetric<R: Rng>(rng: &mut R, bound: f64) -> f64 {
    if bound > 0.0 {
        rng.gen_range(-bound..=bound)
    } else {
        0.0
    }
}

/// Seeds a restart trial. Every block of the robots in `ids` gets a position
/// drawn uniformly inside the initialization box and the yaw of its
/// odometry; other blocks keep their current value. Blocks shared by
/// several keyframes are drawn once.
pub fn random_init_values<R: Rng>(
    ids: &[DroneId],
    window: &SlidingWindow,
    arena: &PoseArena,
    config: &SolverConfig,
    rng: &mut R,
) -> ParameterSet {
    let mut values = arena.snapshot();
    let mut seeded = ParameterSet::new();
    for &id in ids {
        for (ts, handle) in arena.drone_blocks(id) {
            if seeded.contains_key(handle) {
                continue;
            }
            let Some(current) = values.get(handle).copied() else {
                continue;
            };
            let yaw = window
                .frame_by_ts(ts)
                .and_then(|sf| sf.node(id))
                .map_or(current[3], |nf| nf.self_pose.yaw());
            let p = [
                symmetric(rng, config.rand_init_xy),
                symmetric(rng, config.rand_init_xy),
                symmetric(rng, config.rand_init_z),
                yaw,
            ];
            values.insert(handle, p);
            seeded.insert(handle, p);
        }
    }
    values
}

pub struct SwarmLocalizer {
    config: SolverConfig,
    window: SlidingWindow,
    selector: KeyframeSelector,
    arena: PoseArena,

    // --- Raw measurements, re-curated on every solve ---
    all_loops: Vec<LoopConnection>,
    all_detections: Vec<DroneDetection>,
    curated: CuratedMeasurements,
    observability: Observability,

    finish_init: bool,
    has_new_keyframe: bool,
    cost_now: f64,
    last_kf_ts: Option<Timestamp>,

    solver: LevenbergMarquardt,
    rng: ChaCha8Rng,
    committed: Arc<RwLock<CommittedState>>,
    stats: SolveStats,
}

impl std::fmt::Debug for SwarmLocalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmLocalizer")
            .field("self_id", &self.config.self_id)
            .field("window", &self.window.len())
            .field("finish_init", &self.finish_init)
            .field("cost_now", &self.cost_now)
            .finish()
    }
}

impl SwarmLocalizer {
    pub fn new(config: SolverConfig) -> Result<Self, LocalizationError> {
        config.validate()?;
        let solver = LevenbergMarquardt::new(config.thread_num)?;
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        tracing::info!(
            self_id = ?config.self_id,
            max_frame_number = config.max_frame_number,
            min_frame_number = config.min_frame_number,
            "Swarm localizer created"
        );
        Ok(Self {
            config,
            window: SlidingWindow::new(),
            selector: KeyframeSelector::new(),
            arena: PoseArena::new(),
            all_loops: Vec::new(),
            all_detections: Vec::new(),
            curated: CuratedMeasurements::default(),
            observability: Observability::default(),
            finish_init: false,
            has_new_keyframe: false,
            cost_now: 0.0,
            last_kf_ts: None,
            solver,
            rng,
            committed: Arc::new(RwLock::new(CommittedState::new())),
            stats: SolveStats::default(),
        })
    }

    // --- Accessors ---

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn window(&self) -> &SlidingWindow {
        &self.window
    }

    pub fn arena(&self) -> &PoseArena {
        &self.arena
    }

    pub fn curated(&self) -> &CuratedMeasurements {
        &self.curated
    }

    pub fn observability(&self) -> &Observability {
        &self.observability
    }

    pub fn keyframe_selector(&self) -> &KeyframeSelector {
        &self.selector
    }

    pub fn cost_now(&self) -> f64 {
        self.cost_now
    }

    pub fn stats(&self) -> &SolveStats {
        &self.stats
    }

    /// Number of raw loops and detections currently retained.
    pub fn raw_measurement_counts(&self) -> (usize, usize) {
        (self.all_loops.len(), self.all_detections.len())
    }

    /// Handle to the committed estimate, for readers on other threads.
    pub fn committed(&self) -> Arc<RwLock<CommittedState>> {
        Arc::clone(&self.committed)
    }

    pub fn is_ready(&self) -> bool {
        self.finish_init
    }

    // =========================================================================
    // == Ingestion ==
    // =========================================================================

    pub fn add_new_swarm_frame(&mut self, frame: SwarmFrame) {
        self.selector.record_frame(&frame);
        match self.selector.judge(&frame, &self.window, &self.config) {
            KeyframeDecision::NewKeyframe => self.add_as_keyframe(frame),
            KeyframeDecision::ReplaceLast => self.replace_last_kf(frame),
            KeyframeDecision::Reject => {
                tracing::trace!(ts = ts_short(frame.ts), "Swarm frame rejected");
            }
        }
    }

    pub fn add_new_loop_connection(&mut self, loc: LoopConnection) {
        if !self.config.enable_loop {
            return;
        }
        tracing::debug!(a = loc.id_a, b = loc.id_b, "New loop connection");
        self.all_loops.push(loc);
        self.has_new_keyframe = true;
    }

    pub fn add_new_detection(&mut self, det: DroneDetection) {
        if !self.config.enable_detection {
            return;
        }
        tracing::debug!(a = det.id_a, b = det.id_b, "New drone detection");
        self.all_detections.push(det);
        self.has_new_keyframe = true;
    }

    fn add_as_keyframe(&mut self, frame: SwarmFrame) {
        self.selector.record_keyframe(&frame);
        self.init_frame_nodes(&frame);
        let ts = frame.ts;
        self.window.push(frame, &self.config);
        self.last_kf_ts = Some(ts);
        self.has_new_keyframe = true;
        tracing::info!(
            ts = ts_short(ts),
            size = self.window.len(),
            max = self.config.max_frame_number,
            "New keyframe"
        );

        let evicted = self.window.evict_overflow(&self.config, &mut self.rng);
        if !evicted.is_empty() {
            for sf in &evicted {
                self.arena.remove_frame(sf.ts);
            }
            self.prune_stale_measurements();
        }
    }

    fn replace_last_kf(&mut self, frame: SwarmFrame) {
        let Some(last_ts) = self.window.last().map(|sf| sf.ts) else {
            return;
        };
        self.arena.remove_frame(last_ts);
        self.selector.record_keyframe(&frame);
        self.init_frame_nodes(&frame);
        let ts = frame.ts;
        self.window.replace_last(frame, &self.config);
        self.last_kf_ts = Some(ts);
        self.has_new_keyframe = true;
        tracing::info!(old = ts_short(last_ts), new = ts_short(ts), "Replaced last keyframe");
    }

    /// Drops raw measurements entirely older than the window.
    fn prune_stale_measurements(&mut self) {
        let Some(oldest) = self.window.first().map(|sf| sf.ts) else {
            return;
        };
        let before = self.all_loops.len() + self.all_detections.len();
        self.all_loops.retain(|l| l.ts_a.max(l.ts_b) >= oldest);
        self.all_detections.retain(|d| d.ts_a.max(d.ts_b) >= oldest);
        let dropped = before - self.all_loops.len() - self.all_detections.len();
        if dropped > 0 {
            tracing::debug!(dropped, "Pruned measurements older than the window");
        }
    }

    // =========================================================================
    // == Parameter Initialization ==
    // =========================================================================

    fn init_frame_nodes(&mut self, frame: &SwarmFrame) {
        for nf in frame.nodes.values() {
            if nf.is_static {
                self.init_static(frame.ts, nf);
            } else {
                self.init_dynamic(frame.ts, nf);
            }
        }
    }

    fn random_pose_near(&mut self, nf: &NodeFrame) -> Pose {
        let noise = Vector3::new(
            symmetric(&mut self.rng, self.config.rand_init_xy),
            symmetric(&mut self.rng, self.config.rand_init_xy),
            symmetric(&mut self.rng, self.config.rand_init_z),
        );
        Pose::new(nf.position() + noise, *nf.self_pose.attitude())
    }

    /// Seeds the block of a moving robot. Before initialization the local
    /// robot simply uses its odometry. Otherwise the previous estimate is
    /// propagated with the odometry delta, and a robot that has not moved
    /// shares its previous block.
    fn init_dynamic(&mut self, ts: Timestamp, nf: &NodeFrame) {
        let id = nf.id;
        if Some(id) == self.config.self_id && !self.finish_init {
            self.arena.insert(ts, id, nf.self_pose.to_xyzyaw());
            return;
        }

        if self.last_kf_ts.is_some() {
            if let Some((last_ts, handle)) = self.arena.last_of(id) {
                let last_vo = self
                    .window
                    .frame_by_ts(last_ts)
                    .and_then(|sf| sf.node(id))
                    .map(|n| n.self_pose);
                let est_last = self.arena.get(handle).map(|p| Pose::from_xyzyaw(p));
                if let (Some(last_vo), Some(est_last)) = (last_vo, est_last) {
                    let dpose = Pose::delta_pose(&last_vo, &nf.self_pose, true);
                    if dpose.position().norm() < self.config.not_moving_thres
                        && dpose.yaw().abs() < self.config.not_moving_yaw
                    {
                        self.arena.link(ts, id, handle);
                    } else {
                        self.arena.insert(ts, id, (est_last * dpose).to_xyzyaw());
                    }
                    return;
                }
            }
        }

        tracing::info!(id, ts = ts_short(ts), "Initializing drone with a random pose");
        let pose = self.random_pose_near(nf);
        self.arena.insert(ts, id, pose.to_xyzyaw());
    }

    /// Static nodes own a single block for their whole lifetime in the window.
    fn init_static(&mut self, ts: Timestamp, nf: &NodeFrame) {
        if self.last_kf_ts.is_some() {
            if let Some((_, handle)) = self.arena.first_of(nf.id) {
                self.arena.link(ts, nf.id, handle);
                return;
            }
        }
        let pose = self.random_pose_near(nf);
        self.arena.insert(ts, nf.id, pose.to_xyzyaw());
    }

    // =========================================================================
    // == Solve ==
    // =========================================================================

    /// Builds the pose graph from `values` and minimizes it once.
    pub fn solve_once(
        &self,
        self_id: DroneId,
        values: &ParameterSet,
        max_time: Option<Duration>,
    ) -> Result<SolveOutcome, SolverError> {
        let mut problem = PoseGraphBuilder {
            window: &self.window,
            arena: &self.arena,
            values,
            observability: &self.observability,
            measurements: &self.curated.measurements,
            self_id,
            config: &self.config,
        }
        .build()?;

        let options = SolverOptions {
            max_iterations: self.config.max_iterations,
            max_time,
            ..Default::default()
        };
        let summary = self.solver.solve(&mut problem, &options)?;
        let cost = normalized_cost(
            summary.final_cost,
            self.window.len(),
            summary.num_residuals,
            self.config.error_normalized,
        );
        tracing::debug!(
            cost,
            initial = summary.initial_cost,
            final_cost = summary.final_cost,
            iterations = summary.iterations,
            residuals = summary.num_residuals,
            termination = ?summary.termination,
            "Solve finished"
        );
        Ok(SolveOutcome {
            values: problem.solution(),
            cost,
            summary,
        })
    }

    /// Runs one uncapped solve per seeded starting point and keeps the lowest cost.
    pub fn restart_search(&self, self_id: DroneId, trials: &[ParameterSet]) -> Result<RestartResult, SolverError> {
        let mut result = RestartResult::default();
        for (i, values) in trials.iter().enumerate() {
            let outcome = self.solve_once(self_id, values, None)?;
            tracing::debug!(trial = i, cost = outcome.cost, "Initialization trial");
            result.summaries.push(outcome.summary.clone());
            let better = result.best.as_ref().map_or(true, |b| outcome.cost < b.cost);
            if better {
                result.best = Some(outcome);
            }
        }
        Ok(result)
    }

    fn record_summary(&mut self, summary: &SolverSummary) {
        self.stats.trial_count += 1;
        self.stats.total_solve_time += summary.wall_time;
        self.stats.last_num_residuals = summary.num_residuals;
        self.stats.last_termination = Some(summary.termination);
    }

    /// One optimization step. Recoverable "not yet" conditions come back as
    /// `LocalizationError::InsufficientEvidence`.
    pub fn try_solve(&mut self) -> Result<f64, LocalizationError> {
        let self_id = self
            .config
            .self_id
            .ok_or(LocalizationError::InsufficientEvidence(Pending::NoSelfId))?;
        if self.window.len() < self.config.min_frame_number {
            return Err(LocalizationError::InsufficientEvidence(Pending::TooFewKeyframes {
                have: self.window.len(),
                need: self.config.min_frame_number,
            }));
        }
        if !self.has_new_keyframe {
            return Ok(self.cost_now);
        }

        let enabled = cutting_edges(&mut self.window, &self.config);
        let estimates = if self.finish_init { Some(&self.arena) } else { None };
        self.curated = curate(&self.all_loops, &self.all_detections, &self.window, estimates, &self.config);
        self.observability = estimate_observability(&self.window, &self.curated.loop_edges, self_id, &self.config);
        tracing::debug!(
            ranges = enabled,
            loops = self.curated.loop_count(),
            detections = self.curated.detection_count(),
            "Pose graph inputs ready"
        );

        if !self.finish_init {
            if !self.observability.enable_to_init {
                tracing::warn!("Bounding box too small and loop graph disconnected; waiting for more motion");
                return Err(LocalizationError::InsufficientEvidence(Pending::NotObservable));
            }
            self.has_new_keyframe = false;

            let others: Vec<DroneId> = self.window.drone_ids().into_iter().filter(|id| *id != self_id).collect();
            let n_trials = if others.is_empty() { 1 } else { self.config.init_trial.max(1) };
            let trials: Vec<_> = (0..n_trials)
                .map(|_| random_init_values(&others, &self.window, &self.arena, &self.config, &mut self.rng))
                .collect();
            tracing::warn!(trials = n_trials, expect = self.config.acpt_cost, "Searching random initializations");

            let result = self.restart_search(self_id, &trials)?;
            for summary in &result.summaries {
                self.record_summary(summary);
            }
            if let Some(best) = result.best {
                self.cost_now = best.cost;
                if best.cost < self.config.acpt_cost {
                    self.arena.apply(&best.values);
                    self.finish_init = true;
                    tracing::info!(cost = best.cost, "Initialization finished");
                } else {
                    tracing::warn!(cost = best.cost, "No initialization trial reached the acceptance cost");
                }
            }
        } else {
            self.has_new_keyframe = false;
            let values = self.arena.snapshot();
            let max_time = Duration::from_secs_f64(self.config.max_solver_time.max(0.0));
            let outcome = self.solve_once(self_id, &values, Some(max_time))?;
            self.record_summary(&outcome.summary);
            self.arena.apply(&outcome.values);
            self.cost_now = outcome.cost;

            if self.cost_now > self.config.acpt_cost {
                self.finish_init = false;
                tracing::warn!(cost = self.cost_now, "Cost too high, restarting initialization");
            }
        }
        self.stats.solve_count += 1;

        if self.config.enable_cgraph_generation {
            if let Err(e) = self.write_pose_graph_dot(&self.config.cgraph_path) {
                tracing::warn!("Failed to write pose graph: {}", e);
            }
        }

        let mut committed = self.committed.write();
        if self.finish_init {
            committed.commit(&self.window, &self.arena);
        }
        committed.set_ready(self.finish_init);
        Ok(self.cost_now)
    }

    /// `try_solve` with the classic contract: the normalized cost, or `-1.0`
    /// while evidence is insufficient.
    ///
    /// # Panics
    ///
    /// Panics on a structural [`SolverError`] after logging it. Callers that
    /// need to recover from that should call [`try_solve`](Self::try_solve).
    pub fn solve(&mut self) -> f64 {
        match self.try_solve() {
            Ok(cost) => cost,
            Err(LocalizationError::InsufficientEvidence(reason)) => {
                tracing::debug!(%reason, "Solve skipped");
                -1.0
            }
            Err(e) => {
                tracing::error!("Critical solver failure: {}. Exiting", e);
                panic!("swarm localization solver failed: {}", e);
            }
        }
    }

    // =========================================================================
    // == Prediction ==
    // =========================================================================

    pub fn predict_node(&self, nf: &NodeFrame) -> Option<PredictedPose> {
        self.committed.read().predict_node(nf)
    }

    pub fn node_coordinate_offset(&self, id: DroneId) -> Option<Pose> {
        self.committed.read().node_coordinate_offset(id)
    }

    pub fn predict_swarm(&self, frame: &SwarmFrame) -> SwarmFrameState {
        self.committed.read().predict_swarm(frame)
    }

    pub fn write_pose_graph_dot(&self, path: &Path) -> Result<(), LocalizationError> {
        diagnostics::write_pose_graph_dot(path, &self.window, &self.arena, &self.curated.measurements)?;
        tracing::debug!(path = %path.display(), "Wrote pose graph");
        Ok(())
    }
}

impl SwarmEstimator for SwarmLocalizer {
    fn process(&mut self, input: &LocalizerInput) {
        match input {
            LocalizerInput::SwarmFrame(sf) => self.add_new_swarm_frame((*sf).clone()),
            LocalizerInput::Loop(loc) => self.add_new_loop_connection((*loc).clone()),
            LocalizerInput::Detection(det) => self.add_new_detection((*det).clone()),
        }
    }

    fn solve(&mut self) -> f64 {
        SwarmLocalizer::solve(self)
    }

    fn is_ready(&self) -> bool {
        SwarmLocalizer::is_ready(self)
    }

    fn predict_swarm(&self, frame: &SwarmFrame) -> SwarmFrameState {
        SwarmLocalizer::predict_swarm(self, frame)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// =========================================================================
// == Thread-Safe Handle ==
// =========================================================================

/// A cloneable handle for running ingestion and solving on one thread while
/// other threads query predictions. Queries only take the read lock of the
/// committed store, so they never wait for a running solve.
#[derive(Clone)]
pub struct SharedLocalizer {
    engine: Arc<Mutex<SwarmLocalizer>>,
    committed: Arc<RwLock<CommittedState>>,
}

impl SharedLocalizer {
    pub fn new(engine: SwarmLocalizer) -> Self {
        let committed = engine.committed();
        Self {
            engine: Arc::new(Mutex::new(engine)),
            committed,
        }
    }

    pub fn add_new_swarm_frame(&self, frame: SwarmFrame) {
        self.engine.lock().add_new_swarm_frame(frame);
    }

    pub fn add_new_loop_connection(&self, loc: LoopConnection) {
        self.engine.lock().add_new_loop_connection(loc);
    }

    pub fn add_new_detection(&self, det: DroneDetection) {
        self.engine.lock().add_new_detection(det);
    }

    /// See [`SwarmLocalizer::solve`]; panics on the same structural failures.
    pub fn solve(&self) -> f64 {
        self.engine.lock().solve()
    }

    pub fn is_ready(&self) -> bool {
        self.committed.read().is_ready()
    }

    pub fn predict_node(&self, nf: &NodeFrame) -> Option<PredictedPose> {
        self.committed.read().predict_node(nf)
    }

    pub fn node_coordinate_offset(&self, id: DroneId) -> Option<Pose> {
        self.committed.read().node_coordinate_offset(id)
    }

    pub fn predict_swarm(&self, frame: &SwarmFrame) -> SwarmFrameState {
        self.committed.read().predict_swarm(frame)
    }

    /// Runs `f` with exclusive access to the engine, e.g. to call
    /// [`SwarmLocalizer::try_solve`].
    pub fn with_engine<T>(&self, f: impl FnOnce(&mut SwarmLocalizer) -> T) -> T {
        f(&mut self.engine.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NSEC_PER_SEC;
    use approx::assert_abs_diff_eq;

    fn config() -> SolverConfig {
        SolverConfig {
            min_frame_number: 4,
            max_frame_number: 8,
            seed: Some(7),
            thread_num: 1,
            ..SolverConfig::for_drone(1)
        }
    }

    fn solo_frame(k: i64) -> SwarmFrame {
        let ts = k * NSEC_PER_SEC / 10;
        let pose = Pose::from_xyz_yaw(Vector3::new(0.5 * k as f64, 0.1 * k as f64, 0.0), 0.05 * k as f64);
        SwarmFrame::from_nodes(ts, [NodeFrame::new(1, ts, pose)])
    }

    #[test]
    fn test_pending_conditions() {
        let mut no_self = SwarmLocalizer::new(SolverConfig {
            self_id: None,
            ..config()
        })
        .expect("engine");
        assert_eq!(no_self.solve(), -1.0);

        let mut engine = SwarmLocalizer::new(config()).expect("engine");
        engine.add_new_swarm_frame(solo_frame(0));
        assert!(matches!(
            engine.try_solve(),
            Err(LocalizationError::InsufficientEvidence(Pending::TooFewKeyframes { have: 1, need: 4 }))
        ));
        assert!(!engine.is_ready());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let result = SwarmLocalizer::new(SolverConfig {
            min_frame_number: 50,
            ..config()
        });
        assert!(matches!(result, Err(LocalizationError::Config(_))));
    }

    #[test]
    fn test_single_drone_initializes_on_odometry() {
        let mut engine = SwarmLocalizer::new(config()).expect("engine");
        for k in 0..6 {
            engine.add_new_swarm_frame(solo_frame(k));
        }
        assert_eq!(engine.window().len(), 6);

        let cost = engine.solve();
        assert!(cost >= 0.0 && cost < engine.config().acpt_cost, "cost {}", cost);
        assert!(engine.is_ready());

        // No new data: the cached cost comes back without another solve.
        let runs = engine.stats().solve_count;
        assert_eq!(engine.solve(), cost);
        assert_eq!(engine.stats().solve_count, runs);

        // The estimate of the local robot is its odometry.
        let probe = solo_frame(9);
        let nf = probe.node(1).expect("node");
        let p = engine.predict_node(nf).expect("prediction");
        assert_abs_diff_eq!(p.pose.position().x, nf.position().x, epsilon = 1e-6);
        assert_abs_diff_eq!(p.pose.yaw(), nf.self_pose.yaw(), epsilon = 1e-6);
        let offset = engine.node_coordinate_offset(1).expect("offset");
        assert_abs_diff_eq!(offset.position().norm(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_window_stays_bounded_and_measurements_are_pruned() {
        let mut engine = SwarmLocalizer::new(SolverConfig {
            random_eviction: false,
            ..config()
        })
        .expect("engine");
        engine.add_new_swarm_frame(solo_frame(0));
        let old = solo_frame(0);
        let pose = old.node(1).expect("node").self_pose;
        engine.add_new_loop_connection(LoopConnection {
            id_a: 1,
            ts_a: 0,
            self_pose_a: pose,
            id_b: 2,
            ts_b: 0,
            self_pose_b: pose,
            relative_pose: Pose::identity(),
        });
        assert_eq!(engine.raw_measurement_counts(), (1, 0));

        for k in 1..30 {
            engine.add_new_swarm_frame(solo_frame(k));
            assert!(engine.window().len() <= engine.config().max_frame_number);
        }
        assert_eq!(engine.window().len(), engine.config().max_frame_number);
        assert_eq!(engine.raw_measurement_counts().0, 0);
        // One block per keyframe of the moving drone.
        assert_eq!(engine.arena().len(), engine.window().len());
    }

    #[test]
    fn test_disabled_measurement_types_are_ignored() {
        let mut engine = SwarmLocalizer::new(SolverConfig {
            enable_loop: false,
            enable_detection: false,
            ..config()
        })
        .expect("engine");
        let pose = Pose::identity();
        engine.add_new_detection(DroneDetection {
            id_a: 1,
            ts_a: 0,
            self_pose_a: pose,
            id_b: 2,
            ts_b: 0,
            self_pose_b: pose,
            bearing: Vector3::x(),
            inv_dep: None,
        });
        assert_eq!(engine.raw_measurement_counts(), (0, 0));
    }

    #[test]
    fn test_restart_seeds_lie_inside_the_init_box() {
        let mut engine = SwarmLocalizer::new(config()).expect("engine");
        // Drone 2's odometry frame is far from the shared origin.
        for k in 0..6 {
            let mut sf = solo_frame(k);
            let far = Pose::from_xyz_yaw(Vector3::new(100.0 + k as f64, 50.0, 1.0), 0.7);
            sf.insert(NodeFrame::new(2, sf.ts, far));
            engine.add_new_swarm_frame(sf);
        }

        let cfg = engine.config().clone();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let values = random_init_values(&[2], engine.window(), engine.arena(), &cfg, &mut rng);

        let mut xs = Vec::new();
        for (_, h) in engine.arena().drone_blocks(2) {
            let p = values[h];
            assert!(p[0].abs() <= cfg.rand_init_xy && p[1].abs() <= cfg.rand_init_xy, "seed {:?}", p);
            assert!(p[2].abs() <= cfg.rand_init_z);
            assert_abs_diff_eq!(p[3], 0.7, epsilon = 1e-9);
            xs.push(p[0]);
        }
        assert_eq!(xs.len(), 6);
        assert!(xs.iter().any(|x| (x - xs[0]).abs() > 1e-9));

        // The local robot keeps its current estimate.
        for (_, h) in engine.arena().drone_blocks(1) {
            assert_eq!(Some(&values[h]), engine.arena().get(h));
        }
    }

    /// Two drones tied by a loop, with a corrupt range in every frame.
    fn engine_with_corrupt_range() -> SwarmLocalizer {
        let mut engine = SwarmLocalizer::new(config()).expect("engine");
        let other = Pose::from_xyz_yaw(Vector3::new(3.0, 0.0, 0.0), 0.0);
        for k in 0..5 {
            let sf = solo_frame(k);
            let self_pose = sf.node(1).expect("node").self_pose;
            engine.add_new_swarm_frame(SwarmFrame::from_nodes(
                sf.ts,
                [
                    NodeFrame::new(1, sf.ts, self_pose).with_distance(2, f64::NAN),
                    NodeFrame::new(2, sf.ts, other),
                ],
            ));
        }
        engine.add_new_loop_connection(LoopConnection {
            id_a: 1,
            ts_a: 0,
            self_pose_a: Pose::identity(),
            id_b: 2,
            ts_b: 0,
            self_pose_b: other,
            relative_pose: other,
        });
        engine
    }

    #[test]
    fn test_structural_failure_is_returned_by_try_solve() {
        let mut engine = engine_with_corrupt_range();
        assert!(matches!(
            engine.try_solve(),
            Err(LocalizationError::Solver(SolverError::NonFiniteResidual { .. }))
        ));
        assert!(!engine.is_ready());
    }

    #[test]
    #[should_panic(expected = "swarm localization solver failed")]
    fn test_structural_failure_panics_in_solve() {
        let mut engine = engine_with_corrupt_range();
        engine.solve();
    }

    #[test]
    fn test_trait_object_dispatch() {
        let mut engine: Box<dyn SwarmEstimator> = Box::new(SwarmLocalizer::new(config()).expect("engine"));
        for k in 0..5 {
            let sf = solo_frame(k);
            engine.process(&LocalizerInput::SwarmFrame(&sf));
        }
        assert!(engine.solve() >= 0.0);
        assert!(engine.is_ready());
        let localizer = engine
            .as_any_mut()
            .downcast_mut::<SwarmLocalizer>()
            .expect("concrete type");
        assert_eq!(localizer.window().len(), 5);
    }
}
