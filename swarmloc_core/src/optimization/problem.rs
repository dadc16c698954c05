// swarmloc_core/src/optimization/problem.rs

use slotmap::SecondaryMap;

use crate::error::SolverError;
use crate::optimization::params::{ParameterSet, PoseHandle, PoseParams};
use crate::optimization::residuals::{HuberLoss, ResidualBlock, ResidualKind};

/// One optimized variable block.
#[derive(Debug, Clone)]
pub struct ParameterBlock {
    pub handle: PoseHandle,
    pub value: PoseParams,
    /// 4 for `[x, y, z, yaw]`, 3 when yaw is held at its initial value.
    pub dof: usize,
    pub constant: bool,
}

impl ParameterBlock {
    /// Number of entries the solver is allowed to move.
    pub fn free_dof(&self) -> usize {
        if self.constant {
            0
        } else {
            self.dof
        }
    }
}

#[derive(Debug)]
pub struct ResidualEntry {
    pub params: Vec<usize>,
    pub cost: Box<dyn ResidualBlock>,
    pub loss: Option<HuberLoss>,
}

/// A nonlinear least-squares problem over pose parameter blocks.
#[derive(Debug, Default)]
pub struct Problem {
    params: Vec<ParameterBlock>,
    index: SecondaryMap<PoseHandle, usize>,
    residuals: Vec<ResidualEntry>,
}

impl Problem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a block. Adding the same handle again returns the existing
    /// index and keeps the first registration's dof.
    pub fn add_parameter_block(&mut self, handle: PoseHandle, value: PoseParams, dof: usize) -> usize {
        if let Some(&idx) = self.index.get(handle) {
            return idx;
        }
        let idx = self.params.len();
        self.params.push(ParameterBlock {
            handle,
            value,
            dof: dof.clamp(3, 4),
            constant: false,
        });
        self.index.insert(handle, idx);
        idx
    }

    pub fn set_parameter_block_constant(&mut self, handle: PoseHandle) {
        if let Some(&idx) = self.index.get(handle) {
            self.params[idx].constant = true;
        }
    }

    pub fn index_of(&self, handle: PoseHandle) -> Option<usize> {
        self.index.get(handle).copied()
    }

    /// Adds a residual over already-registered blocks.
    pub fn add_residual_block(
        &mut self,
        cost: Box<dyn ResidualBlock>,
        loss: Option<HuberLoss>,
        handles: &[PoseHandle],
    ) -> Result<(), SolverError> {
        let block = self.residuals.len();
        if cost.num_parameter_blocks() != handles.len() {
            return Err(SolverError::DimensionMismatch {
                block,
                index: handles.len(),
                count: cost.num_parameter_blocks(),
            });
        }
        let params = handles
            .iter()
            .enumerate()
            .map(|(i, h)| {
                self.index_of(*h).ok_or(SolverError::DimensionMismatch {
                    block,
                    index: i,
                    count: self.params.len(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.residuals.push(ResidualEntry { params, cost, loss });
        Ok(())
    }

    pub fn parameter_blocks(&self) -> &[ParameterBlock] {
        &self.params
    }

    pub fn parameter_blocks_mut(&mut self) -> &mut [ParameterBlock] {
        &mut self.params
    }

    pub fn residual_blocks(&self) -> &[ResidualEntry] {
        &self.residuals
    }

    pub fn num_parameter_blocks(&self) -> usize {
        self.params.len()
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.residuals.len()
    }

    pub fn num_residuals(&self) -> usize {
        self.residuals.iter().map(|r| r.cost.num_residuals()).sum()
    }

    pub fn num_residuals_of(&self, kind: ResidualKind) -> usize {
        self.residuals
            .iter()
            .filter(|r| r.cost.kind() == kind)
            .map(|r| r.cost.num_residuals())
            .sum()
    }

    /// The current values of every block, keyed by arena handle.
    pub fn solution(&self) -> ParameterSet {
        let mut set = ParameterSet::with_capacity(self.params.len());
        for block in &self.params {
            set.insert(block.handle, block.value);
        }
        set
    }
}
