//! Subproblem tiling descriptors: the two-level tile rectangle assigned to
//! work-groups and work-items, and the work-group granularity that goes
//! with it.

use bitflags::bitflags;

use crate::types::{DataType, MatrixRole, Side};
use crate::util;

/// Number of decomposition levels a step can carry.
pub const MAX_SUBDIMS: usize = 3;

/// Kernels a step may need: compute plus the two matrix-prep kernels.
pub const MAX_KERNELS_PER_STEP: usize = 3;

/// Marks an axis a kernel does not use, e.g. the Y item axis of triangular
/// routines dispatched over a 1-D work space.
pub const SUBDIM_UNUSED: usize = usize::MAX;

/// A rectangular tile of the problem.
///
/// `y`/`x` are the outer block height and width, `bwidth` the inner
/// (K-axis) block, and `item_y`/`item_x` the per-thread sub-tile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubproblemDim {
    pub x: usize,
    pub y: usize,
    pub bwidth: usize,
    pub item_x: usize,
    pub item_y: usize,
}

impl SubproblemDim {
    pub fn swap_xy(&mut self) {
        std::mem::swap(&mut self.x, &mut self.y);
        std::mem::swap(&mut self.item_x, &mut self.item_y);
    }
}

/// Work-group shape for a solution step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PGranularity {
    /// Work space dimensionality, 1 or 2.
    pub wg_dim: u32,
    /// Work-group size per dimension; `wg_size[1]` is 1 when `wg_dim` is 1.
    pub wg_size: [u32; 2],
    /// Hardware wavefront size.
    pub wf_size: u32,
    /// Device limit the sizes were validated against.
    pub max_work_group_size: u32,
}

impl Default for PGranularity {
    fn default() -> PGranularity {
        PGranularity {
            wg_dim: 1,
            wg_size: [1, 1],
            wf_size: 64,
            max_work_group_size: 256,
        }
    }
}

impl PGranularity {
    /// Total number of work-items in one group.
    pub fn group_size(&self) -> u32 {
        self.wg_size[0] * self.wg_size[1]
    }

    pub fn is_valid(&self) -> bool {
        let sane = match self.wg_dim {
            1 => self.wg_size[1] == 1,
            2 => true,
            _ => false,
        };
        sane && self.group_size() <= self.max_work_group_size
    }
}

bitflags! {
    /// Static pattern properties reported by `SolverOps::flags`.
    pub struct SolverFlags: u32 {
        /// The pattern prefers a two-dimensional work space.
        const WSPACE_2D = 0x1;
        /// The top-level input tile must be square.
        const TOP_INPUT_SQUARE_BLOCKS = 0x2;
    }
}

/// Row pitch, in elements, of a block of the matrix playing `role`.
///
/// Used for sizing scratch images when a pattern stages packed blocks.
pub fn matr_block_pitch(
    dim: &SubproblemDim,
    role: MatrixRole,
    dtype: DataType,
    side: Side,
) -> usize {
    let pitch = match role {
        // A is the (possibly triangular) matrix: its panel width follows
        // the multiplication side.
        MatrixRole::A => match side {
            Side::Left => dim.bwidth.max(dim.y),
            Side::Right => dim.bwidth.max(dim.x),
        },
        MatrixRole::B | MatrixRole::C => dim.x,
    };
    // Pad to a float4 boundary so packed rows stay aligned.
    let quad = (16 / dtype.size()).max(1);
    util::round_up(pitch, quad)
}

/// Number of block rows of the matrix playing `role`.
pub fn matr_block_height(dim: &SubproblemDim, role: MatrixRole, side: Side) -> usize {
    match role {
        MatrixRole::A => match side {
            Side::Left => dim.y,
            Side::Right => dim.x,
        },
        MatrixRole::B | MatrixRole::C => dim.y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, MatrixRole, Side};

    #[test]
    fn pgran_validity() {
        let mut pg = PGranularity {
            wg_dim: 2,
            wg_size: [8, 8],
            wf_size: 64,
            max_work_group_size: 256,
        };
        assert!(pg.is_valid());
        pg.wg_size = [32, 16];
        assert!(!pg.is_valid());
        pg.wg_dim = 1;
        pg.wg_size = [64, 2];
        assert!(!pg.is_valid());
    }

    #[test]
    fn block_pitch_is_quad_aligned() {
        let dim = SubproblemDim {
            x: 24,
            y: 32,
            bwidth: 8,
            item_x: 4,
            item_y: 4,
        };
        let p = matr_block_pitch(&dim, MatrixRole::B, DataType::F32, Side::Left);
        assert_eq!(p % 4, 0);
        assert_eq!(p, 24);
        let p = matr_block_pitch(&dim, MatrixRole::A, DataType::F64, Side::Left);
        assert_eq!(p % 2, 0);
    }
}
