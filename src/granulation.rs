//! Granulation chooser: decides the two-level tile sizes and work-group
//! shape of a solution step.
//!
//! Source order: the persistent store, then a pattern-supplied default,
//! then the built-in default policy, finally shrinking anything that
//! exceeds the problem itself.

use crate::dims::{SubproblemDim, SUBDIM_UNUSED};
use crate::flags::KernelExtraFlags;
use crate::kargs::kargs_to_prob_dims;
use crate::pattern::{
    is_lds_used, is_matrix_cached, is_matrix_in_image, is_matrix_access_col_maj, DecompAxis,
    MemoryPattern,
};
use crate::dims::SolverFlags;
use crate::solution::SolutionStep;
use crate::storage::{self, Fetch};
use crate::types::{BlasFunction, DataType, MatrixRole};

const DEFAULT_BUFS_LSIZE_0: usize = 8;
const DEFAULT_BUFS_LSIZE_1: usize = 8;
const DEFAULT_CACHED_BUFS_LSIZE_0: usize = 8;
const DEFAULT_CACHED_BUFS_LSIZE_1: usize = 8;

/// Leading dimensions landing exactly on a memory-channel boundary get a
/// dedicated tuning record: 8 channels of 256 bytes.
const BANKS_ALIGNED_SIZE: usize = 8 * 256;

#[derive(Clone, Copy, PartialEq)]
enum SDimComponent {
    X,
    Y,
    Bwidth,
}

/// Combinations for which stored tunings are known to misbehave; the
/// built-in defaults are used instead.
pub fn avoid_load_from_storage(step: &SolutionStep) -> bool {
    let pattern = step.pattern();
    let both_cached = is_matrix_cached(pattern, MatrixRole::A)
        && is_matrix_cached(pattern, MatrixRole::B);
    if both_cached {
        return false;
    }

    // LDS GEMM kernels hang on some devices when the problem does not
    // tile evenly by 64.
    let not_div =
        step.args.m % 64 != 0 || step.args.n % 64 != 0 || step.args.k % 64 != 0;
    step.func == BlasFunction::Gemm && not_div
}

/// The dimension bucket a problem falls into, zero being the dedicated
/// bank-aligned record.
pub fn storage_dimension(step: &SolutionStep) -> usize {
    let pattern = step.pattern();
    let mut mnk = (step.args.m + step.args.n + step.args.k) / 3;

    if let Some(axis) = pattern.sops.inner_decomposition_axis(&step.args) {
        let ld = match axis {
            DecompAxis::X => step.args.ldb,
            DecompAxis::Y => step.args.lda,
        };
        if ld * step.args.dtype.size() % BANKS_ALIGNED_SIZE == 0 {
            mnk = 0;
        }
    }
    mnk
}

/// Fills `step.subdims` and `step.pgran`.
pub fn get_step_granulation(step: &mut SolutionStep) {
    let pattern = step.pattern();

    if !avoid_load_from_storage(step) {
        let dim = storage_dimension(step);
        if let Fetch::Data((subdims, pgran, _time)) = storage::get_granularity_info(
            &step.device,
            pattern.name,
            step.args.dtype,
            step.extra_flags,
            dim,
        ) {
            step.subdims = subdims;
            step.pgran = pgran;
            step.pgran.max_work_group_size = step.device.max_work_group_size as u32;
            if dimensions_exceed_problem_size(step) {
                get_minimal_step_granulation(step);
            }
            return;
        }
    }

    let mut pgran = step.pgran;
    let mut subdims = step.subdims;
    if pattern
        .sops
        .default_decomp(&mut pgran, &mut subdims, &step.args)
        .is_some()
    {
        step.pgran = pgran;
        step.subdims = subdims;
    } else {
        get_default_step_granulation(step);
    }

    if dimensions_exceed_problem_size(step) {
        get_minimal_step_granulation(step);
    }
}

fn nr_floats(dtype: DataType) -> usize {
    dtype.size() / 4
}

/// The built-in default policy.
pub fn get_default_step_granulation(step: &mut SolutionStep) {
    let pattern: &MemoryPattern = step.pattern();
    let dtype = step.args.dtype;
    let tsize = dtype.size();
    let nfl = nr_floats(dtype);
    let sflags = pattern.sops.flags();
    let square = sflags.contains(SolverFlags::TOP_INPUT_SQUARE_BLOCKS);
    let both_cached = is_matrix_cached(pattern, MatrixRole::A)
        && is_matrix_cached(pattern, MatrixRole::B);
    let lds_size = step.device.lds_size;

    let dims = &mut step.subdims;
    *dims = [SubproblemDim::default(); crate::dims::MAX_SUBDIMS];

    let mut wg_y;
    let mut wg_x;
    let bcoeff;
    let mut fixed_bw = false;

    if square {
        dims[0].x = if dtype == DataType::C64 { 16 } else { 32 };
        dims[0].y = dims[0].x;
        dims[0].bwidth = dims[0].y;
        bcoeff = nfl;
        wg_y = DEFAULT_BUFS_LSIZE_0;
        wg_x = DEFAULT_BUFS_LSIZE_1;
    } else {
        bcoeff = if dtype == DataType::C64 { 2 } else { 1 };
        if both_cached {
            wg_y = DEFAULT_CACHED_BUFS_LSIZE_0;
            wg_x = DEFAULT_CACHED_BUFS_LSIZE_1;
        } else {
            wg_y = DEFAULT_BUFS_LSIZE_0;
            wg_x = DEFAULT_BUFS_LSIZE_1;
        }

        // Block sizes covering a whole memory channel, or staying within
        // cache associativity, depending on how the operand is reached.
        if is_matrix_in_image(pattern, MatrixRole::A)
            || is_matrix_access_col_maj(step.func, step.extra_flags, MatrixRole::A)
        {
            dims[0].y = 64 / nfl;
            fixed_bw = true;
        } else {
            dims[0].y = 32;
        }
        if is_matrix_in_image(pattern, MatrixRole::B)
            || is_matrix_access_col_maj(step.func, step.extra_flags, MatrixRole::B)
        {
            dims[0].x = 64 / nfl;
            fixed_bw = true;
        } else {
            dims[0].x = 32;
        }

        dims[0].bwidth = 16 / bcoeff;
    }

    // Use at most half of the LDS so two work groups fit per compute unit.
    if lds_size > 0 {
        let budget = lds_size / 2;
        let mut component = SDimComponent::Bwidth;
        while pattern
            .sops
            .is_fit_to_lds(&dims[..], dtype, budget, &step.args)
            == Some(false)
        {
            if square {
                dims[0].x /= 2;
                dims[0].y /= 2;
                dims[0].bwidth /= 2;
            } else {
                match component {
                    SDimComponent::X => {
                        dims[0].x /= 2;
                        component = if dims[0].bwidth * tsize == 16 {
                            SDimComponent::Y
                        } else {
                            SDimComponent::Bwidth
                        };
                    }
                    SDimComponent::Y => {
                        dims[0].y /= 2;
                        component = SDimComponent::X;
                    }
                    SDimComponent::Bwidth => {
                        dims[0].bwidth /= 2;
                        component = SDimComponent::Y;
                    }
                }
            }
            if dims[0].x <= 1 && dims[0].y <= 1 && dims[0].bwidth * tsize <= 16 {
                break;
            }
        }
        debug_assert!(
            dims[0].x > 0 && dims[0].y > 0 && dims[0].bwidth * tsize >= 16
        );
    }

    // Shrink the local size if the block does not divide between all
    // local threads.
    while wg_y > 1 && dims[0].y < wg_y {
        wg_y /= 2;
    }
    while wg_x > 1 && dims[0].x < wg_x {
        wg_x /= 2;
    }

    let pgran = &mut step.pgran;
    if sflags.contains(SolverFlags::WSPACE_2D) {
        pgran.wg_dim = 2;
        dims[0].item_y = dims[0].y;
        pgran.wg_size[0] = wg_y as u32;
        pgran.wg_size[1] = wg_x as u32;
    } else {
        pgran.wg_dim = 1;
        pgran.wg_size[0] = (wg_x * wg_y) as u32;
        pgran.wg_size[1] = 1;
    }
    pgran.max_work_group_size = step.device.max_work_group_size as u32;
    pgran.wf_size = step.device.wavefront;

    // Divide the work between threads.
    dims[1].item_x = dims[0].x / wg_x;
    dims[1].item_y = dims[0].y / wg_y;
    dims[1].x = dims[1].item_x;
    dims[1].y = dims[1].item_y;

    if pattern.nr_levels == 1 && square {
        dims[1].bwidth = dims[1].y;
    } else {
        let cap = if fixed_bw { 4 } else { 8 / nfl };
        dims[1].bwidth = cap.max(1).min(dims[0].bwidth);
    }

    dims[0].item_x = dims[0].x;
    dims[0].item_y = dims[0].y;

    if step.func.has_triangular_matrix() && pgran.wg_dim == 1 {
        dims[0].item_y = SUBDIM_UNUSED;
        if pattern.nr_levels == 1 {
            dims[1].item_y = SUBDIM_UNUSED;
        }
    }

    if !(is_lds_used(pattern) || (square && pattern.nr_levels == 2)) {
        dims[0].bwidth = dims[1].bwidth;
    }

    // Level-2 routines keep a single-column decomposition and fold the
    // X blocks into the block width.
    if step.func.blas_level() == 2 {
        let x_blocks = (dims[0].x / dims[1].x.max(1)).max(1);
        dims[0].x = 1;
        dims[1].item_x = 1;
        dims[1].x = 1;
        dims[0].bwidth = dims[1].bwidth * x_blocks;
    }

    // Honor the pattern's preferred work dispatch order.
    if pgran.wg_dim == 2 {
        if let Some(DecompAxis::X) = pattern.sops.inner_decomposition_axis(&step.args) {
            pgran.wg_size.swap(0, 1);
        }
    }
}

/// Whether the thread-level tile exceeds the problem in any axis.
pub fn dimensions_exceed_problem_size(step: &SolutionStep) -> bool {
    if !matches!(
        step.func,
        BlasFunction::Gemv
            | BlasFunction::Symv
            | BlasFunction::Gemm
            | BlasFunction::Trmm
            | BlasFunction::Trsm
            | BlasFunction::Syrk
            | BlasFunction::Syr2k
    ) {
        return false;
    }
    if step.pattern().nr_levels != 2 {
        return false;
    }

    let prob = kargs_to_prob_dims(step.func, &step.args, false);
    let d = &step.subdims[1];
    (d.x != SUBDIM_UNUSED && d.x > prob.x)
        || (d.y != SUBDIM_UNUSED && d.y > prob.y)
        || d.bwidth > prob.bwidth
}

/// Shrinks a decomposition whose tiles exceed the problem, driving the
/// offending item sizes down to one.
pub fn get_minimal_step_granulation(step: &mut SolutionStep) {
    let prob = kargs_to_prob_dims(step.func, &step.args, false);
    let dims = &mut step.subdims;

    if dims[1].item_x != SUBDIM_UNUSED && dims[1].item_x > prob.x {
        let factor = dims[1].item_x;
        dims[1].item_x = 1;
        dims[1].x = (dims[1].x / factor).max(1);
        dims[0].item_x = (dims[0].item_x / factor).max(1);
        dims[0].x = (dims[0].x / factor).max(1);
    }
    if dims[1].item_y != SUBDIM_UNUSED && dims[1].item_y > prob.y {
        let factor = dims[1].item_y;
        dims[1].item_y = 1;
        dims[1].y = (dims[1].y / factor).max(1);
        dims[0].item_y = (dims[0].item_y / factor).max(1);
        dims[0].y = (dims[0].y / factor).max(1);
    }
    if dims[1].bwidth > prob.bwidth {
        dims[0].bwidth = (dims[0].bwidth / dims[1].bwidth).max(1);
        dims[1].bwidth = 1;
    }
}

/// Sets the tail flags from the final decomposition.
pub fn detect_problem_tails(step: &mut SolutionStep) {
    use KernelExtraFlags as F;

    let glob = kargs_to_prob_dims(step.func, &step.args, false);
    let subdim = &step.subdims[0];
    let mut kflags = F::empty();

    if subdim.y != 0 && subdim.y != SUBDIM_UNUSED && glob.y % subdim.y != 0 {
        kflags |= F::TAILS_M;
    }
    if subdim.x != 0 && subdim.x != SUBDIM_UNUSED && glob.x % subdim.x != 0 {
        kflags |= F::TAILS_N;
    }
    if subdim.bwidth != 0 && glob.bwidth % subdim.bwidth != 0 {
        kflags |= F::TAILS_K;
    }

    if step.pattern().nr_levels > 1 {
        let lower = &step.subdims[1];
        if lower.y != 0 && lower.y != SUBDIM_UNUSED && glob.y % lower.y != 0 {
            kflags |= F::TAILS_M_LOWER;
        }
        if lower.x != 0 && lower.x != SUBDIM_UNUSED && glob.x % lower.x != 0 {
            kflags |= F::TAILS_N_LOWER;
        }
        if lower.bwidth != 0 && glob.bwidth % lower.bwidth != 0 {
            kflags |= F::TAILS_K_LOWER;
        }
    } else {
        if kflags.contains(F::TAILS_M) {
            kflags |= F::TAILS_M_LOWER;
        }
        if kflags.contains(F::TAILS_N) {
            kflags |= F::TAILS_N_LOWER;
        }
        if kflags.contains(F::TAILS_K) {
            kflags |= F::TAILS_K_LOWER;
        }
    }

    step.extra_flags.remove(F::tails());
    step.extra_flags |= kflags;
}

/// Sets the nonzero-offset flags from the final arguments.
pub fn detect_offsets(step: &mut SolutionStep) {
    use KernelExtraFlags as F;
    let args = &step.args;

    if args.offset_m != 0 {
        step.extra_flags |= F::STARTM_NOT_ZERO;
    }
    if args.offset_n != 0 {
        step.extra_flags |= F::STARTN_NOT_ZERO;
    }
    if args.off_a != 0 {
        step.extra_flags |= F::A_OFF_NOT_ZERO;
    }
    if args.off_bx != 0 {
        step.extra_flags |= F::BX_OFF_NOT_ZERO;
    }
    if args.off_cy != 0 {
        step.extra_flags |= F::CY_OFF_NOT_ZERO;
    }
}

/// Debug check of the granulation invariants.
pub fn assert_granulation(step: &SolutionStep) {
    let d0 = &step.subdims[0];
    let d1 = &step.subdims[1];
    debug_assert!(step.pgran.is_valid());
    if d1.item_x != SUBDIM_UNUSED && d1.item_x != 0 && d0.x != SUBDIM_UNUSED {
        debug_assert_eq!(d0.x % d1.item_x, 0);
        debug_assert!(d0.x >= d1.item_x);
    }
    if d1.item_y != SUBDIM_UNUSED && d1.item_y != 0 && d0.item_y != SUBDIM_UNUSED {
        debug_assert_eq!(d0.y % d1.item_y, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dims::PGranularity;
    use crate::solution::SolutionStep;
    use crate::storage::tests::synthetic_device;
    use crate::types::DataType;
    use crate::kargs::ProblemArgs;
    use crate::flags::flags_from_args;

    fn make_step(
        func: BlasFunction,
        dtype: DataType,
        m: usize,
        n: usize,
        k: usize,
        pattern: usize,
    ) -> SolutionStep {
        let mut args = ProblemArgs::new(dtype);
        args.m = m;
        args.n = n;
        args.k = k;
        args.lda = k.max(n);
        args.ldb = n.max(1);
        args.ldc = n.max(1);
        let flags = flags_from_args(&args, func);
        let mut step = SolutionStep::new(func, args, synthetic_device(), Some(0));
        step.pattern = pattern;
        step.extra_flags = flags;
        step
    }

    #[test]
    fn square_gemm_defaults_match_the_aligned_case() {
        // 1024^3 single-precision GEMM on the LDS pattern.
        let mut step = make_step(BlasFunction::Gemm, DataType::F32, 1024, 1024, 1024, 0);
        get_default_step_granulation(&mut step);

        let d0 = step.subdims[0];
        assert_eq!((d0.y, d0.x, d0.bwidth), (32, 32, 32));
        assert_eq!((d0.item_y, d0.item_x), (32, 32));
        assert_eq!(step.pgran.wg_dim, 2);
        assert_eq!(step.pgran.wg_size, [8, 8]);
        assert!(step.pgran.is_valid());

        detect_problem_tails(&mut step);
        assert!(!step.extra_flags.intersects(KernelExtraFlags::tails()));
    }

    #[test]
    fn complex_double_square_blocks_shrink() {
        let mut step = make_step(BlasFunction::Gemm, DataType::C64, 512, 512, 512, 0);
        get_default_step_granulation(&mut step);
        assert_eq!(step.subdims[0].x, step.subdims[0].y);
        assert!(step.subdims[0].x <= 16);
    }

    #[test]
    fn tails_are_detected_per_axis() {
        let mut step = make_step(BlasFunction::Gemm, DataType::F32, 1025, 1023, 1024, 0);
        get_default_step_granulation(&mut step);
        detect_problem_tails(&mut step);

        use KernelExtraFlags as F;
        assert!(step.extra_flags.contains(F::TAILS_M));
        assert!(step.extra_flags.contains(F::TAILS_N));
        assert!(!step.extra_flags.contains(F::TAILS_K));
        assert!(step.extra_flags.contains(F::TAILS_M_LOWER));
        assert!(step.extra_flags.contains(F::TAILS_N_LOWER));
    }

    #[test]
    fn triangular_one_dim_dispatch_marks_unused_axes() {
        // BufferTrmm: square blocks, 1-D work space.
        let mut step = make_step(BlasFunction::Trmm, DataType::F32, 512, 512, 512, 0);
        get_default_step_granulation(&mut step);
        assert_eq!(step.pgran.wg_dim, 1);
        assert_eq!(step.subdims[0].item_y, SUBDIM_UNUSED);
    }

    #[test]
    fn level2_collapses_the_x_axis() {
        let mut step = make_step(BlasFunction::Gemv, DataType::F32, 4096, 4096, 4096, 0);
        get_default_step_granulation(&mut step);
        assert_eq!(step.subdims[0].x, 1);
        assert_eq!(step.subdims[1].x, 1);
        assert!(step.subdims[0].bwidth >= step.subdims[1].bwidth);
    }

    #[test]
    fn oversized_tiles_shrink_to_the_problem() {
        let mut step = make_step(BlasFunction::Gemm, DataType::F32, 8, 8, 8, 0);
        get_default_step_granulation(&mut step);
        if dimensions_exceed_problem_size(&step) {
            get_minimal_step_granulation(&mut step);
        }
        assert!(!dimensions_exceed_problem_size(&step));
        let d1 = step.subdims[1];
        assert!(d1.item_x <= 8 && d1.item_y <= 8 && d1.bwidth <= 8);
    }

    #[test]
    fn granulation_validity_sweep() {
        let sizes = [(64, 64, 64), (1024, 1024, 1024), (384, 128, 96), (100, 60, 30)];
        for &func in BlasFunction::all().iter() {
            let solvers = crate::pattern::SOLVERS.function(func);
            for pat in 0..solvers.nr_patterns() {
                for &dtype in DataType::all().iter() {
                    for &(m, n, k) in sizes.iter() {
                        let mut step = make_step(func, dtype, m, n, k, pat);
                        get_step_granulation(&mut step);
                        assert!(
                            step.pgran.is_valid(),
                            "{} pattern {} {:?} {}x{}x{}",
                            func,
                            pat,
                            dtype,
                            m,
                            n,
                            k
                        );
                        assert_granulation(&step);

                        // Square-block patterns come out square whenever
                        // the problem itself did not force a shrink.
                        let sflags = solvers.pattern(pat).sops.flags();
                        if sflags.contains(SolverFlags::TOP_INPUT_SQUARE_BLOCKS)
                            && m >= 32
                            && n >= 32
                            && k >= 32
                        {
                            let d0 = step.subdims[0];
                            assert_eq!(d0.x, d0.y, "{} pattern {}", func, pat);
                            assert_eq!(d0.y, d0.bwidth, "{} pattern {}", func, pat);
                        }

                        // LDS budget invariant.
                        let budget = step.device.lds_size / 2;
                        if let Some(fit) = solvers.pattern(pat).sops.is_fit_to_lds(
                            &step.subdims,
                            dtype,
                            budget,
                            &step.args,
                        ) {
                            assert!(fit, "{} pattern {} does not fit LDS", func, pat);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn default_pgran_is_initialized() {
        let step = make_step(BlasFunction::Gemm, DataType::F32, 64, 64, 64, 0);
        let pg = PGranularity::default();
        assert_eq!(step.pgran.wf_size, pg.wf_size);
    }
}
