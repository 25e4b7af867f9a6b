//! Problem decomposer: splits a BLAS call across command queues, rewrites
//! compound operations into event-chained sub-steps, and selects the
//! per-operand vectorization.

use crate::flags::{flags_from_args, KernelExtra, KernelExtraFlags};
use crate::kargs::{kargs_to_prob_dims, prob_dims_to_kargs, ProblemArgs};
use crate::pattern::{is_lds_used, is_matrix_access_col_maj, SOLVERS};
use crate::solution::SolutionStep;
use crate::types::{BlasFunction, DataType, MatrixRole, Multiplier, Side, Transpose, Uplo};
use crate::util::align;

/// Work divisions between queues are aligned to this many elements.
pub const DIVISION_ALIGNMENT: usize = 128;

/// Problem edge above which TRMM/TRSM decomposition pays off.
pub fn decomposition_threshold(dtype: DataType) -> usize {
    2560 * 4 / dtype.size()
}

/// Splits the problem between the queues' steps proportionally to their
/// compute-unit share. A share rounding to zero nulls the queue.
pub fn shard_queues(
    func: BlasFunction,
    args: &ProblemArgs,
    steps: &mut [SolutionStep],
    total_cus: u32,
) {
    match func {
        BlasFunction::Gemm => rect_division(func, args, steps, total_cus),
        BlasFunction::Syrk | BlasFunction::Syr2k => {
            tri_matrix_stripe_division(func, args, steps, total_cus)
        }
        _ => stripe_division(func, args, steps, total_cus),
    }

    // A queue can end up with an empty remainder once shares are rounded
    // to the division alignment.
    for step in steps.iter_mut() {
        let size = kargs_to_prob_dims(func, &step.args, false);
        if size.y == 0 || size.x == 0 {
            step.queue = None;
        }
    }
}

/// Stripe division: vertical slices of the output, along M for GEMV and
/// along N otherwise.
fn stripe_division(
    func: BlasFunction,
    args: &ProblemArgs,
    steps: &mut [SolutionStep],
    mut total_cus: u32,
) {
    let mut offset = kargs_to_prob_dims(func, args, true);
    let mut size = kargs_to_prob_dims(func, args, false);
    let mut first = true;

    for step in steps.iter_mut() {
        let nr_cu = step.device.compute_units;

        if total_cus == 0 {
            step.queue = None;
            continue;
        }

        let mut step_size = size;
        if !first {
            prob_dims_to_kargs(&mut step.args, func, &offset, true);
        }

        if func == BlasFunction::Gemv {
            if total_cus != nr_cu {
                step_size.y =
                    (size.y as f64 * nr_cu as f64 / total_cus as f64 + 0.5) as usize;
                step_size.y = align(step_size.y, DIVISION_ALIGNMENT);
                if step_size.y == 0 {
                    step.queue = None;
                } else if step_size.y > size.y {
                    step_size.y = size.y;
                    total_cus = nr_cu;
                }
            }
            offset.y += step_size.y;
            size.y -= step_size.y;
        } else {
            if total_cus != nr_cu {
                step_size.x =
                    (size.x as f64 * nr_cu as f64 / total_cus as f64 + 0.5) as usize;
                step_size.x = align(step_size.x, DIVISION_ALIGNMENT);
                if step_size.x == 0 {
                    step.queue = None;
                } else if step_size.x > size.x {
                    step_size.x = size.x;
                    total_cus = nr_cu;
                }
            }
            offset.x += step_size.x;
            size.x -= step_size.x;
        }

        total_cus = total_cus.saturating_sub(nr_cu);
        prob_dims_to_kargs(&mut step.args, func, &step_size, false);
        first = false;
    }
}

/// Rectangular division for GEMM: the longest axis is split first, and
/// queues are visited in decreasing compute-unit order.
fn rect_division(
    func: BlasFunction,
    args: &ProblemArgs,
    steps: &mut [SolutionStep],
    mut total_cus: u32,
) {
    let mut order: Vec<usize> = (0..steps.len()).collect();
    order.sort_by(|&a, &b| steps[b].device.compute_units.cmp(&steps[a].device.compute_units));

    let mut offset = kargs_to_prob_dims(func, args, true);
    let mut size = kargs_to_prob_dims(func, args, false);

    for (l, &si) in order.iter().enumerate() {
        let step = &mut steps[si];
        let nr_cu = step.device.compute_units;

        if total_cus == 0 {
            step.queue = None;
            continue;
        }

        let mut step_size = size;
        if l > 0 {
            prob_dims_to_kargs(&mut step.args, func, &offset, true);
        }

        if size.y > size.x {
            if total_cus != nr_cu {
                step_size.y =
                    (size.y as f64 * nr_cu as f64 / total_cus as f64 + 0.5) as usize;
                step_size.y = align(step_size.y, DIVISION_ALIGNMENT);
                if step_size.y > size.y {
                    step_size.y = size.y;
                    total_cus = nr_cu;
                } else if step_size.y == 0 {
                    step.queue = None;
                }
            }
            size.y -= step_size.y;
            offset.y += step_size.y;
        } else {
            if total_cus != nr_cu {
                step_size.x =
                    (size.x as f64 * nr_cu as f64 / total_cus as f64 + 0.5) as usize;
                step_size.x = align(step_size.x, DIVISION_ALIGNMENT);
                if step_size.x > size.x {
                    step_size.x = size.x;
                    total_cus = nr_cu;
                } else if step_size.x == 0 {
                    step.queue = None;
                }
            }
            size.x -= step_size.x;
            offset.x += step_size.x;
        }

        prob_dims_to_kargs(&mut step.args, func, &step_size, false);
        total_cus = total_cus.saturating_sub(nr_cu);
    }
}

/// Triangular stripe division for SYRK/SYR2K: row stripes sized so each
/// queue gets an equal share of the triangular area, working bottom to
/// top when the upper triangle is stored.
fn tri_matrix_stripe_division(
    func: BlasFunction,
    args: &ProblemArgs,
    steps: &mut [SolutionStep],
    mut total_cus: u32,
) {
    let mut offset = kargs_to_prob_dims(func, args, true);
    let mut size = kargs_to_prob_dims(func, args, false);
    let mut top = 0usize;
    let upper = args.uplo == Uplo::Upper;

    if upper {
        offset.y += size.y;
    }

    for step in steps.iter_mut() {
        let nr_cu = step.device.compute_units;

        if total_cus == 0 {
            step.queue = None;
            continue;
        }

        let mut step_offset = offset;
        let mut step_size = size;

        if total_cus != nr_cu {
            let ratio = nr_cu as f64 / total_cus as f64;
            let t = top as f64;
            let y = (t * t + ratio * size.y as f64 * (t + size.x as f64)).sqrt() - t;
            step_size.y = align(y as usize, DIVISION_ALIGNMENT);
            if step_size.y == 0 || step_size.y > size.y {
                step_size.y = size.y;
                total_cus = nr_cu;
            } else if upper && offset.y != align(offset.y, DIVISION_ALIGNMENT) {
                // Splitting runs bottom to top; keep the cut aligned.
                let mut o = align(offset.y - step_size.y, DIVISION_ALIGNMENT);
                if o > offset.y {
                    o = o.saturating_sub(2 * DIVISION_ALIGNMENT);
                }
                step_size.y = offset.y - o;
            }
        } else {
            step_size.y = size.y;
        }

        size.y -= step_size.y;
        top += step_size.y;
        if upper {
            offset.y -= step_size.y;
            step_offset = offset;
        } else {
            offset.y += step_size.y;
        }

        prob_dims_to_kargs(&mut step.args, func, &step_offset, true);
        prob_dims_to_kargs(&mut step.args, func, &step_size, false);

        total_cus = total_cus.saturating_sub(nr_cu);
    }
}

/// Folds the block offsets (and an extra K offset) into the buffer
/// offsets, honoring transpositions and storage order, and clears the
/// block offsets.
pub fn fixup_gemm_offsets(args: &mut ProblemArgs, kflags: KernelExtraFlags, offset_k: usize) {
    if is_matrix_access_col_maj(BlasFunction::Gemm, kflags, MatrixRole::A) {
        args.off_a += offset_k * args.lda + args.offset_m;
    } else {
        args.off_a += args.offset_m * args.lda + offset_k;
    }
    if is_matrix_access_col_maj(BlasFunction::Gemm, kflags, MatrixRole::B) {
        args.off_bx += offset_k * args.ldb + args.offset_n;
    } else {
        args.off_bx += args.offset_n * args.ldb + offset_k;
    }
    if is_matrix_access_col_maj(BlasFunction::Gemm, kflags, MatrixRole::C) {
        args.off_cy += args.offset_n * args.ldc + args.offset_m;
    } else {
        args.off_cy += args.offset_m * args.ldc + args.offset_n;
    }
    args.offset_m = 0;
    args.offset_n = 0;
}

/// Inserts a step, shifting the dependency indices of everything that
/// referred to positions at or past the insertion point.
fn insert_step(seq: &mut Vec<SolutionStep>, pos: usize, step: SolutionStep) {
    for s in seq.iter_mut() {
        if let Some(d) = s.depends_on {
            if d >= pos {
                s.depends_on = Some(d + 1);
            }
        }
    }
    seq.insert(pos, step);
}

/// Applies the function-specific decomposition to the step at `idx`,
/// returning the index of the last step of its replacement chain.
pub fn decompose_problem_step(seq: &mut Vec<SolutionStep>, idx: usize) -> usize {
    match seq[idx].func {
        BlasFunction::Trmm | BlasFunction::Trsm => decompose_trxm_step(seq, idx),
        BlasFunction::Syrk => decompose_syrk_step(seq, idx),
        BlasFunction::Syr2k => decompose_syr2k_step(seq, idx),
        _ => idx,
    }
}

/// TRxM → TRxM + GEMM + TRxM.
///
/// Matrix A quadrant numbering:
///
/// ```text
///     +---+---+
///     | 1 | 2 |
///     +---+---+
///     | 3 | 4 |
///     +---+---+
/// ```
fn decompose_trxm_step(seq: &mut Vec<SolutionStep>, idx: usize) -> usize {
    let step = &seq[idx];
    let func = step.func;
    let args = &step.args;

    // A TRMM case that runs faster undecomposed.
    if func == BlasFunction::Trmm
        && !args.dtype.is_double_based()
        && is_matrix_access_col_maj(func, step.extra_flags, MatrixRole::B)
    {
        return idx;
    }

    // Forced pattern overrides disable the rewrite, since the chain
    // depends on the default GEMM and TRxM strategies.
    if SOLVERS.function(BlasFunction::Gemm).default_pattern.is_some()
        || SOLVERS.function(func).default_pattern.is_some()
    {
        return idx;
    }

    let thresh = decomposition_threshold(args.dtype);
    let edge = if args.side == Side::Left { args.m } else { args.n };
    if edge < thresh {
        return idx;
    }

    let mut trxm1 = seq[idx].clone();
    let mut gemm = seq[idx].clone();
    let mut trxm2 = seq[idx].clone();
    let kargs = seq[idx].args.clone();

    gemm.func = BlasFunction::Gemm;
    gemm.args.c = kargs.b.clone();
    gemm.args.ldc = kargs.ldb;
    gemm.args.off_cy = kargs.off_bx;
    if func == BlasFunction::Trsm && !kargs.alpha.is_zero() {
        gemm.args.alpha = kargs.alpha.neg_recip();
    }
    gemm.args.beta = Multiplier::one();

    // Position of A's populated triangle once the transposition is
    // applied.
    let position = if kargs.trans_a == Transpose::None {
        kargs.uplo
    } else {
        kargs.uplo.other()
    };

    let mut offset_k = 0usize;

    if kargs.side == Side::Left {
        let half = align(kargs.m / 2, DIVISION_ALIGNMENT);

        // trxm1 covers A1, trxm2 covers A4.
        trxm1.args.m = half;
        trxm2.args.offset_m += half;
        trxm2.args.m = kargs.m - half;
        trxm1.args.k = trxm1.args.m;
        trxm2.args.k = trxm2.args.m;

        gemm.args.trans_b = Transpose::None;
        gemm.args.k = kargs.m;

        if position == Uplo::Upper {
            // GEMM covers A2: top rows, bottom half of K.
            gemm.args.m = half;
            offset_k = align(gemm.args.k / 2, DIVISION_ALIGNMENT);
            gemm.args.k -= offset_k;
        } else {
            // GEMM covers A3: bottom rows, top half of K.
            gemm.args.offset_m += half;
            gemm.args.m = kargs.m - half;
            gemm.args.k = align(gemm.args.k / 2, DIVISION_ALIGNMENT);
        }
    } else {
        let half = align(kargs.n / 2, DIVISION_ALIGNMENT);

        trxm1.args.n = half;
        trxm2.args.offset_n += half;
        trxm2.args.n = kargs.n - half;
        trxm1.args.k = trxm1.args.n;
        trxm2.args.k = trxm2.args.n;

        // B becomes the left GEMM operand.
        gemm.args.trans_a = Transpose::None;
        gemm.args.a = kargs.b.clone();
        gemm.args.lda = kargs.ldb;
        gemm.args.off_a = kargs.off_bx;
        gemm.args.trans_b = kargs.trans_a;
        gemm.args.b = kargs.a.clone();
        gemm.args.ldb = kargs.lda;
        gemm.args.off_bx = kargs.off_a;
        gemm.args.k = kargs.n;

        if position == Uplo::Upper {
            // GEMM covers A2: right columns, top half of K.
            gemm.args.offset_n += half;
            gemm.args.n = kargs.n - half;
            gemm.args.k = align(gemm.args.k / 2, DIVISION_ALIGNMENT);
        } else {
            // GEMM covers A3: left columns, bottom half of K.
            gemm.args.n = half;
            offset_k = align(gemm.args.k / 2, DIVISION_ALIGNMENT);
            gemm.args.k -= offset_k;
        }
    }

    trxm1.extra_flags = flags_from_args(&trxm1.args, trxm1.func);
    gemm.extra_flags = flags_from_args(&gemm.args, gemm.func);
    trxm2.extra_flags = flags_from_args(&trxm2.args, trxm2.func);

    fixup_gemm_offsets(&mut gemm.args, gemm.extra_flags, offset_k);

    // The solver works towards the diagonal, the multiplier away from it;
    // swap the triangular halves accordingly.
    let swap = match (kargs.side, func, position) {
        (Side::Left, BlasFunction::Trmm, Uplo::Lower) => true,
        (Side::Left, BlasFunction::Trsm, Uplo::Upper) => true,
        (Side::Right, BlasFunction::Trmm, Uplo::Upper) => true,
        (Side::Right, BlasFunction::Trsm, Uplo::Lower) => true,
        _ => false,
    };
    if swap {
        std::mem::swap(&mut trxm1, &mut trxm2);
    }

    trxm1.depends_on = seq[idx].depends_on;
    seq[idx] = trxm1;
    insert_step(seq, idx + 1, gemm);
    insert_step(seq, idx + 2, trxm2);
    // Anything that waited for the original step now waits for the tail.
    retarget_deps(seq, idx, idx + 2);
    seq[idx + 1].depends_on = Some(idx);
    seq[idx + 2].depends_on = Some(idx + 1);

    idx + 2
}

/// Redirects dependencies on `from` to `to` (chain replacement).
fn retarget_deps(seq: &mut [SolutionStep], from: usize, to: usize) {
    for s in seq.iter_mut() {
        if s.depends_on == Some(from) {
            s.depends_on = Some(to);
        }
    }
}

/// Splits a SYRK so the diagonal is evaluated in a dedicated kernel,
/// which otherwise costs the whole kernel a huge register allocation.
fn decompose_syrk_step(seq: &mut Vec<SolutionStep>, idx: usize) -> usize {
    let args = &seq[idx].args;

    // Without sub-tile tails the unified kernel is faster; tile sizes are
    // assumed to stay within 8.
    if args.m % 8 == 0 && args.n % 8 == 0 {
        return idx;
    }
    if args.m < decomposition_threshold(args.dtype) / 2 {
        return idx;
    }

    seq[idx]
        .extra_flags
        .insert(KernelExtraFlags::SYRK_SEPARATE_DIAGONAL);

    let mut diag = seq[idx].clone();
    diag.extra_flags
        .remove(KernelExtraFlags::SYRK_SEPARATE_DIAGONAL);
    diag.extra_flags
        .insert(KernelExtraFlags::SYRK_EVALUATE_DIAGONAL);

    insert_step(seq, idx + 1, diag);
    retarget_deps(seq, idx, idx + 1);
    seq[idx + 1].depends_on = Some(idx);

    idx + 1
}

/// SYR2K → SYRK(A·Bᵀ) + SYRK(B·Aᵀ, β = 1), each half further split by the
/// SYRK diagonal rule.
fn decompose_syr2k_step(seq: &mut Vec<SolutionStep>, idx: usize) -> usize {
    let args = &seq[idx].args;
    if args.m < decomposition_threshold(args.dtype) / 2 {
        return idx;
    }

    let mut second = seq[idx].clone();
    let kargs = seq[idx].args.clone();
    second.args.a = kargs.b.clone();
    second.args.lda = kargs.ldb;
    second.args.off_a = kargs.off_bx;
    second.args.b = kargs.a.clone();
    second.args.ldb = kargs.lda;
    second.args.off_bx = kargs.off_a;
    second.args.beta = Multiplier::one();

    let first = &mut seq[idx];
    first.extra_flags = flags_from_args(&first.args, first.func);
    second.extra_flags = flags_from_args(&second.args, second.func);

    insert_step(seq, idx + 1, second);
    seq[idx + 1].depends_on = Some(idx);

    // Apply the diagonal split to the later half first so the earlier
    // split's insertion does not shift it under our feet.
    let last2 = decompose_syrk_step(seq, idx + 1);
    let last1 = decompose_syrk_step(seq, idx);
    last2 + (last1 - idx)
}

/// Finds the widest vector length dividing both the leading dimension and
/// the tile edge it spans.
pub fn appropriate_vec_len(ld: usize, tsize: usize, twidth: usize, func_level: u32) -> u32 {
    let mut vlen = (16 / tsize).max(1);
    if func_level == 3 {
        vlen *= 2;
    }
    let twidth = twidth.max(1);
    while vlen > twidth {
        vlen /= 2;
    }
    while vlen > 1 && (ld % vlen != 0 || twidth % vlen != 0) {
        vlen /= 2;
    }
    vlen.max(1) as u32
}

/// Selects per-operand vector widths and the `NO_COPY_VEC_*` flags for a
/// step. Patterns staging through LDS use a fixed float4-equivalent
/// width and handle alignment themselves.
pub fn select_vectorization(step: &SolutionStep, kextra: &mut KernelExtra) {
    use KernelExtraFlags as F;

    let pattern = step.pattern();
    let kargs = &step.args;
    let mut kflags = kextra.flags;
    let tsize = kargs.dtype.size();
    let dim = &step.subdims[1];
    let level = step.func.blas_level();
    let quad = (16 / tsize).max(1);

    if is_lds_used(pattern) {
        let v = quad as u32;
        kextra.vec_len = v;
        kextra.vec_len_a = v;
        kextra.vec_len_b = v;
        kextra.vec_len_c = v;
    } else {
        kextra.vec_len_a = 0;
        kextra.vec_len_b = 0;
        kextra.vec_len_c = 0;
    }

    let vec_flags = [F::NO_COPY_VEC_A, F::NO_COPY_VEC_B, F::NO_COPY_VEC_C];

    for pass in 0..2 {
        let mut checked = if pass == 0 {
            if level == 2 {
                [kargs.lda, 0, 0]
            } else {
                [kargs.lda, kargs.ldb, kargs.ldc]
            }
        } else {
            [kargs.off_a, kargs.off_bx, kargs.off_cy]
        };

        if step.func.has_triangular_matrix() {
            checked[2] = checked[1];
        }

        // Vector staging from global memory needs float4 alignment.
        for (j, &size) in checked.iter().enumerate() {
            if size % quad != 0 {
                kflags |= vec_flags[j];
            }
        }

        kflags |= pattern.sops.select_vectorization(kargs, quad as u32);

        if is_lds_used(pattern) {
            continue;
        }

        let edge = |v: usize| {
            if v == crate::dims::SUBDIM_UNUSED {
                1
            } else {
                v
            }
        };

        let tra = is_matrix_access_col_maj(step.func, kflags, MatrixRole::A);
        let tw = if tra { edge(dim.y) } else { edge(dim.bwidth) };
        let vlen = appropriate_vec_len(checked[0], tsize, tw, level);
        kextra.vec_len_a = if kextra.vec_len_a != 0 {
            kextra.vec_len_a.min(vlen)
        } else {
            vlen
        };

        let trb = is_matrix_access_col_maj(step.func, kflags, MatrixRole::B);
        let tw = if level == 2 || !trb {
            edge(dim.bwidth)
        } else {
            edge(dim.x)
        };
        let vlen = appropriate_vec_len(checked[1], tsize, tw, level);
        kextra.vec_len_b = if kextra.vec_len_b != 0 {
            kextra.vec_len_b.min(vlen)
        } else {
            vlen
        };

        let trc = is_matrix_access_col_maj(step.func, kflags, MatrixRole::C);
        let tw = if level == 2 || trc {
            edge(dim.y)
        } else {
            edge(dim.x)
        };
        let vlen = appropriate_vec_len(checked[2], tsize, tw, level);
        kextra.vec_len_c = if kextra.vec_len_c != 0 {
            kextra.vec_len_c.min(vlen)
        } else {
            vlen
        };

        kextra.vec_len = kextra
            .vec_len_a
            .min(kextra.vec_len_b)
            .min(kextra.vec_len_c)
            .max(1);
    }

    kextra.flags = kflags;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceDescriptor;
    use crate::storage::tests::synthetic_device;
    use crate::types::{DataType, Diag};

    fn device_with_cus(cus: u32) -> DeviceDescriptor {
        let mut desc = synthetic_device();
        desc.compute_units = cus;
        desc
    }

    fn steps_for(func: BlasFunction, args: &ProblemArgs, cus: &[u32]) -> Vec<SolutionStep> {
        cus.iter()
            .enumerate()
            .map(|(i, &c)| {
                let mut step =
                    SolutionStep::new(func, args.clone(), device_with_cus(c), Some(i));
                step.extra_flags = flags_from_args(args, func);
                step
            })
            .collect()
    }

    fn check_chain(seq: &[SolutionStep]) {
        // Dependencies must point backwards and form no cycles.
        for (i, step) in seq.iter().enumerate() {
            if let Some(d) = step.depends_on {
                assert!(d < i, "step {} depends forward on {}", i, d);
            }
        }
    }

    #[test]
    fn gemv_stripe_respects_cu_shares() {
        let mut args = ProblemArgs::new(DataType::F32);
        args.m = 10000;
        args.n = 500;
        args.lda = 500;

        let mut steps = steps_for(BlasFunction::Gemv, &args, &[24, 8]);
        shard_queues(BlasFunction::Gemv, &args, &mut steps, 32);

        // 24/32 of 10000 rounded to the 128-element boundary.
        assert_eq!(steps[0].args.m, 7552);
        assert_eq!(steps[0].args.offset_m, 0);
        assert_eq!(steps[1].args.offset_m, 7552);
        assert_eq!(steps[1].args.m, 10000 - 7552);
        assert!(steps[0].args.m % DIVISION_ALIGNMENT == 0);
    }

    #[test]
    fn zero_share_nulls_the_queue() {
        let mut args = ProblemArgs::new(DataType::F32);
        args.m = 128;
        args.n = 128;
        args.k = 128;

        let mut steps = steps_for(BlasFunction::Gemm, &args, &[64, 1]);
        shard_queues(BlasFunction::Gemm, &args, &mut steps, 65);
        let live: Vec<_> = steps.iter().filter(|s| s.queue.is_some()).collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].args.m, 128);
    }

    #[test]
    fn gemm_rect_division_splits_longest_axis() {
        let mut args = ProblemArgs::new(DataType::F32);
        args.m = 4096;
        args.n = 1024;
        args.k = 512;

        let mut steps = steps_for(BlasFunction::Gemm, &args, &[16, 16]);
        shard_queues(BlasFunction::Gemm, &args, &mut steps, 32);

        // M is the longest axis; both halves cover it fully in N.
        let sum: usize = steps.iter().map(|s| s.args.m).sum();
        assert_eq!(sum, 4096);
        for s in &steps {
            assert_eq!(s.args.n, 1024);
        }
    }

    #[test]
    fn syrk_triangular_division_covers_all_rows() {
        let mut args = ProblemArgs::new(DataType::F32);
        args.m = 2048;
        args.n = 2048;
        args.k = 256;

        for &uplo in &[Uplo::Lower, Uplo::Upper] {
            let mut args = args.clone();
            args.uplo = uplo;
            let mut steps = steps_for(BlasFunction::Syrk, &args, &[16, 16]);
            shard_queues(BlasFunction::Syrk, &args, &mut steps, 32);
            let sum: usize = steps.iter().map(|s| s.args.m).sum();
            assert_eq!(sum, 2048, "{:?}", uplo);
            // The first stripe gets less area per row near the triangle
            // tip, so shares are not equal in rows.
            assert!(steps[0].args.m % DIVISION_ALIGNMENT == 0 || steps[1].args.m == 0);
        }
    }

    #[test]
    fn trsm_left_lower_decomposes_into_three_steps() {
        let mut args = ProblemArgs::new(DataType::F32);
        args.m = 4096;
        args.n = 512;
        args.k = 4096;
        args.side = Side::Left;
        args.uplo = Uplo::Lower;
        args.diag = Diag::NonUnit;
        args.alpha = Multiplier::real(2.0);
        args.lda = 4096;
        args.ldb = 512;
        args.ldc = 512;

        let mut seq = steps_for(BlasFunction::Trsm, &args, &[32]);
        let last = decompose_problem_step(&mut seq, 0);

        assert_eq!(last, 2);
        assert_eq!(seq.len(), 3);
        assert_eq!(seq[0].func, BlasFunction::Trsm);
        assert_eq!(seq[1].func, BlasFunction::Gemm);
        assert_eq!(seq[2].func, BlasFunction::Trsm);

        // Event chain: gemm waits on trxm1, trxm2 waits on gemm.
        assert_eq!(seq[1].depends_on, Some(0));
        assert_eq!(seq[2].depends_on, Some(1));
        check_chain(&seq);

        // The GEMM folds -1/alpha and beta = 1.
        assert_eq!(seq[1].args.alpha, Multiplier::real(-0.5));
        assert_eq!(seq[1].args.beta, Multiplier::one());

        // Split respects the division alignment.
        assert_eq!(seq[0].args.m % DIVISION_ALIGNMENT, 0);
        assert_eq!(seq[0].args.m + seq[2].args.m, 4096);

        // Lower solve: the A1 solve must come first (no swap).
        assert_eq!(seq[0].args.offset_m, 0);
    }

    #[test]
    fn trsm_below_threshold_stays_single() {
        let mut args = ProblemArgs::new(DataType::F32);
        args.m = 2048;
        args.n = 512;
        args.side = Side::Left;
        let mut seq = steps_for(BlasFunction::Trsm, &args, &[32]);
        let last = decompose_problem_step(&mut seq, 0);
        assert_eq!(last, 0);
        assert_eq!(seq.len(), 1);
    }

    #[test]
    fn trmm_solve_direction_orders_the_halves() {
        let mut args = ProblemArgs::new(DataType::F64);
        args.m = 4096;
        args.n = 256;
        args.side = Side::Left;
        args.uplo = Uplo::Upper;
        args.lda = 4096;
        args.ldb = 256;

        // Upper-left multiply walks away from the diagonal starting at
        // the top block: no swap.
        let mut seq = steps_for(BlasFunction::Trmm, &args, &[32]);
        decompose_problem_step(&mut seq, 0);
        assert_eq!(seq.len(), 3);
        assert_eq!(seq[0].args.offset_m, 0);
        check_chain(&seq);

        // Lower-left multiply must update the far half first.
        args.uplo = Uplo::Lower;
        let mut seq = steps_for(BlasFunction::Trmm, &args, &[32]);
        decompose_problem_step(&mut seq, 0);
        assert_eq!(seq.len(), 3);
        assert_ne!(seq[0].args.offset_m, 0);
        check_chain(&seq);
    }

    #[test]
    fn syrk_diagonal_split_sets_the_flags() {
        let mut args = ProblemArgs::new(DataType::F32);
        args.m = 1537; // not divisible by 8, above threshold / 2
        args.n = 1537;
        args.k = 128;

        let mut seq = steps_for(BlasFunction::Syrk, &args, &[32]);
        let last = decompose_problem_step(&mut seq, 0);
        assert_eq!(last, 1);
        assert!(seq[0]
            .extra_flags
            .contains(KernelExtraFlags::SYRK_SEPARATE_DIAGONAL));
        assert!(seq[1]
            .extra_flags
            .contains(KernelExtraFlags::SYRK_EVALUATE_DIAGONAL));
        assert_eq!(seq[1].depends_on, Some(0));
    }

    #[test]
    fn syrk_aligned_problem_is_not_split() {
        let mut args = ProblemArgs::new(DataType::F32);
        args.m = 2048;
        args.n = 2048;
        args.k = 128;
        let mut seq = steps_for(BlasFunction::Syrk, &args, &[32]);
        assert_eq!(decompose_problem_step(&mut seq, 0), 0);
        assert_eq!(seq.len(), 1);
    }

    #[test]
    fn syr2k_becomes_two_chained_syrks() {
        let mut args = ProblemArgs::new(DataType::F32);
        args.m = 2048;
        args.n = 2048;
        args.k = 256;
        args.beta = Multiplier::real(3.0);

        let mut seq = steps_for(BlasFunction::Syr2k, &args, &[32]);
        let last = decompose_problem_step(&mut seq, 0);
        assert_eq!(last, 1);
        assert_eq!(seq.len(), 2);
        assert_eq!(seq[0].args.beta, Multiplier::real(3.0));
        assert_eq!(seq[1].args.beta, Multiplier::one());
        assert_eq!(seq[1].depends_on, Some(0));
        check_chain(&seq);
    }

    #[test]
    fn gemm_offset_folding_clears_block_offsets() {
        let mut args = ProblemArgs::new(DataType::F32);
        args.m = 256;
        args.n = 256;
        args.k = 256;
        args.lda = 512;
        args.ldb = 512;
        args.ldc = 512;
        args.offset_m = 128;
        args.offset_n = 64;

        let flags = flags_from_args(&args, BlasFunction::Gemm);
        fixup_gemm_offsets(&mut args, flags, 0);
        assert_eq!(args.offset_m, 0);
        assert_eq!(args.offset_n, 0);
        // Row-major: A offset moves down 128 rows, C down 128 rows and
        // right 64 columns.
        assert_eq!(args.off_a, 128 * 512);
        assert_eq!(args.off_bx, 64);
        assert_eq!(args.off_cy, 128 * 512 + 64);
    }

    #[test]
    fn vec_len_divides_ld_and_tile() {
        assert_eq!(appropriate_vec_len(1024, 4, 8, 3), 8);
        assert_eq!(appropriate_vec_len(1023, 4, 8, 3), 1);
        assert_eq!(appropriate_vec_len(1024, 4, 2, 3), 2);
        assert_eq!(appropriate_vec_len(1024, 16, 8, 3), 2);
        assert_eq!(appropriate_vec_len(0, 4, 8, 2), 4);
    }

    #[test]
    fn unaligned_leading_dim_sets_no_copy_flags() {
        let mut args = ProblemArgs::new(DataType::F32);
        args.m = 256;
        args.n = 256;
        args.k = 256;
        args.lda = 255; // not float4 aligned
        args.ldb = 256;
        args.ldc = 256;

        let mut step = SolutionStep::new(
            BlasFunction::Gemm,
            args,
            synthetic_device(),
            Some(0),
        );
        step.pattern = 2; // CachedGemm, no LDS
        step.subdims[1] = crate::dims::SubproblemDim {
            x: 8,
            y: 8,
            bwidth: 8,
            item_x: 8,
            item_y: 8,
        };

        let mut extra = KernelExtra::new(DataType::F32);
        select_vectorization(&step, &mut extra);
        assert!(extra.flags.contains(KernelExtraFlags::NO_COPY_VEC_A));
        assert!(!extra.flags.contains(KernelExtraFlags::NO_COPY_VEC_B));
        assert!(extra.vec_len >= 1);
        assert!(extra.vec_len_a == 1);
    }
}
