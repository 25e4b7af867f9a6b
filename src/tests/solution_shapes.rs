//! Whole-pipeline shapes: pattern selection feeding granulation, compound
//! decomposition chains, and flag detection, driven without a device.

use crate::decompose::{self, DIVISION_ALIGNMENT};
use crate::flags::{flags_from_args, KernelExtraFlags};
use crate::granulation::{detect_offsets, detect_problem_tails, get_step_granulation};
use crate::kargs::ProblemArgs;
use crate::pattern::{select_pattern, SOLVERS};
use crate::solution::SolutionStep;
use crate::storage::tests::synthetic_device;
use crate::types::{BlasFunction, DataType, Multiplier, Side, Uplo};

fn step_for(func: BlasFunction, args: ProblemArgs) -> SolutionStep {
    let flags = flags_from_args(&args, func);
    let mut step = SolutionStep::new(func, args, synthetic_device(), Some(0));
    step.extra_flags = flags;
    step
}

/// Aligned single-precision GEMM: one step, the LDS pattern, square 32
/// blocks over an 8x8 group, no tails, beta-zero set.
#[test]
fn aligned_square_gemm_shape() {
    let mut args = ProblemArgs::new(DataType::F32);
    args.m = 1024;
    args.n = 1024;
    args.k = 1024;
    args.lda = 1024;
    args.ldb = 1024;
    args.ldc = 1024;
    args.beta = Multiplier::default();

    let flags = flags_from_args(&args, BlasFunction::Gemm);
    assert!(flags.contains(KernelExtraFlags::BETA_ZERO));

    let pattern = select_pattern(BlasFunction::Gemm, flags, &args, 2).unwrap();
    let mut step = step_for(BlasFunction::Gemm, args);
    step.pattern = pattern;

    // The aligned problem goes to the LDS pattern with square blocks.
    assert_eq!(SOLVERS.function(BlasFunction::Gemm).pattern(pattern).name, "BufferGemm");

    get_step_granulation(&mut step);
    let d0 = step.subdims[0];
    assert_eq!((d0.y, d0.x, d0.bwidth, d0.item_y, d0.item_x), (32, 32, 32, 32, 32));
    assert_eq!(step.pgran.wg_dim, 2);
    assert_eq!(step.pgran.wg_size, [8, 8]);

    detect_problem_tails(&mut step);
    assert!(!step.extra_flags.intersects(KernelExtraFlags::tails()));

    detect_offsets(&mut step);
    assert!(!step.extra_flags.contains(KernelExtraFlags::A_OFF_NOT_ZERO));
}

/// The same problem with ragged edges: selection switches pattern and the
/// tail flags appear on both levels.
#[test]
fn ragged_gemm_raises_tails() {
    let mut args = ProblemArgs::new(DataType::F32);
    args.m = 1025;
    args.n = 1023;
    args.k = 1024;
    args.lda = 1024;
    args.ldb = 1024;
    args.ldc = 1024;

    let flags = flags_from_args(&args, BlasFunction::Gemm);
    let pattern = select_pattern(BlasFunction::Gemm, flags, &args, 2).unwrap();
    let mut step = step_for(BlasFunction::Gemm, args);
    step.pattern = pattern;

    get_step_granulation(&mut step);
    detect_problem_tails(&mut step);

    use KernelExtraFlags as F;
    assert!(step.extra_flags.contains(F::TAILS_M));
    assert!(step.extra_flags.contains(F::TAILS_N));
    assert!(!step.extra_flags.contains(F::TAILS_K));
    if SOLVERS
        .function(BlasFunction::Gemm)
        .pattern(step.pattern)
        .nr_levels
        == 2
    {
        assert!(step.extra_flags.contains(F::TAILS_M_LOWER));
        assert!(step.extra_flags.contains(F::TAILS_N_LOWER));
    }
}

/// A large left-side TRSM becomes solve / multiply / solve with an event
/// chain, and every piece gets a valid granulation of its own.
#[test]
fn trsm_chain_end_to_end() {
    let mut args = ProblemArgs::new(DataType::F32);
    args.m = 4096;
    args.n = 512;
    args.side = Side::Left;
    args.uplo = Uplo::Lower;
    args.alpha = Multiplier::real(2.0);
    args.lda = 4096;
    args.ldb = 512;
    args.ldc = 512;

    let mut seq = vec![step_for(BlasFunction::Trsm, args)];
    decompose::decompose_problem_step(&mut seq, 0);

    assert_eq!(seq.len(), 3);
    let funcs: Vec<_> = seq.iter().map(|s| s.func).collect();
    assert_eq!(
        funcs,
        vec![BlasFunction::Trsm, BlasFunction::Gemm, BlasFunction::Trsm]
    );
    assert_eq!(seq[1].depends_on, Some(0));
    assert_eq!(seq[2].depends_on, Some(1));
    assert_eq!(seq[1].args.alpha, Multiplier::real(-0.5));
    assert_eq!(seq[0].args.m % DIVISION_ALIGNMENT, 0);

    // Every sub-step still granulates cleanly.
    for step in seq.iter_mut() {
        let pattern = select_pattern(step.func, step.extra_flags, &step.args, 2).unwrap();
        step.pattern = pattern;
        get_step_granulation(step);
        assert!(step.pgran.is_valid());
    }
}

/// Event-chain acyclicity over a decomposed SYR2K: each chained step has
/// exactly one predecessor and no cycles exist.
#[test]
fn syr2k_chain_is_acyclic() {
    let mut args = ProblemArgs::new(DataType::F32);
    args.m = 1537;
    args.n = 1537;
    args.k = 256;
    args.lda = 1537;
    args.ldb = 1537;
    args.ldc = 1537;

    let mut seq = vec![step_for(BlasFunction::Syr2k, args)];
    decompose::decompose_problem_step(&mut seq, 0);

    // Two SYRK halves, each split into off-diagonal + diagonal.
    assert_eq!(seq.len(), 4);

    let mut predecessors = vec![0usize; seq.len()];
    for step in &seq {
        if let Some(d) = step.depends_on {
            predecessors[d] += 1;
        }
    }
    // A chain: every step except the tail is depended on exactly once.
    assert_eq!(predecessors.iter().filter(|&&c| c == 1).count(), 3);
    assert_eq!(*predecessors.last().unwrap(), 0);

    for (i, step) in seq.iter().enumerate() {
        if let Some(d) = step.depends_on {
            assert!(d < i, "dependency must point backwards");
        }
    }
}

/// Multi-queue GEMV sharding: compute-unit proportional stripes on the
/// 128-element grid.
#[test]
fn gemv_two_queue_stripes() {
    let mut args = ProblemArgs::new(DataType::F32);
    args.m = 10000;
    args.n = 500;
    args.lda = 500;

    let mut steps: Vec<SolutionStep> = [24u32, 8u32]
        .iter()
        .enumerate()
        .map(|(i, &cus)| {
            let mut desc = synthetic_device();
            desc.compute_units = cus;
            let mut step = SolutionStep::new(BlasFunction::Gemv, args.clone(), desc, Some(i));
            step.extra_flags = flags_from_args(&args, BlasFunction::Gemv);
            step
        })
        .collect();

    decompose::shard_queues(BlasFunction::Gemv, &args, &mut steps, 32);

    assert_eq!(steps[0].args.offset_m, 0);
    assert_eq!(steps[0].args.m % DIVISION_ALIGNMENT, 0);
    assert_eq!(steps[1].args.offset_m, steps[0].args.m);
    assert_eq!(steps[0].args.m + steps[1].args.m, 10000);

    // No cross-queue dependencies are introduced by sharding.
    assert!(steps.iter().all(|s| s.depends_on.is_none()));
}
