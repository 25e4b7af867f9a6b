//! Solution-sequence builder: turns one BLAS call into a chain of kernel
//! launches with event dependencies.
//!
//! `make_solution_seq` builds the steps and acquires their kernels;
//! `SolutionSeq::enqueue` submits everything without blocking the host.

use std::ffi::CString;
use std::sync::Arc;

use ocl::core::{self, CommandQueueInfo, CommandQueueInfoResult};
use ocl::{Event, EventList, Queue};

use crate::cache::{self, CachedKernel, KernelKey};
use crate::decompose::{self, fixup_gemm_offsets};
use crate::device::{DeviceDescriptor, DeviceVendor};
use crate::dims::{
    matr_block_height, matr_block_pitch, PGranularity, SubproblemDim, MAX_KERNELS_PER_STEP,
    MAX_SUBDIMS, SUBDIM_UNUSED,
};
use crate::error::{Error, Result};
use crate::flags::{flags_from_args, KernelExtra, KernelExtraFlags, KernelType};
use crate::granulation::{
    self, assert_granulation, avoid_load_from_storage, detect_offsets, detect_problem_tails,
    storage_dimension,
};
use crate::kargs::{kargs_to_prob_dims, ProblemArgs};
use crate::pattern::{
    is_matrix_in_image, make_solver_id, select_pattern, MemoryPattern, SOLVERS,
};
use crate::scratch;
use crate::storage::{self, Fetch};
use crate::types::{BlasFunction, MatrixRole, Order};
use crate::util;

/// Compile options passed to the device compiler are bounded.
pub const BUILD_OPTS_MAXLEN: usize = 256;

/// One kernel launch of a solution sequence.
#[derive(Clone, Debug)]
pub struct SolutionStep {
    pub func: BlasFunction,
    pub args: ProblemArgs,
    pub device: DeviceDescriptor,
    /// Index into the caller's queue list; `None` when sharding assigned
    /// this queue no work.
    pub queue: Option<usize>,
    pub pattern: usize,
    pub extra_flags: KernelExtraFlags,
    pub subdims: [SubproblemDim; MAX_SUBDIMS],
    pub pgran: PGranularity,
    pub kernels: [Option<Arc<CachedKernel>>; MAX_KERNELS_PER_STEP],
    /// Predecessor step this one's launch must wait for (compound
    /// decomposition chains); `None` waits on the user's list.
    pub depends_on: Option<usize>,
}

impl SolutionStep {
    pub fn new(
        func: BlasFunction,
        args: ProblemArgs,
        device: DeviceDescriptor,
        queue: Option<usize>,
    ) -> SolutionStep {
        let mut pgran = PGranularity::default();
        pgran.wf_size = device.wavefront;
        pgran.max_work_group_size = device.max_work_group_size as u32;
        SolutionStep {
            func,
            args,
            device,
            queue,
            pattern: 0,
            extra_flags: KernelExtraFlags::empty(),
            subdims: [SubproblemDim::default(); MAX_SUBDIMS],
            pgran,
            kernels: [None, None, None],
            depends_on: None,
        }
    }

    /// The memory pattern this step resolved to.
    pub fn pattern(&self) -> &'static MemoryPattern {
        SOLVERS.function(self.func).pattern(self.pattern)
    }

    /// Index of the first populated subdimension level.
    pub fn first_dim_idx(&self) -> usize {
        2 - self.pattern().nr_levels.min(2)
    }
}

/// An ordered set of kernel launches implementing one BLAS call.
#[derive(Debug, Default)]
pub struct SolutionSeq {
    pub steps: Vec<SolutionStep>,
}

impl SolutionSeq {
    /// Indices of chain tails: the steps whose events the caller should
    /// observe.
    pub fn tails(&self) -> Vec<usize> {
        let mut has_successor = vec![false; self.steps.len()];
        for step in &self.steps {
            if let Some(d) = step.depends_on {
                has_successor[d] = true;
            }
        }
        (0..self.steps.len())
            .filter(|&i| self.steps[i].queue.is_some() && !has_successor[i])
            .collect()
    }

    /// Enqueues every step on its queue and returns the events of the
    /// chain tails. The host does not block.
    pub fn enqueue(&mut self, queues: &[Queue], wait_list: &[Event]) -> Result<Vec<Event>> {
        let mut events: Vec<Option<Event>> = vec![None; self.steps.len()];

        for i in 0..self.steps.len() {
            let qi = match self.steps[i].queue {
                Some(qi) => qi,
                None => continue,
            };
            let queue = queues
                .get(qi)
                .ok_or_else(|| Error::invalid("queue index out of range"))?;

            let mut wait = EventList::new();
            match self.steps[i].depends_on {
                Some(d) => {
                    if let Some(ev) = &events[d] {
                        wait.push(ev.clone());
                    }
                }
                None => {
                    for ev in wait_list {
                        wait.push(ev.clone());
                    }
                }
            }

            let event = enqueue_step(&self.steps[i], queue, &wait)?;
            events[i] = Some(event);
        }

        Ok(self
            .tails()
            .into_iter()
            .filter_map(|i| events[i].clone())
            .collect())
    }
}

impl Drop for SolutionSeq {
    fn drop(&mut self) {
        for step in &mut self.steps {
            scratch::release_step_images(step);
        }
    }
}

fn get_queue_max_images(queue: &Queue, desc: &DeviceDescriptor) -> u32 {
    if !desc.image_support {
        return 0;
    }
    let out_of_order = match queue.info(CommandQueueInfo::Properties) {
        Ok(CommandQueueInfoResult::Properties(props)) => {
            props.contains(ocl::flags::QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE)
        }
        _ => false,
    };
    if out_of_order {
        0
    } else {
        2
    }
}

/// Builds the solution sequence for one BLAS call: one step per usable
/// queue, sharded, decomposed, with kernels resolved from the cache, the
/// store, or a fresh build.
pub fn make_solution_seq(
    func: BlasFunction,
    args: &ProblemArgs,
    queues: &[Queue],
) -> Result<SolutionSeq> {
    if queues.is_empty() {
        return Err(Error::NoQueues);
    }

    let mut steps: Vec<SolutionStep> = Vec::with_capacity(queues.len());
    let mut total_cus = 0u32;
    let mut without_double = 0usize;

    for (qi, queue) in queues.iter().enumerate() {
        let desc = DeviceDescriptor::from_device(&queue.device())?;
        if args.dtype.is_double_based() && !desc.native_double {
            without_double += 1;
            continue;
        }

        let mut step_args = args.clone();
        step_args.addr_bits = desc.address_bits;
        total_cus += desc.compute_units;

        let mut step = SolutionStep::new(func, step_args, desc, Some(qi));
        step.extra_flags = flags_from_args(&step.args, func);
        if func == BlasFunction::Syr2k {
            step.extra_flags |= KernelExtraFlags::SYRK_2K_RANK;
        }
        steps.push(step);
    }

    if total_cus == 0 {
        return if without_double == queues.len() {
            Err(Error::UnsupportedDataType(args.dtype))
        } else {
            Err(Error::NoQueues)
        };
    }

    // Split the task between the command queues.
    decompose::shard_queues(func, args, &mut steps, total_cus);

    // Function-level decomposition into event-chained sub-steps.
    let mut seq = SolutionSeq { steps };
    let mut i = 0;
    while i < seq.steps.len() {
        if seq.steps[i].queue.is_none() {
            i += 1;
            continue;
        }
        if seq.steps[i].func == BlasFunction::Gemm {
            let kflags = seq.steps[i].extra_flags;
            fixup_gemm_offsets(&mut seq.steps[i].args, kflags, 0);
            i += 1;
            continue;
        }
        i = decompose::decompose_problem_step(&mut seq.steps, i) + 1;
    }

    // Find a kernel for each step.
    for i in 0..seq.steps.len() {
        let qi = match seq.steps[i].queue {
            Some(qi) => qi,
            None => continue,
        };
        let queue = &queues[qi];

        if seq.steps[i].device.ident.vendor == DeviceVendor::Amd {
            seq.steps[i].extra_flags |=
                KernelExtraFlags::VENDOR_AMD | KernelExtraFlags::ENABLE_MAD;
        }

        find_best_pattern(&mut seq.steps[i], queue)?;
        acquire_step_kernels(&mut seq.steps[i], queue)?;
    }

    Ok(seq)
}

/// Selects a pattern for the step, retrying with a smaller image budget
/// when scratch resources cannot be acquired.
fn find_best_pattern(step: &mut SolutionStep, queue: &Queue) -> Result<()> {
    let mut max_images = get_queue_max_images(queue, &step.device);

    loop {
        // A previous attempt may still hold scratch images.
        scratch::release_step_images(step);

        step.pattern = select_pattern(step.func, step.extra_flags, &step.args, max_images)
            .ok_or_else(|| {
                Error::OutOfResources(format!("no usable pattern for {}", step.func))
            })?;

        granulation::get_step_granulation(step);
        assert_granulation(step);

        if get_step_resources(step, queue)? {
            return Ok(());
        }
        if max_images == 0 {
            return Err(Error::OutOfResources(format!(
                "cannot satisfy image demand for {}",
                step.func
            )));
        }
        max_images -= 1;
    }
}

/// Acquires scratch images for the operands the pattern stages through
/// the image path. Returns false when the pool cannot satisfy the step.
fn get_step_resources(step: &mut SolutionStep, queue: &Queue) -> Result<bool> {
    let pattern = step.pattern();
    let tsize = step.args.dtype.size();
    let vec_len = (16 / tsize).max(1);
    let prob_dim = kargs_to_prob_dims(step.func, &step.args, false);
    let context = queue.context();
    let device = queue.device();

    let mut slot = 0usize;
    for &mrole in [MatrixRole::A, MatrixRole::B].iter() {
        if !is_matrix_in_image(pattern, mrole) {
            continue;
        }

        let first = step.first_dim_idx();
        let subdim = step.subdims[first];
        let min_width: usize;
        let min_height: usize;
        let best_height: usize;

        if step.func == BlasFunction::Trsm {
            // Packed triangular blocks.
            let mut extra = KernelExtra::new(step.args.dtype);
            extra.flags = step.extra_flags;
            let (pack_rate, pack_order) = pattern
                .sops
                .img_pack_mode(&extra, &step.subdims[first..], mrole)
                .unwrap_or((1, Order::RowMajor));
            let pitch = matr_block_pitch(&subdim, mrole, step.args.dtype, step.args.side);
            let matr_width =
                matr_block_pitch(&prob_dim, mrole, step.args.dtype, step.args.side);
            let matr_height = matr_block_height(&prob_dim, mrole, step.args.side);
            let rate = pack_rate.max(1) as usize;

            if pack_order == Order::RowMajor {
                min_width = util::div_round_up(matr_width, pitch) * pitch / vec_len;
                min_height = rate;
                best_height = rate * util::div_round_up(matr_height, rate);
            } else {
                min_width = pitch / vec_len;
                min_height = util::div_round_up(matr_height, rate) * rate;
                best_height = min_height * util::div_round_up(matr_width, pitch);
            }
        } else {
            // Whole panels, aligned up to the block grid.
            let aligned_m = util::round_up(step.args.m.max(1), subdim.y.max(1));
            let aligned_n = util::round_up(step.args.n.max(1), subdim.x.max(1));
            let aligned_k = util::round_up(step.args.k.max(1), subdim.bwidth.max(1));
            match mrole {
                MatrixRole::A => {
                    min_width = util::div_round_up(aligned_k, vec_len);
                    min_height = subdim.y.max(1);
                    best_height = aligned_m;
                }
                MatrixRole::B => {
                    min_width = util::div_round_up(aligned_k, vec_len);
                    min_height = subdim.x.max(1);
                    best_height = aligned_n;
                }
                MatrixRole::C => unreachable!(),
            }
        }

        let min_size = min_width * min_height;
        let best_size = min_width * best_height;
        match scratch::get_sc_image(&context, &device, best_size, min_size, min_width) {
            Some(mem) => {
                step.args.scimage[slot] = Some(mem);
                slot += 1;
            }
            None => return Ok(false),
        }
    }

    Ok(true)
}

/// Base compile options every kernel gets before the pattern adds its
/// own.
fn setup_build_opts(step: &SolutionStep) -> String {
    let mut opts = String::new();
    if step.args.dtype.is_double_based() {
        opts.push_str("-DDOUBLE_PRECISION ");
    }
    if step
        .extra_flags
        .contains(KernelExtraFlags::ENABLE_MAD)
    {
        opts.push_str("-cl-mad-enable ");
    }
    opts
}

/// Resolves the kernels of one step: cache, then stored binary, then a
/// fresh generate-and-build.
fn acquire_step_kernels(step: &mut SolutionStep, queue: &Queue) -> Result<()> {
    let pattern = step.pattern();
    let first = step.first_dim_idx();
    let sid = make_solver_id(step.func, step.pattern);

    detect_problem_tails(step);

    let mut extra = KernelExtra::new(step.args.dtype);
    extra.flags = step.extra_flags;
    {
        let subdims = step.subdims;
        pattern
            .sops
            .fixup_args(&mut step.args, &subdims[first..], &mut extra);
    }
    step.extra_flags = extra.flags;

    detect_offsets(step);
    extra.flags = step.extra_flags;

    let mut key_subdims = [SubproblemDim::default(); 2];
    for (k, d) in step.subdims[first..].iter().take(2).enumerate() {
        key_subdims[k] = *d;
    }
    let key = KernelKey {
        device: queue.device(),
        context: queue.context(),
        nr_dims: pattern.nr_levels,
        subdims: key_subdims,
    };

    let need = [
        true,
        is_matrix_in_image(pattern, MatrixRole::A),
        is_matrix_in_image(pattern, MatrixRole::B),
    ];

    // Stored binaries are fetched once per step, lazily.
    let mut stored: Option<[Option<Vec<u8>>; MAX_KERNELS_PER_STEP]> = None;

    for ktype in KernelType::all().iter().copied() {
        if !need[ktype.index()] {
            continue;
        }

        extra.kern_type = ktype;
        decompose::select_vectorization(step, &mut extra);

        let mut bopts = setup_build_opts(step);
        pattern.sops.set_build_options(&mut bopts, &step.args, &extra);
        bopts.truncate(BUILD_OPTS_MAXLEN);
        extra.build_options = bopts.trim_end().to_string();

        let cmp = |a: &KernelExtra, b: &KernelExtra| pattern.sops.kernel_extra_cmp(a, b);

        let mut kernel = if cache::kernels_cacheable() {
            cache::find_kernel(sid, &key, &extra, cmp)
        } else {
            None
        };

        if kernel.is_none() {
            if stored.is_none() && !avoid_load_from_storage(step) {
                let dim = storage_dimension(step);
                stored = match storage::get_kernel_info(
                    &step.device,
                    pattern.name,
                    step.args.dtype,
                    step.extra_flags,
                    dim,
                ) {
                    Fetch::Data(blobs) => Some(blobs),
                    _ => Some([None, None, None]),
                };
            }

            let blob = stored
                .as_ref()
                .and_then(|b| b[ktype.index()].as_deref());

            let program = match blob {
                Some(binary) => build_program_from_binary(queue, binary, &extra)?,
                None => {
                    let src = pattern.sops.gen_kernel(
                        &step.subdims[first..],
                        &step.pgran,
                        &extra,
                    )?;
                    build_program_from_source(queue, &src, &extra)?
                }
            };

            let built = Arc::new(CachedKernel {
                program,
                name: pattern.sops.kernel_name(&extra),
                extra: extra.clone(),
                key: key.clone(),
            });
            kernel = Some(if cache::kernels_cacheable() {
                cache::add_kernel_to_cache(sid, built, cmp)
            } else {
                built
            });
        }

        step.kernels[ktype.index()] = kernel;
    }

    Ok(())
}

fn build_program_from_source(queue: &Queue, src: &str, extra: &KernelExtra) -> Result<ocl::Program> {
    let context = queue.context();
    let device = queue.device();
    let src_c = CString::new(src).map_err(|e| Error::Build(e.to_string()))?;
    let opts_c =
        CString::new(extra.build_options.as_str()).map_err(|e| Error::Build(e.to_string()))?;
    ocl::Program::with_source(context.as_core(), &[src_c], Some(&[device]), &opts_c)
        .map_err(|e| Error::Build(e.to_string()))
}

fn build_program_from_binary(
    queue: &Queue,
    binary: &[u8],
    extra: &KernelExtra,
) -> Result<ocl::Program> {
    let context = queue.context();
    let device = queue.device();
    let opts_c =
        CString::new(extra.build_options.as_str()).map_err(|e| Error::Build(e.to_string()))?;
    ocl::Program::with_binary(context.as_core(), &[device], &[binary], &opts_c)
        .map_err(|e| Error::Build(e.to_string()))
}

/// Generic NDRange fallback for patterns without `calc_threads`: one work
/// group per outer block.
pub fn generic_calc_threads(step: &SolutionStep) -> [usize; 2] {
    let first = step.first_dim_idx();
    let d0 = step.subdims[first];
    let prob = kargs_to_prob_dims(step.func, &step.args, false);

    let edge = |v: usize| if v == SUBDIM_UNUSED { 1 } else { v.max(1) };
    let by = util::div_round_up(prob.y.max(1), edge(d0.y));
    let bx = util::div_round_up(prob.x.max(1), edge(d0.x));

    if step.pgran.wg_dim == 2 {
        [
            by * step.pgran.wg_size[0] as usize,
            bx * step.pgran.wg_size[1] as usize,
        ]
    } else {
        [by * bx * step.pgran.group_size() as usize, 1]
    }
}

/// Submits one step: prep kernels first (queue order covers them, since
/// image patterns never run on out-of-order queues), then the compute kernel
/// carrying the step event.
fn enqueue_step(step: &SolutionStep, queue: &Queue, wait: &EventList) -> Result<Event> {
    let pattern = step.pattern();
    let first = step.first_dim_idx();
    let mut event = Event::empty();

    for ktype in [KernelType::PrepA, KernelType::PrepB, KernelType::Compute]
        .iter()
        .copied()
    {
        let cached = match &step.kernels[ktype.index()] {
            Some(k) => k,
            None => continue,
        };

        let kernel = core::create_kernel(cached.program.as_core(), cached.name)?;
        pattern.sops.assign_kargs(&kernel, &step.args, &cached.extra)?;

        let gws = pattern
            .sops
            .calc_threads(
                &step.subdims[first..],
                &step.pgran,
                &step.args,
                &cached.extra,
            )
            .unwrap_or_else(|| generic_calc_threads(step));

        let (work_dims, global, local) = if gws[1] > 1 {
            (
                2,
                [gws[0], gws[1], 1],
                Some([
                    step.pgran.wg_size[0] as usize,
                    step.pgran.wg_size[1] as usize,
                    1,
                ]),
            )
        } else if step.pgran.wg_dim == 1 {
            (
                1,
                [gws[0], 1, 1],
                Some([step.pgran.group_size() as usize, 1, 1]),
            )
        } else {
            // One-dimensional prep grid of a two-dimensional pattern; let
            // the runtime pick the local size.
            (1, [gws[0], 1, 1], None)
        };

        let is_compute = ktype == KernelType::Compute;
        unsafe {
            core::enqueue_kernel(
                queue.as_core(),
                &kernel,
                work_dims,
                None,
                &global,
                local,
                Some(wait),
                if is_compute { Some(&mut event) } else { None },
            )?;
        }
    }

    queue.flush()?;
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::synthetic_device;
    use crate::types::DataType;

    #[test]
    fn tails_are_the_unreferenced_live_steps() {
        let desc = synthetic_device();
        let args = ProblemArgs::new(DataType::F32);

        let mut seq = SolutionSeq::default();
        for i in 0..3 {
            seq.steps.push(SolutionStep::new(
                BlasFunction::Trsm,
                args.clone(),
                desc.clone(),
                Some(0),
            ));
            if i > 0 {
                seq.steps[i].depends_on = Some(i - 1);
            }
        }
        assert_eq!(seq.tails(), vec![2]);

        // Parallel sharded steps are all tails.
        let mut seq = SolutionSeq::default();
        for _ in 0..2 {
            seq.steps.push(SolutionStep::new(
                BlasFunction::Gemm,
                args.clone(),
                desc.clone(),
                Some(0),
            ));
        }
        assert_eq!(seq.tails(), vec![0, 1]);
    }

    #[test]
    fn generic_threads_cover_the_problem() {
        let desc = synthetic_device();
        let mut args = ProblemArgs::new(DataType::F32);
        args.m = 1000;
        args.n = 500;
        args.k = 64;

        let mut step = SolutionStep::new(BlasFunction::Gemm, args, desc, Some(0));
        step.pattern = 0;
        step.subdims[0] = SubproblemDim {
            x: 32,
            y: 32,
            bwidth: 32,
            item_x: 32,
            item_y: 32,
        };
        step.pgran.wg_dim = 2;
        step.pgran.wg_size = [8, 8];

        let gws = generic_calc_threads(&step);
        // ceil(1000/32) = 32 blocks of 8 rows, ceil(500/32) = 16 of 8.
        assert_eq!(gws, [32 * 8, 16 * 8]);
        assert_eq!(gws[0] % 8, 0);
        assert_eq!(gws[1] % 8, 0);
    }

    #[test]
    fn build_opts_stay_bounded() {
        let desc = synthetic_device();
        let mut args = ProblemArgs::new(DataType::F64);
        args.m = 64;
        let mut step = SolutionStep::new(BlasFunction::Gemm, args, desc, Some(0));
        step.extra_flags = KernelExtraFlags::ENABLE_MAD;
        let opts = setup_build_opts(&step);
        assert!(opts.len() <= BUILD_OPTS_MAXLEN);
        assert!(opts.contains("-cl-mad-enable"));
        assert!(opts.contains("-DDOUBLE_PRECISION"));
    }
}
