//! Offline autotuner: enumerates candidate decompositions per device,
//! times them, and writes the winners into the persistent store.

pub mod candidates;

use std::collections::HashSet;
use std::ffi::CString;
use std::time::Instant;

use ocl::core::{self, ProgramInfo, ProgramInfoResult};
use ocl::{Context, Device, Platform, Queue};

use self::candidates::CandidateSet;
use crate::device::DeviceDescriptor;
use crate::dims::MAX_KERNELS_PER_STEP;
use crate::error::{Error, Result};
use crate::flags::{flags_to_args, KernelExtra, KernelExtraFlags, KernelType};
use crate::pattern::{is_matrix_in_image, MemoryPattern, SOLVERS};
use crate::storage::{self, ParamPath, StorageCache, NO_DATA_TIME};
use crate::types::{BlasFunction, DataType, MatrixRole, BLAS_FUNCTIONS_NUMBER, TYPE_NUMBER};

/// Kernel timing repeats; level-2 kernels are noisier and get more.
const MAX_RUN_KERNEL: usize = 3;
const LEVEL2_EXTRA_RUNS: usize = 7;

/// Failed candidates are fed back as this pseudo-time so the estimator
/// steers away from their groups.
const FAILED_CANDIDATE_TIME: f64 = 4000.0;

/// What and how to tune.
#[derive(Clone, Debug)]
pub struct TuneConfig {
    pub funcs: [bool; BLAS_FUNCTIONS_NUMBER],
    pub dtypes: [bool; TYPE_NUMBER],
    /// Pin tuning to one pattern index (`--buffers`/`--images`/`--caches`).
    pub pattern: Option<usize>,
    /// Use the weighted-group estimator instead of the full sweep.
    pub fast: bool,
    /// Re-tune records that already hold data.
    pub rebuild: bool,
    /// Persist compiled kernel binaries alongside the decompositions.
    pub store_kernels: bool,
    /// Budget of candidates per (function, pattern, extra, bucket).
    pub max_candidates: usize,
    /// Restrict tuning to one extra-flags value.
    pub flag_set: Option<u32>,
}

impl Default for TuneConfig {
    fn default() -> TuneConfig {
        TuneConfig {
            funcs: [true; BLAS_FUNCTIONS_NUMBER],
            dtypes: [true; TYPE_NUMBER],
            pattern: None,
            fast: false,
            rebuild: false,
            store_kernels: false,
            max_candidates: 5000,
            flag_set: None,
        }
    }
}

/// Runs the tuner over every unique device in the system.
pub fn run_tuning(cfg: &TuneConfig) -> Result<()> {
    if storage::storage_dir().is_none() {
        return Err(Error::invalid(format!(
            "the environment variable '{}' is not defined",
            storage::ENV_STORAGE_PATH
        )));
    }

    let mut seen = HashSet::new();
    for platform in Platform::list() {
        let devices = Device::list_all(&platform).unwrap_or_default();
        for device in devices {
            let desc = DeviceDescriptor::from_device(&device)?;
            if !seen.insert(desc.ident) {
                continue;
            }
            tune_device(cfg, &platform, device, &desc)?;
        }
    }

    storage::invalidate_storage_caches();
    Ok(())
}

fn tune_device(
    cfg: &TuneConfig,
    platform: &Platform,
    device: Device,
    desc: &DeviceDescriptor,
) -> Result<()> {
    log::info!("tuning device '{}'", desc.name);

    let context = Context::builder()
        .platform(*platform)
        .devices(device)
        .build()?;
    let queue = Queue::new(&context, device, None)?;

    let mut cache = StorageCache::for_device(desc);
    cache.ensure_file()?;

    let mut check = StorageCache::for_device(desc);
    check.load()?;
    if !cache.layout_matches(&check) {
        log::warn!(
            "tuning store layout for '{}' does not match the registry",
            desc.name
        );
    }

    for &func in BlasFunction::all().iter() {
        if !cfg.funcs[func.index()] {
            continue;
        }
        let solvers = SOLVERS.function(func);
        let pattern_range: Vec<usize> = match cfg.pattern {
            Some(p) if p < solvers.nr_patterns() => vec![p],
            Some(_) => continue,
            None => (0..solvers.nr_patterns()).collect(),
        };

        for pattern_id in pattern_range {
            tune_pattern(cfg, &queue, desc, &mut cache, func, pattern_id)?;
        }
    }

    Ok(())
}

fn tune_pattern(
    cfg: &TuneConfig,
    queue: &Queue,
    desc: &DeviceDescriptor,
    cache: &mut StorageCache,
    func: BlasFunction,
    pattern_id: usize,
) -> Result<()> {
    let pattern = SOLVERS.function(func).pattern(pattern_id);

    let extra_count = cache.functions[func.index()].patterns[pattern_id].extras.len();
    for extra_idx in 0..extra_count {
        let (dtype, flags, tunable) = {
            let e = &cache.functions[func.index()].patterns[pattern_id].extras[extra_idx];
            (e.dtype, e.flags, e.use_for_tuning)
        };

        if !tunable || !cfg.dtypes[dtype.index()] {
            continue;
        }
        if let Some(f) = cfg.flag_set {
            if flags.bits() != f {
                continue;
            }
        }
        if !desc.supports_dtype(dtype) {
            continue;
        }

        let param_count =
            cache.functions[func.index()].patterns[pattern_id].extras[extra_idx].params.len();
        for param_idx in 0..param_count {
            let path = ParamPath {
                func: func.index(),
                pattern: pattern_id,
                extra: extra_idx,
                param: param_idx,
            };
            if !cfg.rebuild && cache.param(path).has_data() {
                continue;
            }

            tune_record(cfg, queue, desc, cache, func, pattern, path, dtype, flags)?;
            share_record(cache, func, pattern_id, extra_idx, param_idx)?;
        }
    }

    Ok(())
}

/// Enumerates and times candidates for one record, writing the winner
/// back in place.
fn tune_record(
    cfg: &TuneConfig,
    queue: &Queue,
    desc: &DeviceDescriptor,
    cache: &mut StorageCache,
    func: BlasFunction,
    pattern: &'static MemoryPattern,
    path: ParamPath,
    dtype: DataType,
    flags: KernelExtraFlags,
) -> Result<()> {
    let dim = cache.param(path).dim as usize;
    log::info!(
        "  {} / {} / {:?} / {:#x} @ {}",
        func,
        pattern.name,
        dtype,
        flags.bits(),
        dim
    );

    let mut set = CandidateSet::new(
        func,
        pattern,
        dtype,
        flags,
        desc.lds_size,
        desc.max_work_group_size,
        desc.wavefront,
    );
    if set.is_empty() {
        return Ok(());
    }
    set.return_all = !cfg.fast;

    // Working buffers of the bucket size; level-2 buckets describe the
    // vector length rather than a square edge.
    let (m, n, k) = if func.blas_level() == 2 {
        (dim * 2, dim * 2, 1)
    } else {
        (dim, dim, dim)
    };
    let args = make_tune_args(queue, func, dtype, flags, m, n, k)?;

    let mut best_time = f64::INFINITY;
    let mut best_blobs: [Option<Vec<u8>>; MAX_KERNELS_PER_STEP] = [None, None, None];

    loop {
        let (dims, pgran) = {
            let v = set.current();
            set.decomposition(v)
        };

        let time = match time_candidate(queue, pattern, &dims, &pgran, &args, dtype, flags, func)
        {
            Ok((time, blobs)) => {
                if time < best_time {
                    best_time = time;
                    let param = cache.param_mut(path);
                    param.subdims = dims;
                    param.pgran = pgran;
                    param.time = time;
                    if cfg.store_kernels {
                        best_blobs = blobs;
                    }
                }
                time
            }
            Err(err) => {
                log::debug!("    candidate failed: {}", err);
                FAILED_CANDIDATE_TIME
            }
        };

        if !set.next(cfg.max_candidates, time) {
            break;
        }
    }

    if best_time.is_finite() {
        cache.save_best_param(path)?;
        if cfg.store_kernels && best_blobs.iter().any(|b| b.is_some()) {
            cache.save_kernels(path, &best_blobs)?;
        }
        log::info!("    best {:.4} ms", best_time);
    } else {
        cache.param_mut(path).time = NO_DATA_TIME;
    }

    Ok(())
}

fn make_tune_args(
    queue: &Queue,
    func: BlasFunction,
    dtype: DataType,
    flags: KernelExtraFlags,
    m: usize,
    n: usize,
    k: usize,
) -> Result<crate::kargs::ProblemArgs> {
    let mut args = crate::kargs::ProblemArgs::new(dtype);
    flags_to_args(&mut args, flags, func);
    args.m = m;
    args.n = n;
    args.k = k;
    args.lda = m.max(k).max(n);
    args.ldb = if func.blas_level() == 2 { 1 } else { args.lda };
    args.ldc = if func.blas_level() == 2 { 1 } else { args.lda };
    args.alpha = crate::types::Multiplier::one();
    args.beta = crate::types::Multiplier::real(0.5);

    let tsize = dtype.size();
    let elems = args.lda * args.lda.max(2);
    let context = queue.context();
    let make = |_which: &str| -> Result<ocl::core::Mem> {
        let mem = unsafe {
            core::create_buffer::<_, u8>(
                context.as_core(),
                ocl::flags::MEM_READ_WRITE,
                elems * tsize,
                None,
            )?
        };
        Ok(mem)
    };

    args.a = Some(make("A")?);
    args.b = Some(make("B")?);
    args.c = Some(make("C")?);
    Ok(args)
}

/// Builds and times one candidate, returning its best wall-clock time in
/// milliseconds and the compiled binaries.
fn time_candidate(
    queue: &Queue,
    pattern: &'static MemoryPattern,
    dims: &[crate::dims::SubproblemDim],
    pgran: &crate::dims::PGranularity,
    args: &crate::kargs::ProblemArgs,
    dtype: DataType,
    flags: KernelExtraFlags,
    func: BlasFunction,
) -> Result<(f64, [Option<Vec<u8>>; MAX_KERNELS_PER_STEP])> {
    let mut extra = KernelExtra::new(dtype);
    extra.flags = flags;
    if matches!(func, BlasFunction::Syrk | BlasFunction::Syr2k) {
        extra.flags |= KernelExtraFlags::SYRK_SEPARATE_DIAGONAL;
    }
    extra.vec_len = (16 / dtype.size()).max(1) as u32;

    let mut args = args.clone();
    {
        let mut fixup_extra = extra.clone();
        pattern.sops.fixup_args(&mut args, dims, &mut fixup_extra);
        extra.flags = fixup_extra.flags;
    }

    let context = queue.context();
    let device = queue.device();
    let mut blobs: [Option<Vec<u8>>; MAX_KERNELS_PER_STEP] = [None, None, None];
    let mut runs = MAX_RUN_KERNEL;
    if func.blas_level() == 2 {
        runs += LEVEL2_EXTRA_RUNS;
    }

    let needs = [
        KernelType::Compute,
        KernelType::PrepA,
        KernelType::PrepB,
    ];
    let mut min_time = f64::INFINITY;

    for ktype in needs.iter().copied() {
        let needed = match ktype {
            KernelType::Compute => true,
            KernelType::PrepA => is_matrix_in_image(pattern, MatrixRole::A),
            KernelType::PrepB => is_matrix_in_image(pattern, MatrixRole::B),
        };
        if !needed {
            continue;
        }

        extra.kern_type = ktype;
        let src = pattern.sops.gen_kernel(dims, pgran, &extra)?;
        let src_c = CString::new(src).map_err(|e| Error::Build(e.to_string()))?;
        let empty = CString::new("").unwrap();
        let program =
            ocl::Program::with_source(context.as_core(), &[src_c], Some(&[device]), &empty)
                .map_err(|e| Error::Build(e.to_string()))?;

        if let Ok(ProgramInfoResult::Binaries(bins)) =
            core::get_program_info(program.as_core(), ProgramInfo::Binaries)
        {
            blobs[ktype.index()] = bins.into_iter().next();
        }

        if ktype != KernelType::Compute {
            continue;
        }

        let kernel = core::create_kernel(program.as_core(), pattern.sops.kernel_name(&extra))?;
        pattern.sops.assign_kargs(&kernel, &args, &extra)?;

        let gws = pattern
            .sops
            .calc_threads(dims, pgran, &args, &extra)
            .unwrap_or_else(|| {
                let d0 = dims[0];
                [
                    crate::util::div_round_up(args.m.max(1), d0.y.max(1))
                        * pgran.wg_size[0] as usize,
                    crate::util::div_round_up(args.n.max(1), d0.x.max(1))
                        * pgran.wg_size[1].max(1) as usize,
                ]
            });

        for _ in 0..runs {
            let start = Instant::now();
            let (work_dims, global, local) = if pgran.wg_dim == 2 && gws[1] > 1 {
                (
                    2,
                    [gws[0], gws[1], 1],
                    [pgran.wg_size[0] as usize, pgran.wg_size[1] as usize, 1],
                )
            } else {
                (
                    1,
                    [gws[0], 1, 1],
                    [pgran.group_size() as usize, 1, 1],
                )
            };
            unsafe {
                core::enqueue_kernel(
                    queue.as_core(),
                    &kernel,
                    work_dims,
                    None,
                    &global,
                    Some(local),
                    None::<&ocl::EventList>,
                    None::<&mut ocl::Event>,
                )?;
            }
            queue.finish()?;
            let elapsed = start.elapsed().as_secs_f64() * 1e3;
            min_time = min_time.min(elapsed);
        }
    }

    Ok((min_time, blobs))
}

/// Copies the tuned record to every sibling extra of the same pattern
/// whose tuning-masked flags match, so tail and offset variants share it.
fn share_record(
    cache: &mut StorageCache,
    func: BlasFunction,
    pattern_id: usize,
    extra_idx: usize,
    param_idx: usize,
) -> Result<()> {
    let tuning_mask = SOLVERS.function(func).mask_for_tunings_kernel;

    let (src_dtype, src_flags, src_param) = {
        let extra = &cache.functions[func.index()].patterns[pattern_id].extras[extra_idx];
        (
            extra.dtype,
            extra.flags & tuning_mask,
            extra.params[param_idx].clone(),
        )
    };
    if !src_param.has_data() {
        return Ok(());
    }

    let extra_count = cache.functions[func.index()].patterns[pattern_id].extras.len();
    for other in 0..extra_count {
        if other == extra_idx {
            continue;
        }
        let matches = {
            let e = &cache.functions[func.index()].patterns[pattern_id].extras[other];
            e.dtype == src_dtype && (e.flags & tuning_mask) == src_flags
        };
        if !matches {
            continue;
        }
        let path = ParamPath {
            func: func.index(),
            pattern: pattern_id,
            extra: other,
            param: param_idx,
        };
        cache.param_mut(path).adopt(&src_param);
        cache.save_best_param(path)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_selects_everything() {
        let cfg = TuneConfig::default();
        assert!(cfg.funcs.iter().all(|&f| f));
        assert!(cfg.dtypes.iter().all(|&f| f));
        assert_eq!(cfg.max_candidates, 5000);
        assert!(!cfg.rebuild);
    }
}
