//! Offline autotuner for the per-device kernel database.
//!
//! Walks every selected BLAS function, memory pattern, data type and
//! problem-size bucket, times candidate decompositions on the device and
//! persists the winners under `CLBLAS_STORAGE_PATH`.

use std::process;

use clap::Parser;

use ocl_blas::storage;
use ocl_blas::tune::{run_tuning, TuneConfig};
use ocl_blas::types::{BlasFunction, DataType};

const EXIT_IO_FAILURE: i32 = 2;
const EXIT_NO_ENVIRONMENT_VARIABLE: i32 = 3;

#[derive(Parser, Debug)]
#[command(
    name = "ocl-blas-tune",
    about = "Tune BLAS kernel decompositions for the installed OpenCL devices"
)]
struct Args {
    /// Tune GEMM.
    #[arg(long)]
    gemm: bool,
    /// Tune TRMM.
    #[arg(long)]
    trmm: bool,
    /// Tune TRSM.
    #[arg(long)]
    trsm: bool,
    /// Tune GEMV.
    #[arg(long)]
    gemv: bool,
    /// Tune SYMV.
    #[arg(long)]
    symv: bool,
    /// Tune SYRK.
    #[arg(long)]
    syrk: bool,
    /// Tune SYR2K.
    #[arg(long)]
    syr2k: bool,

    /// Tune single-precision kernels.
    #[arg(long)]
    float: bool,
    /// Tune double-precision kernels.
    #[arg(long)]
    double: bool,
    /// Tune single-precision complex kernels.
    #[arg(long)]
    complex: bool,
    /// Tune double-precision complex kernels.
    #[arg(long = "double-complex")]
    double_complex: bool,

    /// Restrict tuning to the buffer patterns (index 0).
    #[arg(long)]
    buffers: bool,
    /// Restrict tuning to the image patterns (index 1).
    #[arg(long)]
    images: bool,
    /// Restrict tuning to the cache patterns (index 2).
    #[arg(long)]
    caches: bool,

    /// Prune the search with the weighted-group estimator.
    #[arg(long)]
    fast: bool,
    /// Re-tune records that already hold data.
    #[arg(long)]
    rebuild: bool,
    /// Store compiled kernel binaries alongside the decompositions.
    #[arg(long = "store-kernels")]
    store_kernels: bool,
    /// Candidate budget per record.
    #[arg(long, default_value_t = 5000)]
    max: usize,
    /// Tune only the extra-flags value N.
    #[arg(long = "e")]
    e: Option<u32>,
}

fn config_from_args(args: &Args) -> TuneConfig {
    let mut cfg = TuneConfig::default();

    let func_selectors = [
        (args.gemm, BlasFunction::Gemm),
        (args.trmm, BlasFunction::Trmm),
        (args.trsm, BlasFunction::Trsm),
        (args.gemv, BlasFunction::Gemv),
        (args.symv, BlasFunction::Symv),
        (args.syrk, BlasFunction::Syrk),
        (args.syr2k, BlasFunction::Syr2k),
    ];
    if func_selectors.iter().any(|&(set, _)| set) {
        cfg.funcs = Default::default();
        for &(set, func) in func_selectors.iter() {
            cfg.funcs[func.index()] = set;
        }
    }

    let dtype_selectors = [
        (args.float, DataType::F32),
        (args.double, DataType::F64),
        (args.complex, DataType::C32),
        (args.double_complex, DataType::C64),
    ];
    if dtype_selectors.iter().any(|&(set, _)| set) {
        cfg.dtypes = Default::default();
        for &(set, dtype) in dtype_selectors.iter() {
            cfg.dtypes[dtype.index()] = set;
        }
    }

    if args.buffers {
        cfg.pattern = Some(0);
    } else if args.images {
        cfg.pattern = Some(1);
    } else if args.caches {
        cfg.pattern = Some(2);
    }

    cfg.fast = args.fast;
    cfg.rebuild = args.rebuild;
    cfg.store_kernels = args.store_kernels;
    cfg.max_candidates = args.max;
    cfg.flag_set = args.e;
    cfg
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    if storage::storage_dir().is_none() {
        eprintln!(
            "The environment variable '{}' is not defined",
            storage::ENV_STORAGE_PATH
        );
        process::exit(EXIT_NO_ENVIRONMENT_VARIABLE);
    }

    let cfg = config_from_args(&args);
    if let Err(err) = run_tuning(&cfg) {
        eprintln!("tuning failed: {}", err);
        process::exit(EXIT_IO_FAILURE);
    }
}
