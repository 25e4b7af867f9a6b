//! BLAS kernel solution pipeline for `OpenCL` devices.
//!
//! This crate turns an incoming BLAS call (GEMM, TRMM/TRSM, SYRK/SYR2K,
//! GEMV, SYMV) into a sequence of device kernels: it splits the problem
//! across command queues, rewrites compound operations into event-chained
//! sub-steps, picks a memory pattern and a two-level tiling for each step,
//! expands a kernel template for the chosen configuration, and reuses
//! compiled kernels through an in-memory cache plus a persistent
//! per-device tuning database.
//!
//! The heavy lifting happens in a handful of layers:
//!
//! * [`device`]: stable device identity and measured hardware facts.
//! * [`pattern`]: the per-function registry of memory patterns.
//! * [`granulation`]: tile-size and work-group-shape selection.
//! * [`generator`]: the `%DIRECTIVE` template expander emitting kernels.
//! * [`cache`] / [`storage`]: compiled-kernel reuse, in memory and on
//!   disk.
//! * [`decompose`] / [`solution`]: queue sharding, compound rewrites and
//!   the final solution sequence.
//! * [`tune`]: the offline autotuner behind the `ocl-blas-tune` binary.
//!
//! Device interaction goes through the [`ocl`] crate; `ocl::core` is used
//! directly where the high-level interface has no counterpart.
//!
//! ## Environment
//!
//! * `CLBLAS_STORAGE_PATH`: directory of the per-device `.kdb` tuning
//!   files. Without it the library silently falls back to built-in
//!   defaults.
//! * `AMD_CLBLAS_{GEMM,TRMM,TRSM}_IMPLEMENTATION`: force a pattern index
//!   for the named function.

pub extern crate ocl;

#[cfg(test)]
mod tests;

pub mod cache;
pub mod decompose;
pub mod device;
pub mod dims;
pub mod error;
pub mod flags;
pub mod generator;
pub mod granulation;
pub mod kargs;
pub mod pattern;
pub mod patterns;
pub mod scratch;
pub mod solution;
pub mod storage;
pub mod tune;
pub mod types;
pub mod util;

pub use crate::cache::{set_kernels_cacheable, CachedKernel, KernelKey};
pub use crate::decompose::select_vectorization;
pub use crate::device::{DeviceDescriptor, DeviceIdent, DeviceVendor};
pub use crate::dims::{PGranularity, SubproblemDim, MAX_SUBDIMS, SUBDIM_UNUSED};
pub use crate::error::{Error, Result};
pub use crate::flags::{KernelExtra, KernelExtraFlags};
pub use crate::kargs::ProblemArgs;
pub use crate::pattern::{select_pattern, MemoryPattern, SolverOps, SOLVERS};
pub use crate::solution::{make_solution_seq, SolutionSeq, SolutionStep};
pub use crate::storage::{get_granularity_info, get_kernel_info};
pub use crate::types::{BlasFunction, DataType, Multiplier};
