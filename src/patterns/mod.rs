//! Concrete memory patterns: the kernel strategies registered per BLAS
//! function, their templates and argument-binding glue.

pub mod gemm;
pub mod gemv;
pub mod symv;
pub mod syrk;
pub mod trxm;

use ocl::core::{self, ArgVal, Kernel as KernelCore, Mem};
use ocl::prm::{Double2, Float2};

use crate::dims::{PGranularity, SubproblemDim, SUBDIM_UNUSED};
use crate::error::{Error, Result};
use crate::flags::{KernelExtra, KernelExtraFlags};
use crate::generator::KernelGenerator;
use crate::kargs::ProblemArgs;
use crate::types::{DataType, Multiplier};

/// Binds a `uint` kernel argument.
pub(crate) fn bind_uint(kernel: &KernelCore, idx: u32, val: usize) -> Result<()> {
    core::set_kernel_arg(kernel, idx, ArgVal::scalar(&(val as u32)))?;
    Ok(())
}

/// Binds an `alpha`/`beta` scalar with the width of the element type.
pub(crate) fn bind_multiplier(
    kernel: &KernelCore,
    idx: u32,
    dtype: DataType,
    m: Multiplier,
) -> Result<()> {
    match dtype {
        DataType::F32 => core::set_kernel_arg(kernel, idx, ArgVal::scalar(&(m.re as f32)))?,
        DataType::F64 => core::set_kernel_arg(kernel, idx, ArgVal::scalar(&m.re))?,
        DataType::C32 => core::set_kernel_arg(
            kernel,
            idx,
            ArgVal::scalar(&Float2::new(m.re as f32, m.im as f32)),
        )?,
        DataType::C64 => {
            core::set_kernel_arg(kernel, idx, ArgVal::scalar(&Double2::new(m.re, m.im)))?
        }
    }
    Ok(())
}

/// Binds a buffer argument, failing when the caller did not supply it.
pub(crate) fn bind_mem(kernel: &KernelCore, idx: u32, mem: &Option<Mem>, which: &str) -> Result<()> {
    let mem = mem
        .as_ref()
        .ok_or_else(|| Error::invalid(format!("missing {} buffer", which)))?;
    core::set_kernel_arg(kernel, idx, ArgVal::mem(mem))?;
    Ok(())
}

fn item_or_one(v: usize) -> usize {
    if v == SUBDIM_UNUSED || v == 0 {
        1
    } else {
        v
    }
}

/// Creates a generator for the step and seeds the tile-size and predicate
/// keys every template relies on.
pub(crate) fn make_generator(
    dims: &[SubproblemDim],
    pgran: &PGranularity,
    extra: &KernelExtra,
) -> Result<KernelGenerator> {
    use KernelExtraFlags as F;

    let mut gen = KernelGenerator::for_extra(extra, pgran.group_size() as usize)?;

    let cu = dims.get(0).copied().unwrap_or_default();
    let th = dims.get(1).copied().unwrap_or(cu);

    gen.put("%Y0", item_or_one(cu.y).to_string());
    gen.put("%X0", item_or_one(cu.x).to_string());
    gen.put("%BW0", item_or_one(cu.bwidth).to_string());
    gen.put("%ITY", item_or_one(th.item_y).to_string());
    gen.put("%ITX", item_or_one(th.item_x).to_string());
    gen.put("%BW1", item_or_one(th.bwidth).to_string());
    gen.put("%WGY", pgran.wg_size[0].to_string());
    gen.put("%WGX", pgran.wg_size[1].max(1).to_string());
    gen.put("%WG2D", if pgran.wg_dim == 2 { "1" } else { "0" });
    gen.put("%WG1D", if pgran.wg_dim == 2 { "0" } else { "1" });
    gen.put("%WGSZ", pgran.group_size().to_string());

    let flag = |set: bool| if set { "1" } else { "0" };
    let f = extra.flags;
    gen.put("%TRA", flag(f.contains(F::TRANS_A)));
    gen.put("%NOTRA", flag(!f.contains(F::TRANS_A)));
    gen.put("%TRB", flag(f.contains(F::TRANS_B)));
    gen.put("%NOTRB", flag(!f.contains(F::TRANS_B)));
    gen.put("%DOCONJA", flag(f.contains(F::CONJ_A)));
    gen.put("%DOCONJB", flag(f.contains(F::CONJ_B)));
    gen.put("%COLMAJ", flag(f.contains(F::COL_MAJOR)));
    gen.put("%ROWMAJ", flag(!f.contains(F::COL_MAJOR)));
    gen.put("%BETAZERO", flag(f.contains(F::BETA_ZERO)));
    gen.put("%NOTBETAZERO", flag(!f.contains(F::BETA_ZERO)));
    gen.put("%UPPER", flag(f.contains(F::UPPER_TRI)));
    gen.put("%LOWER", flag(!f.contains(F::UPPER_TRI)));
    gen.put("%UNIT", flag(f.contains(F::UNIT_DIAG)));
    gen.put("%NOTUNIT", flag(!f.contains(F::UNIT_DIAG)));
    gen.put("%SIDERIGHT", flag(f.contains(F::SIDE_RIGHT)));
    gen.put("%SIDELEFT", flag(!f.contains(F::SIDE_RIGHT)));
    gen.put("%INCX1", flag(f.contains(F::INCX_ONE)));
    gen.put("%INCXN", flag(!f.contains(F::INCX_ONE)));
    gen.put("%INCY1", flag(f.contains(F::INCY_ONE)));
    gen.put("%INCYN", flag(!f.contains(F::INCY_ONE)));
    gen.put("%SEPDIAG", flag(f.contains(F::SYRK_SEPARATE_DIAGONAL)));
    gen.put("%NOSEPDIAG", flag(!f.contains(F::SYRK_SEPARATE_DIAGONAL)));
    gen.put("%EVALDIAG", flag(f.contains(F::SYRK_EVALUATE_DIAGONAL)));
    gen.put("%NOEVALDIAG", flag(!f.contains(F::SYRK_EVALUATE_DIAGONAL)));
    gen.put("%RANK2K", flag(f.contains(F::SYRK_2K_RANK)));
    gen.put("%NORANK2K", flag(!f.contains(F::SYRK_2K_RANK)));

    Ok(gen)
}

/// The indexing prelude shared by buffer templates: majority-aware macros
/// for addressing the three matrices.
pub(crate) const INDEX_PRELUDE: &str = "\
%IF(%ROWMAJ)#define IDXA(r, c) ((size_t)(r) * lda + (c))
%IF(%COLMAJ)#define IDXA(r, c) ((size_t)(c) * lda + (r))
%IF(%ROWMAJ)#define IDXB(r, c) ((size_t)(r) * ldb + (c))
%IF(%COLMAJ)#define IDXB(r, c) ((size_t)(c) * ldb + (r))
%IF(%ROWMAJ)#define IDXC(r, c) ((size_t)(r) * ldc + (c))
%IF(%COLMAJ)#define IDXC(r, c) ((size_t)(c) * ldc + (r))
%IF(%NOTRA)#define LOADA(r, k) A[IDXA(r, k)]
%IF(%TRA)#define LOADA(r, k) A[IDXA(k, r)]
%IF(%NOTRB)#define LOADB(k, c) B[IDXB(k, c)]
%IF(%TRB)#define LOADB(k, c) B[IDXB(c, k)]
";

/// Standard LDS-footprint check for patterns staging both input panels.
pub(crate) fn panels_fit_lds(
    dims: &[SubproblemDim],
    dtype: DataType,
    lds_budget: u64,
) -> bool {
    let d = &dims[0];
    if d.y == 0 || d.x == 0 || d.bwidth == 0 {
        return false;
    }
    let bytes = (d.y * d.bwidth + d.bwidth * d.x) * dtype.size();
    bytes as u64 <= lds_budget
}
