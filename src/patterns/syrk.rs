//! SYRK and SYR2K memory patterns.
//!
//! One operations object serves both: a SYR2K step runs the same rank-k
//! update kernel with a distinct second operand, and the decomposer turns
//! one SYR2K call into two such steps. The diagonal-split flags restrict a
//! kernel to the off-diagonal or the diagonal tile rows.

use ocl::core::Kernel as KernelCore;

use super::{bind_mem, bind_multiplier, bind_uint, make_generator, INDEX_PRELUDE};
use crate::dims::{PGranularity, SolverFlags, SubproblemDim};
use crate::error::Result;
use crate::flags::KernelExtra;
use crate::kargs::ProblemArgs;
use crate::pattern::{MemLevel, MemoryPattern, MpatExtra, SolverOps};
use crate::util;

/// Rank-k update of the triangular part of `C`, one work-item per output
/// element. The second operand `S` is `A` again for SYRK and `B` for the
/// two halves of a SYR2K.
const SYRK_SRC: &str = r#"
%IF(%ROWMAJ)#define IDXS(r, c) ((size_t)(r) * %SLD + (c))
%IF(%COLMAJ)#define IDXS(r, c) ((size_t)(c) * %SLD + (r))
%IF(%NOTRA)#define LOADS(c, k) %SMAT[IDXS(c, k)]
%IF(%TRA)#define LOADS(c, k) %SMAT[IDXS(k, c)]

__kernel void syrkBlock(
    uint M, uint N, uint K, uint startM,
    const %TYPE alpha, const %TYPE beta,
    __global const %TYPE *restrict A, uint lda,
    __global const %TYPE *restrict B, uint ldb,
    __global %TYPE *C, uint ldc,
    uint offA, uint offB, uint offC)
{
    A += offA;
    B += offB;
    C += offC;

    const uint row = startM + get_global_id(0);
    const uint col = get_global_id(1);
    if (get_global_id(0) >= M || col >= N) {
        return;
    }
%IF(%UPPER)    if (row > col) { return; }
%IF(%LOWER)    if (col > row) { return; }
%IF(%SEPDIAG)    if (row / %Y0 == col / %Y0) { return; }
%IF(%EVALDIAG)    if (row / %Y0 != col / %Y0) { return; }

    %TYPE acc = %INIT(0.0);
    for (uint k = 0; k < K; ++k) {
        %TYPE a = LOADA(row, k);
        %CONJUGATE(%DOCONJA, a);
        %TYPE s = LOADS(col, k);
        %MAD(acc, a, s);
    }

    %TYPE v = %INIT(0.0);
    %MUL(v, alpha, acc);
%IF(%NOTBETAZERO)    { %TYPE cv = C[IDXC(row, col)]; %MAD(v, beta, cv); }
    C[IDXC(row, col)] = v;
}
"#;

#[derive(Clone, Copy)]
struct SyrkOps {
    rank2k: bool,
}

impl SolverOps for SyrkOps {
    fn flags(&self) -> SolverFlags {
        SolverFlags::WSPACE_2D
    }

    fn gen_kernel(
        &self,
        dims: &[SubproblemDim],
        pgran: &PGranularity,
        extra: &KernelExtra,
    ) -> Result<String> {
        let mut gen = make_generator(dims, pgran, extra)?;
        if self.rank2k {
            gen.put("%SMAT", "B");
            gen.put("%SLD", "ldb");
        } else {
            gen.put("%SMAT", "A");
            gen.put("%SLD", "lda");
        }
        gen.expand(&format!("{}{}", INDEX_PRELUDE, SYRK_SRC))
    }

    fn kernel_name(&self, _extra: &KernelExtra) -> &'static str {
        "syrkBlock"
    }

    fn assign_kargs(
        &self,
        kernel: &KernelCore,
        args: &ProblemArgs,
        extra: &KernelExtra,
    ) -> Result<()> {
        bind_uint(kernel, 0, args.m)?;
        bind_uint(kernel, 1, args.n)?;
        bind_uint(kernel, 2, args.k)?;
        bind_uint(kernel, 3, args.offset_m)?;
        bind_multiplier(kernel, 4, extra.dtype, args.alpha)?;
        bind_multiplier(kernel, 5, extra.dtype, args.beta)?;
        bind_mem(kernel, 6, &args.a, "A")?;
        bind_uint(kernel, 7, args.lda)?;
        // SYRK never touches its B slot; bind A again to keep the kernel
        // signature uniform.
        if self.rank2k {
            bind_mem(kernel, 8, &args.b, "B")?;
        } else {
            bind_mem(kernel, 8, &args.a, "A")?;
        }
        bind_uint(kernel, 9, args.ldb.max(args.lda))?;
        bind_mem(kernel, 10, &args.c, "C")?;
        bind_uint(kernel, 11, args.ldc)?;
        bind_uint(kernel, 12, args.off_a)?;
        bind_uint(kernel, 13, args.off_bx)?;
        bind_uint(kernel, 14, args.off_cy)?;
        Ok(())
    }

    fn calc_threads(
        &self,
        _dims: &[SubproblemDim],
        pgran: &PGranularity,
        args: &ProblemArgs,
        _extra: &KernelExtra,
    ) -> Option<[usize; 2]> {
        Some([
            util::round_up(args.m.max(1), pgran.wg_size[0] as usize),
            util::round_up(args.n.max(1), pgran.wg_size[1].max(1) as usize),
        ])
    }
}

static CACHED_SYRK: SyrkOps = SyrkOps { rank2k: false };
static CACHED_SYR2K: SyrkOps = SyrkOps { rank2k: true };

fn cached_pattern(name: &'static str, sops: &'static dyn SolverOps) -> MemoryPattern {
    MemoryPattern {
        name,
        nr_levels: 2,
        cu_level: 0,
        th_level: 1,
        extra: MpatExtra {
            a_mset: MemLevel::L1,
            b_mset: MemLevel::L2,
        },
        sops,
    }
}

pub fn register_syrk() -> Vec<MemoryPattern> {
    vec![cached_pattern("CachedSyrk", &CACHED_SYRK)]
}

pub fn register_syr2k() -> Vec<MemoryPattern> {
    vec![cached_pattern("CachedSyr2k", &CACHED_SYR2K)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{KernelExtra, KernelExtraFlags};
    use crate::types::DataType;

    fn dims_and_gran() -> ([SubproblemDim; 2], PGranularity) {
        let cu = SubproblemDim {
            y: 32,
            x: 32,
            bwidth: 8,
            item_y: 32,
            item_x: 32,
        };
        let th = SubproblemDim {
            y: 4,
            x: 4,
            bwidth: 8,
            item_y: 4,
            item_x: 4,
        };
        let pg = PGranularity {
            wg_dim: 2,
            wg_size: [8, 8],
            wf_size: 64,
            max_work_group_size: 256,
        };
        ([cu, th], pg)
    }

    #[test]
    fn diagonal_split_guards() {
        let (dims, pg) = dims_and_gran();
        let mut extra = KernelExtra::new(DataType::F32);

        extra.flags = KernelExtraFlags::SYRK_SEPARATE_DIAGONAL;
        let src = CACHED_SYRK.gen_kernel(&dims, &pg, &extra).unwrap();
        assert!(src.contains("if (row / 32 == col / 32) { return; }"));

        extra.flags = KernelExtraFlags::SYRK_EVALUATE_DIAGONAL;
        let src = CACHED_SYRK.gen_kernel(&dims, &pg, &extra).unwrap();
        assert!(src.contains("if (row / 32 != col / 32) { return; }"));
    }

    #[test]
    fn syr2k_reads_its_second_operand_from_b() {
        let (dims, pg) = dims_and_gran();
        let extra = KernelExtra::new(DataType::F32);
        let src = CACHED_SYR2K.gen_kernel(&dims, &pg, &extra).unwrap();
        assert!(src.contains("#define LOADS(c, k) B[IDXS(c, k)]"));
        let src = CACHED_SYRK.gen_kernel(&dims, &pg, &extra).unwrap();
        assert!(src.contains("#define LOADS(c, k) A[IDXS(c, k)]"));
    }
}
