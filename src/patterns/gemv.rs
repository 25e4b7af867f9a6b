//! GEMV memory pattern: one work-group per output element row, partial
//! dot products reduced across the group.

use ocl::core::Kernel as KernelCore;

use super::{bind_mem, bind_multiplier, bind_uint, make_generator, INDEX_PRELUDE};
use crate::dims::{PGranularity, SolverFlags, SubproblemDim};
use crate::error::Result;
use crate::flags::KernelExtra;
use crate::kargs::ProblemArgs;
use crate::pattern::{MemLevel, MemoryPattern, MpatExtra, SolverOps};
use crate::util;

const GEMV_SRC: &str = r#"
__attribute__((reqd_work_group_size(%WGSZ, 1, 1)))
__kernel void gemvBlock(
    uint M, uint N, uint startM,
    const %TYPE alpha, const %TYPE beta,
    __global const %TYPE *restrict A, uint lda,
    __global const %TYPE *restrict X, uint incx,
    __global %TYPE *Y, uint incy,
    uint offA, uint offX, uint offY)
{
    A += offA;
    X += offX;
    Y += offY;

    const uint row = startM + get_group_id(0);
    const uint lid = get_local_id(0);

    %TYPE part = %INIT(0.0);
    for (uint j = lid; j < N; j += %WGSZ) {
        %TYPE a = LOADA(row, j);
        %CONJUGATE(%DOCONJA, a);
%IF(%INCX1)        %TYPE xv = X[j];
%IF(%INCXN)        %TYPE xv = X[j * incx];
        %MAD(part, a, xv);
    }

    %REDUCTION_BY_SUM(part);

    if (lid == 0) {
        %TYPE v = %INIT(0.0);
        %MUL(v, alpha, part);
%IF(%INCY1)        const uint yi = row;
%IF(%INCYN)        const uint yi = row * incy;
%IF(%NOTBETAZERO)        { %TYPE yv = Y[yi]; %MAD(v, beta, yv); }
        Y[yi] = v;
    }
}
"#;

struct BufferGemv;

impl SolverOps for BufferGemv {
    fn flags(&self) -> SolverFlags {
        SolverFlags::empty()
    }

    fn gen_kernel(
        &self,
        dims: &[SubproblemDim],
        pgran: &PGranularity,
        extra: &KernelExtra,
    ) -> Result<String> {
        let gen = make_generator(dims, pgran, extra)?;
        gen.expand(&format!("{}{}", INDEX_PRELUDE, GEMV_SRC))
    }

    fn kernel_name(&self, _extra: &KernelExtra) -> &'static str {
        "gemvBlock"
    }

    fn assign_kargs(
        &self,
        kernel: &KernelCore,
        args: &ProblemArgs,
        extra: &KernelExtra,
    ) -> Result<()> {
        bind_uint(kernel, 0, args.m)?;
        bind_uint(kernel, 1, args.n)?;
        bind_uint(kernel, 2, args.offset_m)?;
        bind_multiplier(kernel, 3, extra.dtype, args.alpha)?;
        bind_multiplier(kernel, 4, extra.dtype, args.beta)?;
        bind_mem(kernel, 5, &args.a, "A")?;
        bind_uint(kernel, 6, args.lda)?;
        bind_mem(kernel, 7, &args.b, "x")?;
        bind_uint(kernel, 8, args.ldb.max(1))?;
        bind_mem(kernel, 9, &args.c, "y")?;
        bind_uint(kernel, 10, args.ldc.max(1))?;
        bind_uint(kernel, 11, args.off_a)?;
        bind_uint(kernel, 12, args.off_bx)?;
        bind_uint(kernel, 13, args.off_cy)?;
        Ok(())
    }

    fn calc_threads(
        &self,
        _dims: &[SubproblemDim],
        pgran: &PGranularity,
        args: &ProblemArgs,
        _extra: &KernelExtra,
    ) -> Option<[usize; 2]> {
        Some([row_grid(args.m, pgran.group_size() as usize), 1])
    }
}

static BUFFER_GEMV: BufferGemv = BufferGemv;

pub fn register() -> Vec<MemoryPattern> {
    vec![MemoryPattern {
        name: "BufferGemv",
        nr_levels: 1,
        cu_level: 0,
        th_level: 0,
        extra: MpatExtra {
            a_mset: MemLevel::empty(),
            b_mset: MemLevel::LDS,
        },
        sops: &BUFFER_GEMV,
    }]
}

/// Grid helper shared with SYMV: one group per row, padded to the group
/// size.
pub(super) fn row_grid(m: usize, group: usize) -> usize {
    util::round_up(m.max(1), 1) * group
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{KernelExtra, KernelExtraFlags};
    use crate::types::DataType;

    fn dims_and_gran() -> ([SubproblemDim; 1], PGranularity) {
        let cu = SubproblemDim {
            y: 1,
            x: 1,
            bwidth: 64,
            item_y: 1,
            item_x: 1,
        };
        let pg = PGranularity {
            wg_dim: 1,
            wg_size: [64, 1],
            wf_size: 64,
            max_work_group_size: 256,
        };
        ([cu], pg)
    }

    #[test]
    fn gemv_kernel_reduces_across_the_group() {
        let (dims, pg) = dims_and_gran();
        let extra = KernelExtra::new(DataType::F32);
        let src = BUFFER_GEMV.gen_kernel(&dims, &pg, &extra).unwrap();
        assert!(src.contains("__kernel void gemvBlock"));
        assert!(src.contains("barrier(CLK_LOCAL_MEM_FENCE)"));
        assert!(src.contains("get_group_id(0)"));
    }

    #[test]
    fn unit_increments_index_directly() {
        let (dims, pg) = dims_and_gran();
        let mut extra = KernelExtra::new(DataType::F32);
        extra.flags = KernelExtraFlags::INCX_ONE | KernelExtraFlags::INCY_ONE;
        let src = BUFFER_GEMV.gen_kernel(&dims, &pg, &extra).unwrap();
        assert!(src.contains("X[j];"));
        assert!(!src.contains("X[j * incx]"));
    }
}
