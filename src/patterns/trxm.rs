//! TRMM and TRSM memory patterns.
//!
//! One operations object serves both routines: the multiply and the solve
//! share their argument layout, granulation preferences and selection
//! behavior, and differ in the emitted kernel. The triangle actually
//! addressed by the kernel is the triangle of `op(A)`, so the storage
//! `uplo` is flipped under transposition before the template is expanded.

use ocl::core::Kernel as KernelCore;

use super::{bind_mem, bind_multiplier, bind_uint, make_generator, panels_fit_lds, INDEX_PRELUDE};
use crate::dims::{PGranularity, SolverFlags, SubproblemDim};
use crate::error::Result;
use crate::flags::{KernelExtra, KernelExtraFlags};
use crate::kargs::ProblemArgs;
use crate::pattern::{MemLevel, MemoryPattern, MpatExtra, SolverOps};
use crate::types::DataType;
use crate::util;

/// Triangular matrix multiply, one work-item per element of `B`.
///
/// `kfirst`/`klast` bound the K loop to the triangle of `op(A)`.
const TRMM_SRC: &str = r#"
__kernel void trmmBlock(
    uint M, uint N,
    const %TYPE alpha,
    __global const %TYPE *restrict A, uint lda,
    __global %TYPE *B, uint ldb,
    uint offA, uint offB)
{
    A += offA;
    B += offB;

%IF(%WG2D)    const uint row = get_global_id(0); const uint col = get_global_id(1);
%IF(%WG1D)    const uint gid = get_global_id(0); const uint row = gid / N; const uint col = gid % N;
    if (row >= M || col >= N) {
        return;
    }

    const uint kfirst = %KFIRST;
    const uint klast = %KLAST;

    %TYPE acc = %INIT(0.0);
    for (uint k = kfirst; k <= klast; ++k) {
        %TYPE a;
        if (k == %DIAGIDX) {
%IF(%UNIT)            a = %INIT(1.0);
%IF(%NOTUNIT)            a = %ATRI;
        } else {
            a = %ATRI;
        }
        %CONJUGATE(%DOCONJA, a);
        %TYPE b = %BOTH;
        %MAD(acc, a, b);
    }

    %TYPE v = %INIT(0.0);
    %MUL(v, alpha, acc);
    B[IDXB(row, col)] = v;
}
"#;

/// Triangular solve by substitution: work-items own one line of `B` each
/// and walk the sequential axis in dependency order.
const TRSM_SRC: &str = r#"
__kernel void trsmBlock(
    uint M, uint N,
    const %TYPE alpha,
    __global const %TYPE *restrict A, uint lda,
    __global %TYPE *B, uint ldb,
    uint offA, uint offB)
{
    A += offA;
    B += offB;

    const uint p = get_global_id(0);
    if (p >= %PARN) {
        return;
    }

%IF(%FWD)    for (uint r = 0; r < %SEQN; ++r) {
%IF(%BWD)    for (uint rr = %SEQN; rr > 0; --rr) { const uint r = rr - 1;
        %TYPE sum = %INIT(0.0);
        %MUL(sum, alpha, %BELEM);
%IF(%FWD)        for (uint k = 0; k < r; ++k) {
%IF(%BWD)        for (uint k = r + 1; k < %SEQN; ++k) {
            %TYPE a = %AELEM;
            %CONJUGATE(%DOCONJA, a);
            %TYPE xv = %XELEM;
            %TYPE t = %INIT(0.0);
            %MUL(t, a, xv);
            sum -= t;
        }
%IF(%NOTUNIT)        { %TYPE d = %ADIAG; %CONJUGATE(%DOCONJA, d); %TYPE q = %INIT(0.0); %DIV(q, sum, d); sum = q; }
        %BELEM = sum;
    }
}
"#;

#[derive(Clone, Copy)]
pub(super) struct TrxmOps {
    solve: bool,
    lds: bool,
}

fn seed_triangle_keys(gen: &mut crate::generator::KernelGenerator, flags: KernelExtraFlags) {
    use KernelExtraFlags as F;

    let side_right = flags.contains(F::SIDE_RIGHT);
    // Triangle of op(A), not of the stored matrix.
    let eff_lower = flags.contains(F::UPPER_TRI) == flags.contains(F::TRANS_A);

    // TRMM bounds and element accessors.
    let (kfirst, klast, diag, atri, both) = if side_right {
        // B * op(A): the triangle constrains (k, col) of A.
        let (kf, kl) = if eff_lower {
            ("col", "N - 1")
        } else {
            ("0", "col")
        };
        (kf, kl, "col", "LOADA(k, col)", "B[IDXB(row, k)]")
    } else {
        let (kf, kl) = if eff_lower {
            ("0", "row")
        } else {
            ("row", "M - 1")
        };
        (kf, kl, "row", "LOADA(row, k)", "B[IDXB(k, col)]")
    };
    gen.put("%KFIRST", kfirst);
    gen.put("%KLAST", klast);
    gen.put("%DIAGIDX", diag);
    gen.put("%ATRI", atri);
    gen.put("%BOTH", both);

    // TRSM sequential/parallel axis split and solve direction.
    let forward = eff_lower != side_right;
    gen.put("%FWD", if forward { "1" } else { "0" });
    gen.put("%BWD", if forward { "0" } else { "1" });
    if side_right {
        gen.put("%SEQN", "N");
        gen.put("%PARN", "M");
        gen.put("%AELEM", "LOADA(k, r)");
        gen.put("%ADIAG", "LOADA(r, r)");
        gen.put("%XELEM", "B[IDXB(p, k)]");
        gen.put("%BELEM", "B[IDXB(p, r)]");
    } else {
        gen.put("%SEQN", "M");
        gen.put("%PARN", "N");
        gen.put("%AELEM", "LOADA(r, k)");
        gen.put("%ADIAG", "LOADA(r, r)");
        gen.put("%XELEM", "B[IDXB(k, p)]");
        gen.put("%BELEM", "B[IDXB(r, p)]");
    }
}

impl SolverOps for TrxmOps {
    fn flags(&self) -> SolverFlags {
        if self.lds {
            SolverFlags::TOP_INPUT_SQUARE_BLOCKS
        } else if self.solve {
            SolverFlags::empty()
        } else {
            SolverFlags::WSPACE_2D
        }
    }

    fn is_fit_to_lds(
        &self,
        dims: &[SubproblemDim],
        dtype: DataType,
        lds_budget: u64,
        _args: &ProblemArgs,
    ) -> Option<bool> {
        if self.lds {
            Some(panels_fit_lds(dims, dtype, lds_budget))
        } else {
            None
        }
    }

    fn gen_kernel(
        &self,
        dims: &[SubproblemDim],
        pgran: &PGranularity,
        extra: &KernelExtra,
    ) -> Result<String> {
        let mut gen = make_generator(dims, pgran, extra)?;
        seed_triangle_keys(&mut gen, extra.flags);
        let body = if self.solve { TRSM_SRC } else { TRMM_SRC };
        gen.expand(&format!("{}{}", INDEX_PRELUDE, body))
    }

    fn kernel_name(&self, _extra: &KernelExtra) -> &'static str {
        if self.solve {
            "trsmBlock"
        } else {
            "trmmBlock"
        }
    }

    fn assign_kargs(
        &self,
        kernel: &KernelCore,
        args: &ProblemArgs,
        extra: &KernelExtra,
    ) -> Result<()> {
        bind_uint(kernel, 0, args.m)?;
        bind_uint(kernel, 1, args.n)?;
        bind_multiplier(kernel, 2, extra.dtype, args.alpha)?;
        bind_mem(kernel, 3, &args.a, "A")?;
        bind_uint(kernel, 4, args.lda)?;
        bind_mem(kernel, 5, &args.b, "B")?;
        bind_uint(kernel, 6, args.ldb)?;
        bind_uint(kernel, 7, args.off_a)?;
        bind_uint(kernel, 8, args.off_bx)?;
        Ok(())
    }

    fn calc_threads(
        &self,
        _dims: &[SubproblemDim],
        pgran: &PGranularity,
        args: &ProblemArgs,
        extra: &KernelExtra,
    ) -> Option<[usize; 2]> {
        let group = pgran.group_size() as usize;
        if self.solve {
            let par = if extra.flags.contains(KernelExtraFlags::SIDE_RIGHT) {
                args.m
            } else {
                args.n
            };
            Some([util::round_up(par.max(1), group), 1])
        } else if pgran.wg_dim == 2 {
            Some([
                util::round_up(args.m.max(1), pgran.wg_size[0] as usize),
                util::round_up(args.n.max(1), pgran.wg_size[1] as usize),
            ])
        } else {
            Some([util::round_up((args.m * args.n).max(1), group), 1])
        }
    }
}

static BUFFER_TRMM: TrxmOps = TrxmOps {
    solve: false,
    lds: true,
};
static CACHED_TRMM: TrxmOps = TrxmOps {
    solve: false,
    lds: false,
};
static BUFFER_TRSM: TrxmOps = TrxmOps {
    solve: true,
    lds: true,
};
static CACHED_TRSM: TrxmOps = TrxmOps {
    solve: true,
    lds: false,
};
// Partially integrated LDS-less solve; registered but masked out of the
// exposed pattern count.
static LDSLESS_TRSM: TrxmOps = TrxmOps {
    solve: true,
    lds: false,
};

pub fn register_trmm() -> Vec<MemoryPattern> {
    vec![
        MemoryPattern {
            name: "BufferTrmm",
            nr_levels: 2,
            cu_level: 0,
            th_level: 1,
            extra: MpatExtra {
                a_mset: MemLevel::LDS,
                b_mset: MemLevel::empty(),
            },
            sops: &BUFFER_TRMM,
        },
        MemoryPattern {
            name: "CachedTrmm",
            nr_levels: 2,
            cu_level: 0,
            th_level: 1,
            extra: MpatExtra {
                a_mset: MemLevel::L1,
                b_mset: MemLevel::L2,
            },
            sops: &CACHED_TRMM,
        },
    ]
}

pub fn register_trsm() -> Vec<MemoryPattern> {
    vec![
        MemoryPattern {
            name: "BufferTrsm",
            nr_levels: 2,
            cu_level: 0,
            th_level: 1,
            extra: MpatExtra {
                a_mset: MemLevel::LDS,
                b_mset: MemLevel::empty(),
            },
            sops: &BUFFER_TRSM,
        },
        MemoryPattern {
            name: "CachedTrsm",
            nr_levels: 2,
            cu_level: 0,
            th_level: 1,
            extra: MpatExtra {
                a_mset: MemLevel::L1,
                b_mset: MemLevel::L2,
            },
            sops: &CACHED_TRSM,
        },
        MemoryPattern {
            name: "LdslessTrsm",
            nr_levels: 1,
            cu_level: 0,
            th_level: 0,
            extra: MpatExtra {
                a_mset: MemLevel::empty(),
                b_mset: MemLevel::empty(),
            },
            sops: &LDSLESS_TRSM,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{KernelExtra, KernelExtraFlags};
    use crate::types::DataType;

    fn dims_and_gran(two_d: bool) -> ([SubproblemDim; 2], PGranularity) {
        let cu = SubproblemDim {
            y: 32,
            x: 32,
            bwidth: 32,
            item_y: 32,
            item_x: 32,
        };
        let th = SubproblemDim {
            y: 4,
            x: 4,
            bwidth: 4,
            item_y: 4,
            item_x: 4,
        };
        let pg = PGranularity {
            wg_dim: if two_d { 2 } else { 1 },
            wg_size: if two_d { [8, 8] } else { [64, 1] },
            wf_size: 64,
            max_work_group_size: 256,
        };
        ([cu, th], pg)
    }

    #[test]
    fn trmm_triangle_bounds_follow_op_a() {
        let (dims, pg) = dims_and_gran(false);

        // Lower, no transpose: k runs from 0 to the row.
        let mut extra = KernelExtra::new(DataType::F32);
        let src = BUFFER_TRMM.gen_kernel(&dims, &pg, &extra).unwrap();
        assert!(src.contains("const uint kfirst = 0;"));
        assert!(src.contains("const uint klast = row;"));

        // Lower storage under transposition acts as upper.
        extra.flags = KernelExtraFlags::TRANS_A;
        let src = BUFFER_TRMM.gen_kernel(&dims, &pg, &extra).unwrap();
        assert!(src.contains("const uint kfirst = row;"));
        assert!(src.contains("const uint klast = M - 1;"));
    }

    #[test]
    fn trsm_direction_depends_on_triangle_and_side() {
        let (dims, pg) = dims_and_gran(false);

        let extra = KernelExtra::new(DataType::F32);
        let src = CACHED_TRSM.gen_kernel(&dims, &pg, &extra).unwrap();
        assert!(src.contains("for (uint r = 0; r < M; ++r)"));

        let mut extra = KernelExtra::new(DataType::F32);
        extra.flags = KernelExtraFlags::UPPER_TRI;
        let src = CACHED_TRSM.gen_kernel(&dims, &pg, &extra).unwrap();
        assert!(src.contains("for (uint rr = M; rr > 0; --rr)"));
    }

    #[test]
    fn trsm_unit_diag_skips_division(){
        let (dims, pg) = dims_and_gran(false);
        let mut extra = KernelExtra::new(DataType::F32);
        extra.flags = KernelExtraFlags::UNIT_DIAG;
        let src = CACHED_TRSM.gen_kernel(&dims, &pg, &extra).unwrap();
        assert!(!src.contains(" / "), "unit diagonal must not divide");
    }

    #[test]
    fn trmm_2d_variant_uses_both_global_ids() {
        let (dims, pg) = dims_and_gran(true);
        let extra = KernelExtra::new(DataType::F32);
        let src = CACHED_TRMM.gen_kernel(&dims, &pg, &extra).unwrap();
        assert!(src.contains("get_global_id(1)"));
    }
}
