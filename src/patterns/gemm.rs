//! GEMM memory patterns: LDS-staged buffers, image-staged operands, and
//! the cache-relying buffer variant.

use ocl::core::Kernel as KernelCore;

use super::{
    bind_mem, bind_multiplier, bind_uint, make_generator, panels_fit_lds, INDEX_PRELUDE,
};
use crate::dims::{PGranularity, SolverFlags, SubproblemDim};
use crate::error::Result;
use crate::flags::{KernelExtra, KernelExtraFlags, KernelType};
use crate::kargs::ProblemArgs;
use crate::pattern::{DecompAxis, MemLevel, MemoryPattern, MpatExtra, SolverOps};
use crate::types::{DataType, MatrixRole, Order};
use crate::util;

/// Tiled GEMM with both input panels staged through local memory.
const GEMM_BUFFER_SRC: &str = r#"
__attribute__((reqd_work_group_size(%WGY, %WGX, 1)))
__kernel void gemmBuffer(
    uint M, uint N, uint K,
    const %TYPE alpha, const %TYPE beta,
    __global const %TYPE *restrict A, uint lda,
    __global const %TYPE *restrict B, uint ldb,
    __global %TYPE *C, uint ldc,
    uint offA, uint offB, uint offC)
{
    A += offA;
    B += offB;
    C += offC;

    const uint gy = get_group_id(0) * %Y0;
    const uint gx = get_group_id(1) * %X0;
    const uint ly = get_local_id(0);
    const uint lx = get_local_id(1);
    const uint lid = ly * %WGX + lx;

    __local %TYPE blkA[%Y0 * %BW0];
    __local %TYPE blkB[%BW0 * %X0];

    %TYPE acc[%ITY][%ITX];
    for (uint i = 0; i < %ITY; ++i) {
        for (uint j = 0; j < %ITX; ++j) {
            acc[i][j] = %INIT(0.0);
        }
    }

    for (uint k0 = 0; k0 < K; k0 += %BW0) {
        for (uint e = lid; e < %Y0 * %BW0; e += %WGY * %WGX) {
            const uint row = gy + e / %BW0;
            const uint col = k0 + e % %BW0;
            %TYPE v = %INIT(0.0);
            if (row < M && col < K) {
                v = LOADA(row, col);
            }
            %CONJUGATE(%DOCONJA, v);
            blkA[e] = v;
        }
        for (uint e = lid; e < %BW0 * %X0; e += %WGY * %WGX) {
            const uint krow = k0 + e / %X0;
            const uint col = gx + e % %X0;
            %TYPE v = %INIT(0.0);
            if (krow < K && col < N) {
                v = LOADB(krow, col);
            }
            %CONJUGATE(%DOCONJB, v);
            blkB[e] = v;
        }
        barrier(CLK_LOCAL_MEM_FENCE);

        const uint kmax = min((uint)%BW0, K - k0);
        for (uint kk = 0; kk < kmax; ++kk) {
            for (uint i = 0; i < %ITY; ++i) {
                const %TYPE a = blkA[(ly * %ITY + i) * %BW0 + kk];
                for (uint j = 0; j < %ITX; ++j) {
                    const %TYPE b = blkB[kk * %X0 + lx * %ITX + j];
                    %MAD(acc[i][j], a, b);
                }
            }
        }
        barrier(CLK_LOCAL_MEM_FENCE);
    }

    for (uint i = 0; i < %ITY; ++i) {
        const uint row = gy + ly * %ITY + i;
        for (uint j = 0; j < %ITX; ++j) {
            const uint col = gx + lx * %ITX + j;
            if (row < M && col < N) {
                %TYPE v = %INIT(0.0);
                %MUL(v, alpha, acc[i][j]);
%IF(%NOTBETAZERO)               { %TYPE cv = C[IDXC(row, col)]; %MAD(v, beta, cv); }
                C[IDXC(row, col)] = v;
            }
        }
    }
}
"#;

/// GEMM reading its inputs straight from global memory, letting the cache
/// hierarchy do the staging.
const GEMM_CACHED_SRC: &str = r#"
__attribute__((reqd_work_group_size(%WGY, %WGX, 1)))
__kernel void gemmCached(
    uint M, uint N, uint K,
    const %TYPE alpha, const %TYPE beta,
    __global const %TYPE *restrict A, uint lda,
    __global const %TYPE *restrict B, uint ldb,
    __global %TYPE *C, uint ldc,
    uint offA, uint offB, uint offC)
{
    A += offA;
    B += offB;
    C += offC;

    const uint row0 = (get_group_id(0) * %WGY + get_local_id(0)) * %ITY;
    const uint col0 = (get_group_id(1) * %WGX + get_local_id(1)) * %ITX;

    %TYPE acc[%ITY][%ITX];
    for (uint i = 0; i < %ITY; ++i) {
        for (uint j = 0; j < %ITX; ++j) {
            acc[i][j] = %INIT(0.0);
        }
    }

    for (uint k = 0; k < K; ++k) {
        %TYPE a[%ITY];
        for (uint i = 0; i < %ITY; ++i) {
            const uint row = row0 + i;
            a[i] = (row < M) ? LOADA(row, k) : %INIT(0.0);
            %CONJUGATE(%DOCONJA, a[i]);
        }
        for (uint j = 0; j < %ITX; ++j) {
            const uint col = col0 + j;
            %TYPE b = (col < N) ? LOADB(k, col) : %INIT(0.0);
            %CONJUGATE(%DOCONJB, b);
            for (uint i = 0; i < %ITY; ++i) {
                %MAD(acc[i][j], a[i], b);
            }
        }
    }

    for (uint i = 0; i < %ITY; ++i) {
        const uint row = row0 + i;
        for (uint j = 0; j < %ITX; ++j) {
            const uint col = col0 + j;
            if (row < M && col < N) {
                %TYPE v = %INIT(0.0);
                %MUL(v, alpha, acc[i][j]);
%IF(%NOTBETAZERO)               { %TYPE cv = C[IDXC(row, col)]; %MAD(v, beta, cv); }
                C[IDXC(row, col)] = v;
            }
        }
    }
}
"#;

/// GEMM with both inputs staged through the image cache path. Panels are
/// packed K-major into float4 texels by the prep kernels.
const GEMM_IMAGE_SRC: &str = r#"
__attribute__((reqd_work_group_size(%WGY, %WGX, 1)))
__kernel void gemmImage(
    uint M, uint N, uint K,
    const %TYPE alpha, const %TYPE beta,
    read_only image2d_t imgA,
    read_only image2d_t imgB,
    __global %TYPE *C, uint ldc,
    uint offC)
{
    const sampler_t smp = CLK_NORMALIZED_COORDS_FALSE | CLK_ADDRESS_CLAMP | CLK_FILTER_NEAREST;
    C += offC;

    const uint row0 = (get_group_id(0) * %WGY + get_local_id(0)) * %ITY;
    const uint col0 = (get_group_id(1) * %WGX + get_local_id(1)) * %ITX;
    const uint ktex = (K + %TEXEL - 1) / %TEXEL;

    %TYPE acc[%ITY][%ITX];
    for (uint i = 0; i < %ITY; ++i) {
        for (uint j = 0; j < %ITX; ++j) {
            acc[i][j] = %INIT(0.0);
        }
    }

    union { float4 q; %TYPE e[%TEXEL]; } ua, ub;
    for (uint kt = 0; kt < ktex; ++kt) {
        for (uint i = 0; i < %ITY; ++i) {
            ua.q = read_imagef(imgA, smp, (int2)(kt, row0 + i));
            for (uint j = 0; j < %ITX; ++j) {
                ub.q = read_imagef(imgB, smp, (int2)(kt, col0 + j));
                for (uint t = 0; t < %TEXEL; ++t) {
                    %MAD(acc[i][j], ua.e[t], ub.e[t]);
                }
            }
        }
    }

    for (uint i = 0; i < %ITY; ++i) {
        const uint row = row0 + i;
        for (uint j = 0; j < %ITX; ++j) {
            const uint col = col0 + j;
            if (row < M && col < N) {
                %TYPE v = %INIT(0.0);
                %MUL(v, alpha, acc[i][j]);
%IF(%NOTBETAZERO)               { %TYPE cv = C[IDXC(row, col)]; %MAD(v, beta, cv); }
                C[IDXC(row, col)] = v;
            }
        }
    }
}
"#;

/// Packs one input panel into a float4 image, K-major per row, zero
/// padding past the panel edge.
const GEMM_PREP_SRC: &str = r#"
__kernel void gemmPrep%PREPROLE(
    __global const %TYPE *restrict src, uint ld, uint off,
    write_only image2d_t dst,
    uint texWidth, uint rows, uint cols)
{
    src += off;
    const uint gid = get_global_id(0);
    const uint row = gid / texWidth;
    const uint tex = gid % texWidth;
    if (row >= rows) {
        return;
    }

    union { float4 q; %TYPE e[%TEXEL]; } u;
    for (uint t = 0; t < %TEXEL; ++t) {
        const uint col = tex * %TEXEL + t;
        %TYPE v = %INIT(0.0);
        if (col < cols) {
%IF(%NOTRANS)            v = src[(size_t)row * ld + col];
%IF(%TRANS)            v = src[(size_t)col * ld + row];
        }
        %CONJUGATE(%DOCONJ, v);
        u.e[t] = v;
    }
    write_imagef(dst, (int2)(tex, row), u.q);
}
"#;

fn texel_elems(dtype: DataType) -> usize {
    (16 / dtype.size()).max(1)
}

fn bind_gemm_buffer_args(
    kernel: &KernelCore,
    args: &ProblemArgs,
    extra: &KernelExtra,
) -> Result<()> {
    bind_uint(kernel, 0, args.m)?;
    bind_uint(kernel, 1, args.n)?;
    bind_uint(kernel, 2, args.k)?;
    bind_multiplier(kernel, 3, extra.dtype, args.alpha)?;
    bind_multiplier(kernel, 4, extra.dtype, args.beta)?;
    bind_mem(kernel, 5, &args.a, "A")?;
    bind_uint(kernel, 6, args.lda)?;
    bind_mem(kernel, 7, &args.b, "B")?;
    bind_uint(kernel, 8, args.ldb)?;
    bind_mem(kernel, 9, &args.c, "C")?;
    bind_uint(kernel, 10, args.ldc)?;
    bind_uint(kernel, 11, args.off_a)?;
    bind_uint(kernel, 12, args.off_bx)?;
    bind_uint(kernel, 13, args.off_cy)?;
    Ok(())
}

struct BufferGemm;

impl SolverOps for BufferGemm {
    fn flags(&self) -> SolverFlags {
        SolverFlags::WSPACE_2D | SolverFlags::TOP_INPUT_SQUARE_BLOCKS
    }

    fn pattern_perf(&self, _flags: KernelExtraFlags, args: &ProblemArgs) -> Option<i32> {
        // The LDS path pays off when the whole problem tiles evenly.
        let aligned = args.m % 64 == 0 && args.n % 64 == 0 && args.k % 64 == 0;
        Some(if aligned { 100 } else { 10 })
    }

    fn is_fit_to_lds(
        &self,
        dims: &[SubproblemDim],
        dtype: DataType,
        lds_budget: u64,
        _args: &ProblemArgs,
    ) -> Option<bool> {
        Some(panels_fit_lds(dims, dtype, lds_budget))
    }

    fn gen_kernel(
        &self,
        dims: &[SubproblemDim],
        pgran: &PGranularity,
        extra: &KernelExtra,
    ) -> Result<String> {
        let gen = make_generator(dims, pgran, extra)?;
        gen.expand(&format!("{}{}", INDEX_PRELUDE, GEMM_BUFFER_SRC))
    }

    fn kernel_name(&self, _extra: &KernelExtra) -> &'static str {
        "gemmBuffer"
    }

    fn assign_kargs(
        &self,
        kernel: &KernelCore,
        args: &ProblemArgs,
        extra: &KernelExtra,
    ) -> Result<()> {
        bind_gemm_buffer_args(kernel, args, extra)
    }
}

struct CachedGemm;

impl SolverOps for CachedGemm {
    fn flags(&self) -> SolverFlags {
        SolverFlags::WSPACE_2D
    }

    fn pattern_perf(&self, _flags: KernelExtraFlags, _args: &ProblemArgs) -> Option<i32> {
        Some(50)
    }

    fn gen_kernel(
        &self,
        dims: &[SubproblemDim],
        pgran: &PGranularity,
        extra: &KernelExtra,
    ) -> Result<String> {
        let gen = make_generator(dims, pgran, extra)?;
        gen.expand(&format!("{}{}", INDEX_PRELUDE, GEMM_CACHED_SRC))
    }

    fn kernel_name(&self, _extra: &KernelExtra) -> &'static str {
        "gemmCached"
    }

    fn assign_kargs(
        &self,
        kernel: &KernelCore,
        args: &ProblemArgs,
        extra: &KernelExtra,
    ) -> Result<()> {
        bind_gemm_buffer_args(kernel, args, extra)
    }

    fn inner_decomposition_axis(&self, args: &ProblemArgs) -> Option<DecompAxis> {
        // Work groups walk the output along the contiguous axis.
        Some(if args.order == Order::RowMajor {
            DecompAxis::X
        } else {
            DecompAxis::Y
        })
    }
}

struct ImageGemm;

impl SolverOps for ImageGemm {
    fn flags(&self) -> SolverFlags {
        SolverFlags::WSPACE_2D
    }

    fn pattern_perf(&self, flags: KernelExtraFlags, _args: &ProblemArgs) -> Option<i32> {
        // Packed panels cannot express sub-tile tails; the image path is
        // kept for explicitly forced configurations.
        if flags.intersects(KernelExtraFlags::tails()) {
            Some(-1)
        } else {
            Some(5)
        }
    }

    fn gen_kernel(
        &self,
        dims: &[SubproblemDim],
        pgran: &PGranularity,
        extra: &KernelExtra,
    ) -> Result<String> {
        let mut gen = make_generator(dims, pgran, extra)?;
        gen.put("%TEXEL", texel_elems(extra.dtype).to_string());
        match extra.kern_type {
            KernelType::Compute => gen.expand(&format!("{}{}", INDEX_PRELUDE, GEMM_IMAGE_SRC)),
            KernelType::PrepA => {
                gen.put("%PREPROLE", "A");
                gen.put(
                    "%NOTRANS",
                    if extra.flags.contains(KernelExtraFlags::TRANS_A) { "0" } else { "1" },
                );
                gen.put(
                    "%TRANS",
                    if extra.flags.contains(KernelExtraFlags::TRANS_A) { "1" } else { "0" },
                );
                gen.put(
                    "%DOCONJ",
                    if extra.flags.contains(KernelExtraFlags::CONJ_A) { "1" } else { "0" },
                );
                gen.expand(GEMM_PREP_SRC)
            }
            KernelType::PrepB => {
                gen.put("%PREPROLE", "B");
                // B panels pack column-major so image rows follow N.
                gen.put(
                    "%NOTRANS",
                    if extra.flags.contains(KernelExtraFlags::TRANS_B) { "1" } else { "0" },
                );
                gen.put(
                    "%TRANS",
                    if extra.flags.contains(KernelExtraFlags::TRANS_B) { "0" } else { "1" },
                );
                gen.put(
                    "%DOCONJ",
                    if extra.flags.contains(KernelExtraFlags::CONJ_B) { "1" } else { "0" },
                );
                gen.expand(GEMM_PREP_SRC)
            }
        }
    }

    fn kernel_name(&self, extra: &KernelExtra) -> &'static str {
        match extra.kern_type {
            KernelType::Compute => "gemmImage",
            KernelType::PrepA => "gemmPrepA",
            KernelType::PrepB => "gemmPrepB",
        }
    }

    fn assign_kargs(
        &self,
        kernel: &KernelCore,
        args: &ProblemArgs,
        extra: &KernelExtra,
    ) -> Result<()> {
        let texel = texel_elems(extra.dtype);
        match extra.kern_type {
            KernelType::Compute => {
                bind_uint(kernel, 0, args.m)?;
                bind_uint(kernel, 1, args.n)?;
                bind_uint(kernel, 2, args.k)?;
                bind_multiplier(kernel, 3, extra.dtype, args.alpha)?;
                bind_multiplier(kernel, 4, extra.dtype, args.beta)?;
                bind_mem(kernel, 5, &args.scimage[0], "scratch image A")?;
                bind_mem(kernel, 6, &args.scimage[1], "scratch image B")?;
                bind_mem(kernel, 7, &args.c, "C")?;
                bind_uint(kernel, 8, args.ldc)?;
                bind_uint(kernel, 9, args.off_cy)?;
            }
            KernelType::PrepA => {
                bind_mem(kernel, 0, &args.a, "A")?;
                bind_uint(kernel, 1, args.lda)?;
                bind_uint(kernel, 2, args.off_a)?;
                bind_mem(kernel, 3, &args.scimage[0], "scratch image A")?;
                bind_uint(kernel, 4, util::div_round_up(args.k, texel))?;
                bind_uint(kernel, 5, args.m)?;
                bind_uint(kernel, 6, args.k)?;
            }
            KernelType::PrepB => {
                bind_mem(kernel, 0, &args.b, "B")?;
                bind_uint(kernel, 1, args.ldb)?;
                bind_uint(kernel, 2, args.off_bx)?;
                bind_mem(kernel, 3, &args.scimage[1], "scratch image B")?;
                bind_uint(kernel, 4, util::div_round_up(args.k, texel))?;
                bind_uint(kernel, 5, args.n)?;
                bind_uint(kernel, 6, args.k)?;
            }
        }
        Ok(())
    }

    fn calc_threads(
        &self,
        dims: &[SubproblemDim],
        pgran: &PGranularity,
        args: &ProblemArgs,
        extra: &KernelExtra,
    ) -> Option<[usize; 2]> {
        let texel = texel_elems(extra.dtype);
        let tex_width = util::div_round_up(args.k, texel);
        match extra.kern_type {
            KernelType::Compute => {
                let d = dims[0];
                let gy = util::div_round_up(args.m, d.y) * pgran.wg_size[0] as usize;
                let gx = util::div_round_up(args.n, d.x) * pgran.wg_size[1] as usize;
                Some([gy, gx])
            }
            KernelType::PrepA => {
                Some([util::round_up(args.m * tex_width, 64), 1])
            }
            KernelType::PrepB => {
                Some([util::round_up(args.n * tex_width, 64), 1])
            }
        }
    }

    fn img_pack_mode(
        &self,
        _extra: &KernelExtra,
        _dims: &[SubproblemDim],
        _role: MatrixRole,
    ) -> Option<(u32, Order)> {
        // Panels pack one matrix row per image row.
        Some((1, Order::RowMajor))
    }
}

static BUFFER_GEMM: BufferGemm = BufferGemm;
static IMAGE_GEMM: ImageGemm = ImageGemm;
static CACHED_GEMM: CachedGemm = CachedGemm;

pub fn register() -> Vec<MemoryPattern> {
    vec![
        MemoryPattern {
            name: "BufferGemm",
            nr_levels: 2,
            cu_level: 0,
            th_level: 1,
            extra: MpatExtra {
                a_mset: MemLevel::LDS,
                b_mset: MemLevel::LDS,
            },
            sops: &BUFFER_GEMM,
        },
        MemoryPattern {
            name: "ImageGemm",
            nr_levels: 2,
            cu_level: 0,
            th_level: 1,
            extra: MpatExtra {
                a_mset: MemLevel::IMAGE,
                b_mset: MemLevel::IMAGE,
            },
            sops: &IMAGE_GEMM,
        },
        MemoryPattern {
            name: "CachedGemm",
            nr_levels: 2,
            cu_level: 0,
            th_level: 1,
            extra: MpatExtra {
                a_mset: MemLevel::L1,
                b_mset: MemLevel::L2,
            },
            sops: &CACHED_GEMM,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::KernelExtra;
    use crate::types::DataType;

    fn sample_dims() -> ([SubproblemDim; 2], PGranularity) {
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
            wg_dim: 2,
            wg_size: [8, 8],
            wf_size: 64,
            max_work_group_size: 256,
        };
        ([cu, th], pg)
    }

    #[test]
    fn buffer_kernel_expands_fully() {
        let (dims, pg) = sample_dims();
        for &dtype in &[DataType::F32, DataType::C32] {
            let extra = KernelExtra::new(dtype);
            let src = BUFFER_GEMM.gen_kernel(&dims, &pg, &extra).unwrap();
            assert!(src.contains("__kernel void gemmBuffer"));
            assert!(src.contains("barrier(CLK_LOCAL_MEM_FENCE)"));
            assert!(!src.contains("%Y0"));
            assert!(!src.contains("%MAD"));
            assert!(!src.contains("%TYPE"));
        }
    }

    #[test]
    fn image_pattern_emits_prep_kernels() {
        let (dims, pg) = sample_dims();
        let mut extra = KernelExtra::new(DataType::F32);
        extra.kern_type = crate::flags::KernelType::PrepA;
        let src = IMAGE_GEMM.gen_kernel(&dims, &pg, &extra).unwrap();
        assert!(src.contains("__kernel void gemmPrepA"));
        assert!(src.contains("write_imagef"));
    }

    #[test]
    fn lds_fit_rejects_oversized_tiles() {
        let (mut dims, _) = sample_dims();
        let args = ProblemArgs::new(DataType::F32);
        assert_eq!(
            BUFFER_GEMM.is_fit_to_lds(&dims, DataType::F32, 32 * 1024, &args),
            Some(true)
        );
        dims[0].y = 1024;
        dims[0].x = 1024;
        assert_eq!(
            BUFFER_GEMM.is_fit_to_lds(&dims, DataType::F32, 32 * 1024, &args),
            Some(false)
        );
    }
}
