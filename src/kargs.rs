//! The internal argument bundle a BLAS call is marshalled into, and the
//! conversions between kernel arguments and problem-space dimensions used
//! by the decomposer.

use ocl::core::Mem;

use crate::dims::SubproblemDim;
use crate::types::{BlasFunction, DataType, Diag, Multiplier, Order, Side, Transpose, Uplo};

/// Problem arguments as seen by the solver pipeline.
///
/// Constructed per user call; mutated only by the decomposer and by a
/// pattern's `fixup_args`. For level-2 routines `ldb` and `ldc` carry the
/// vector increments (`incx`, `incy`).
#[derive(Clone, Debug)]
pub struct ProblemArgs {
    pub dtype: DataType,
    pub order: Order,
    pub side: Side,
    pub uplo: Uplo,
    pub trans_a: Transpose,
    pub trans_b: Transpose,
    pub diag: Diag,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub alpha: Multiplier,
    pub beta: Multiplier,
    pub a: Option<Mem>,
    pub b: Option<Mem>,
    pub c: Option<Mem>,
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
    pub off_a: usize,
    pub off_bx: usize,
    pub off_cy: usize,
    pub offset_m: usize,
    pub offset_n: usize,
    pub scimage: [Option<Mem>; 2],
    pub addr_bits: u32,
}

impl ProblemArgs {
    pub fn new(dtype: DataType) -> ProblemArgs {
        ProblemArgs {
            dtype,
            order: Order::RowMajor,
            side: Side::Left,
            uplo: Uplo::Lower,
            trans_a: Transpose::None,
            trans_b: Transpose::None,
            diag: Diag::NonUnit,
            m: 0,
            n: 0,
            k: 0,
            alpha: Multiplier::one(),
            beta: Multiplier::default(),
            a: None,
            b: None,
            c: None,
            lda: 0,
            ldb: 0,
            ldc: 0,
            off_a: 0,
            off_bx: 0,
            off_cy: 0,
            offset_m: 0,
            offset_n: 0,
            scimage: [None, None],
            addr_bits: 32,
        }
    }
}

/// Transforms kernel arguments into a problem-space dimension.
///
/// With `offsets` set, the starting offsets are converted instead of the
/// sizes (the `bwidth` field is zero in that mode since offsets have no
/// K component of their own).
pub fn kargs_to_prob_dims(
    func: BlasFunction,
    args: &ProblemArgs,
    offsets: bool,
) -> SubproblemDim {
    let mut dim = SubproblemDim::default();
    if offsets {
        dim.y = args.offset_m;
        dim.x = args.offset_n;
    } else {
        dim.y = args.m;
        dim.x = args.n;
        dim.bwidth = if func.blas_level() == 2 { args.n } else { args.k };
    }
    dim
}

/// Transforms a problem-space dimension back into kernel arguments.
///
/// In offset mode only `offset_m`/`offset_n` are touched.
pub fn prob_dims_to_kargs(
    args: &mut ProblemArgs,
    func: BlasFunction,
    dim: &SubproblemDim,
    offsets: bool,
) {
    if offsets {
        args.offset_m = dim.y;
        args.offset_n = dim.x;
    } else {
        args.m = dim.y;
        args.n = dim.x;
        if func.blas_level() == 3 {
            args.k = dim.bwidth;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prob_dims_round_trip() {
        let mut args = ProblemArgs::new(DataType::F32);
        args.m = 100;
        args.n = 200;
        args.k = 300;
        args.offset_m = 10;
        args.offset_n = 20;

        let size = kargs_to_prob_dims(BlasFunction::Gemm, &args, false);
        assert_eq!((size.y, size.x, size.bwidth), (100, 200, 300));
        let off = kargs_to_prob_dims(BlasFunction::Gemm, &args, true);
        assert_eq!((off.y, off.x), (10, 20));

        let mut args2 = ProblemArgs::new(DataType::F32);
        prob_dims_to_kargs(&mut args2, BlasFunction::Gemm, &size, false);
        prob_dims_to_kargs(&mut args2, BlasFunction::Gemm, &off, true);
        assert_eq!((args2.m, args2.n, args2.k), (100, 200, 300));
        assert_eq!((args2.offset_m, args2.offset_n), (10, 20));
    }

    #[test]
    fn level2_bwidth_tracks_n() {
        let mut args = ProblemArgs::new(DataType::F32);
        args.m = 64;
        args.n = 48;
        let size = kargs_to_prob_dims(BlasFunction::Gemv, &args, false);
        assert_eq!(size.bwidth, 48);
    }
}
