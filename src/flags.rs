//! Kernel extra flags: the booleans that modify a generated kernel, plus
//! the conversions between problem arguments and flag sets.

use bitflags::bitflags;

use crate::kargs::ProblemArgs;
use crate::types::{BlasFunction, DataType, Diag, Order, Side, Transpose, Uplo};

bitflags! {
    /// Properties of an operation that select a kernel variant.
    pub struct KernelExtraFlags: u32 {
        const TRANS_A               = 1 << 0;
        const TRANS_B               = 1 << 1;
        const CONJ_A                = 1 << 2;
        const CONJ_B                = 1 << 3;
        const COL_MAJOR             = 1 << 4;
        const UPPER_TRI             = 1 << 5;
        const SIDE_RIGHT            = 1 << 6;
        const UNIT_DIAG             = 1 << 7;
        const BETA_ZERO             = 1 << 8;
        const TAILS_M               = 1 << 9;
        const TAILS_N               = 1 << 10;
        const TAILS_K               = 1 << 11;
        const TAILS_M_LOWER         = 1 << 12;
        const TAILS_N_LOWER         = 1 << 13;
        const TAILS_K_LOWER         = 1 << 14;
        const NO_COPY_VEC_A         = 1 << 15;
        const NO_COPY_VEC_B         = 1 << 16;
        const NO_COPY_VEC_C         = 1 << 17;
        const INCX_ONE              = 1 << 18;
        const INCY_ONE              = 1 << 19;
        const STARTM_NOT_ZERO       = 1 << 20;
        const STARTN_NOT_ZERO       = 1 << 21;
        const A_OFF_NOT_ZERO        = 1 << 22;
        const BX_OFF_NOT_ZERO       = 1 << 23;
        const CY_OFF_NOT_ZERO       = 1 << 24;
        const VENDOR_AMD            = 1 << 25;
        const ENABLE_MAD            = 1 << 26;
        const SYRK_2K_RANK          = 1 << 27;
        const SYRK_SEPARATE_DIAGONAL = 1 << 28;
        const SYRK_EVALUATE_DIAGONAL = 1 << 29;
    }
}

impl KernelExtraFlags {
    /// All tail bits, upper and lower level.
    pub fn tails() -> KernelExtraFlags {
        KernelExtraFlags::TAILS_M
            | KernelExtraFlags::TAILS_N
            | KernelExtraFlags::TAILS_K
            | KernelExtraFlags::TAILS_M_LOWER
            | KernelExtraFlags::TAILS_N_LOWER
            | KernelExtraFlags::TAILS_K_LOWER
    }
}

/// Kind of kernel within one solution step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelType {
    Compute,
    PrepA,
    PrepB,
}

impl KernelType {
    pub fn all() -> [KernelType; 3] {
        [KernelType::Compute, KernelType::PrepA, KernelType::PrepB]
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Everything that identifies a compiled kernel variant besides its tile
/// key: element type, flags, vectorization widths and build options.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelExtra {
    pub dtype: DataType,
    pub flags: KernelExtraFlags,
    pub vec_len: u32,
    pub vec_len_a: u32,
    pub vec_len_b: u32,
    pub vec_len_c: u32,
    pub kern_type: KernelType,
    pub build_options: String,
}

impl KernelExtra {
    pub fn new(dtype: DataType) -> KernelExtra {
        KernelExtra {
            dtype,
            flags: KernelExtraFlags::empty(),
            vec_len: 1,
            vec_len_a: 0,
            vec_len_b: 0,
            vec_len_c: 0,
            kern_type: KernelType::Compute,
            build_options: String::new(),
        }
    }
}

/// Derives the flag set describing `args` for the given function.
pub fn flags_from_args(args: &ProblemArgs, func: BlasFunction) -> KernelExtraFlags {
    let mut flags = KernelExtraFlags::empty();

    if args.trans_a.is_trans() {
        flags |= KernelExtraFlags::TRANS_A;
    }
    if func.uses_trans_b() && args.trans_b.is_trans() {
        flags |= KernelExtraFlags::TRANS_B;
    }

    // Conjugation only exists for complex problems, and only together with
    // a transposition.
    if args.dtype.is_complex() {
        if args.trans_a == Transpose::ConjTrans {
            flags |= KernelExtraFlags::CONJ_A;
        }
        if func.uses_trans_b() && args.trans_b == Transpose::ConjTrans {
            flags |= KernelExtraFlags::CONJ_B;
        }
    }

    if args.order == Order::ColumnMajor {
        flags |= KernelExtraFlags::COL_MAJOR;
    }

    if !matches!(func, BlasFunction::Trmm | BlasFunction::Trsm) && args.beta.is_zero() {
        flags |= KernelExtraFlags::BETA_ZERO;
    }

    if func != BlasFunction::Gemm {
        if args.uplo == Uplo::Upper {
            flags |= KernelExtraFlags::UPPER_TRI;
        }
        if args.side == Side::Right {
            flags |= KernelExtraFlags::SIDE_RIGHT;
        }
        if args.diag == Diag::Unit {
            flags |= KernelExtraFlags::UNIT_DIAG;
        }
    }

    if func.blas_level() == 2 {
        if args.ldb == 1 {
            flags |= KernelExtraFlags::INCX_ONE;
        }
        if args.ldc == 1 {
            flags |= KernelExtraFlags::INCY_ONE;
        }
    }

    flags
}

/// Applies a flag set back onto an argument bundle, producing the
/// canonical form of the arguments the flags were encoded from.
///
/// Beta, increments and offsets are not recoverable beyond their
/// zero/nonzero character, so those fields are normalized to the
/// representative values (`beta = 0`, `inc = 1`).
pub fn flags_to_args(args: &mut ProblemArgs, flags: KernelExtraFlags, func: BlasFunction) {
    args.trans_a = if flags.contains(KernelExtraFlags::CONJ_A) {
        Transpose::ConjTrans
    } else if flags.contains(KernelExtraFlags::TRANS_A) {
        Transpose::Trans
    } else {
        Transpose::None
    };

    args.trans_b = if flags.contains(KernelExtraFlags::CONJ_B) {
        Transpose::ConjTrans
    } else if flags.contains(KernelExtraFlags::TRANS_B) {
        Transpose::Trans
    } else {
        Transpose::None
    };

    args.order = if flags.contains(KernelExtraFlags::COL_MAJOR) {
        Order::ColumnMajor
    } else {
        Order::RowMajor
    };
    args.uplo = if flags.contains(KernelExtraFlags::UPPER_TRI) {
        Uplo::Upper
    } else {
        Uplo::Lower
    };
    args.side = if flags.contains(KernelExtraFlags::SIDE_RIGHT) {
        Side::Right
    } else {
        Side::Left
    };
    args.diag = if flags.contains(KernelExtraFlags::UNIT_DIAG) {
        Diag::Unit
    } else {
        Diag::NonUnit
    };

    if flags.contains(KernelExtraFlags::BETA_ZERO) {
        args.beta = Default::default();
    }
    if func.blas_level() == 2 {
        if flags.contains(KernelExtraFlags::INCX_ONE) {
            args.ldb = 1;
        }
        if flags.contains(KernelExtraFlags::INCY_ONE) {
            args.ldc = 1;
        }
    }
}

/// Canonicalizes an argument bundle the way flag encoding sees it:
/// conjugation is stripped for non-complex element types.
pub fn canonicalize_args(args: &mut ProblemArgs) {
    if !args.dtype.is_complex() {
        if args.trans_a == Transpose::ConjTrans {
            args.trans_a = Transpose::Trans;
        }
        if args.trans_b == Transpose::ConjTrans {
            args.trans_b = Transpose::Trans;
        }
    }
}

/// Flag-set validity check used when enumerating tunable kernel variants:
/// conjugation requires a complex type and the matching transposition.
pub fn is_valid_flag_combination(dtype: DataType, flags: KernelExtraFlags) -> bool {
    if !dtype.is_complex()
        && flags.intersects(KernelExtraFlags::CONJ_A | KernelExtraFlags::CONJ_B)
    {
        return false;
    }
    if flags.contains(KernelExtraFlags::CONJ_A) && !flags.contains(KernelExtraFlags::TRANS_A) {
        return false;
    }
    if flags.contains(KernelExtraFlags::CONJ_B) && !flags.contains(KernelExtraFlags::TRANS_B) {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, Multiplier};

    fn sample_args(dtype: DataType) -> ProblemArgs {
        let mut args = ProblemArgs::new(dtype);
        args.m = 64;
        args.n = 64;
        args.k = 64;
        args
    }

    #[test]
    fn encode_decode_round_trips() {
        for &dtype in DataType::all().iter() {
            for &func in BlasFunction::all().iter() {
                for &trans in
                    [Transpose::None, Transpose::Trans, Transpose::ConjTrans].iter()
                {
                    for &order in [Order::RowMajor, Order::ColumnMajor].iter() {
                        let mut args = sample_args(dtype);
                        args.trans_a = trans;
                        args.order = order;
                        args.uplo = Uplo::Upper;
                        args.beta = Default::default();

                        let flags = flags_from_args(&args, func);
                        let mut decoded = sample_args(dtype);
                        decoded.uplo = Uplo::Upper;
                        flags_to_args(&mut decoded, flags, func);

                        let mut canonical = args.clone();
                        canonicalize_args(&mut canonical);
                        assert_eq!(decoded.trans_a, canonical.trans_a,
                            "{:?} {:?} {:?} {:?}", dtype, func, trans, order);
                        assert_eq!(decoded.order, canonical.order);
                        assert_eq!(
                            flags_from_args(&decoded, func),
                            flags,
                            "re-encoding must be stable"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn beta_zero_is_not_set_for_triangular_updates() {
        let mut args = sample_args(DataType::F32);
        args.beta = Default::default();
        assert!(flags_from_args(&args, BlasFunction::Gemm)
            .contains(KernelExtraFlags::BETA_ZERO));
        assert!(!flags_from_args(&args, BlasFunction::Trsm)
            .contains(KernelExtraFlags::BETA_ZERO));
    }

    #[test]
    fn conj_requires_complex_and_trans() {
        assert!(!is_valid_flag_combination(
            DataType::F32,
            KernelExtraFlags::CONJ_A | KernelExtraFlags::TRANS_A
        ));
        assert!(!is_valid_flag_combination(
            DataType::C32,
            KernelExtraFlags::CONJ_A
        ));
        assert!(is_valid_flag_combination(
            DataType::C32,
            KernelExtraFlags::CONJ_A | KernelExtraFlags::TRANS_A
        ));
    }

    #[test]
    fn uplo_side_diag_skipped_for_gemm() {
        let mut args = sample_args(DataType::F32);
        args.uplo = Uplo::Upper;
        args.side = Side::Right;
        args.diag = Diag::Unit;
        args.beta = Multiplier::one();
        let flags = flags_from_args(&args, BlasFunction::Gemm);
        assert!(!flags.intersects(
            KernelExtraFlags::UPPER_TRI
                | KernelExtraFlags::SIDE_RIGHT
                | KernelExtraFlags::UNIT_DIAG
        ));
    }
}
