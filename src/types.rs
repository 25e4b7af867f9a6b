//! Problem classification types shared by the whole pipeline: the BLAS
//! function families the solver knows about, element data types, and the
//! usual order/side/uplo/transpose argument enums.

use std::fmt;

/// BLAS functions covered by the kernel solution pipeline.
///
/// The discriminants double as record indices in the persistent store, so
/// the order is part of the on-disk format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlasFunction {
    Gemm,
    Trmm,
    Trsm,
    Gemv,
    Symv,
    Syrk,
    Syr2k,
}

/// Total number of function families.
pub const BLAS_FUNCTIONS_NUMBER: usize = 7;

impl BlasFunction {
    pub fn all() -> [BlasFunction; BLAS_FUNCTIONS_NUMBER] {
        use self::BlasFunction::*;
        [Gemm, Trmm, Trsm, Gemv, Symv, Syrk, Syr2k]
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(idx: usize) -> Option<BlasFunction> {
        Self::all().get(idx).copied()
    }

    /// BLAS level: 2 for matrix-vector, 3 for matrix-matrix routines.
    pub fn blas_level(self) -> u32 {
        match self {
            BlasFunction::Gemv | BlasFunction::Symv => 2,
            _ => 3,
        }
    }

    /// Whether the routine's `A` operand is a triangular matrix.
    pub fn has_triangular_matrix(self) -> bool {
        matches!(self, BlasFunction::Trmm | BlasFunction::Trsm)
    }

    /// Whether the routine consumes a second input matrix with its own
    /// transposition argument.
    pub fn uses_trans_b(self) -> bool {
        matches!(self, BlasFunction::Gemm)
    }

    pub fn name(self) -> &'static str {
        match self {
            BlasFunction::Gemm => "GEMM",
            BlasFunction::Trmm => "TRMM",
            BlasFunction::Trsm => "TRSM",
            BlasFunction::Gemv => "GEMV",
            BlasFunction::Symv => "SYMV",
            BlasFunction::Syrk => "SYRK",
            BlasFunction::Syr2k => "SYR2K",
        }
    }
}

impl fmt::Display for BlasFunction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Element type of a BLAS problem.
///
/// The discriminants are persisted in the tuning store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    F64,
    C32,
    C64,
}

/// Total number of element types.
pub const TYPE_NUMBER: usize = 4;

impl DataType {
    pub fn all() -> [DataType; TYPE_NUMBER] {
        [DataType::F32, DataType::F64, DataType::C32, DataType::C64]
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(idx: usize) -> Option<DataType> {
        Self::all().get(idx).copied()
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F64 | DataType::C32 => 8,
            DataType::C64 => 16,
        }
    }

    pub fn is_complex(self) -> bool {
        matches!(self, DataType::C32 | DataType::C64)
    }

    pub fn is_double_based(self) -> bool {
        matches!(self, DataType::F64 | DataType::C64)
    }

    /// Single-letter routine prefix (`S`, `D`, `C`, `Z`).
    pub fn prefix(self) -> char {
        match self {
            DataType::F32 => 'S',
            DataType::F64 => 'D',
            DataType::C32 => 'C',
            DataType::C64 => 'Z',
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    RowMajor,
    ColumnMajor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Uplo {
    Upper,
    Lower,
}

impl Uplo {
    pub fn other(self) -> Uplo {
        match self {
            Uplo::Upper => Uplo::Lower,
            Uplo::Lower => Uplo::Upper,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transpose {
    None,
    Trans,
    ConjTrans,
}

impl Transpose {
    pub fn is_trans(self) -> bool {
        !matches!(self, Transpose::None)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Diag {
    NonUnit,
    Unit,
}

/// Roles a matrix can play within one solution step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatrixRole {
    A,
    B,
    C,
}

/// An `alpha`/`beta` scaling factor, stored wide enough for every element
/// type. Real problems keep `im` at zero.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Multiplier {
    pub re: f64,
    pub im: f64,
}

impl Multiplier {
    pub fn real(re: f64) -> Multiplier {
        Multiplier { re, im: 0.0 }
    }

    pub fn complex(re: f64, im: f64) -> Multiplier {
        Multiplier { re, im }
    }

    pub fn one() -> Multiplier {
        Multiplier::real(1.0)
    }

    pub fn is_zero(&self) -> bool {
        self.re == 0.0 && self.im == 0.0
    }

    /// Returns `-1 / self`, using the complex reciprocal when the
    /// imaginary part is in play. Zero stays zero.
    pub fn neg_recip(&self) -> Multiplier {
        let sq = self.re * self.re + self.im * self.im;
        if sq == 0.0 {
            *self
        } else {
            Multiplier {
                re: -self.re / sq,
                im: self.im / sq,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_indices_are_stable() {
        for (i, func) in BlasFunction::all().iter().enumerate() {
            assert_eq!(func.index(), i);
            assert_eq!(BlasFunction::from_index(i), Some(*func));
        }
    }

    #[test]
    fn dtype_sizes() {
        assert_eq!(DataType::F32.size(), 4);
        assert_eq!(DataType::F64.size(), 8);
        assert_eq!(DataType::C32.size(), 8);
        assert_eq!(DataType::C64.size(), 16);
    }

    #[test]
    fn neg_recip_matches_complex_algebra() {
        let a = Multiplier::real(2.0);
        assert_eq!(a.neg_recip(), Multiplier::real(-0.5));

        // -1/(i) = i
        let i = Multiplier::complex(0.0, 1.0);
        let r = i.neg_recip();
        assert!((r.re - 0.0).abs() < 1e-12 && (r.im - 1.0).abs() < 1e-12);

        assert!(Multiplier::default().neg_recip().is_zero());
    }
}
