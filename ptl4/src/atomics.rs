//! Atomic operation tables and appliers.
//!
//! Validity of an operation over a data type follows the operand table:
//! floating point is excluded from bitwise and masked ops, complex types
//! only admit the ops well-defined on that algebra, and the conditional
//! swaps carry a typed operand. Application happens under the matched
//! list entry's lock, so concurrent target-side updates of one region
//! are serialised at word granularity.

use crate::error::{Error, Result};

/// Atomic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AtomOp {
    Min = 0,
    Max = 1,
    Sum = 2,
    Prod = 3,
    Lor = 4,
    Land = 5,
    Bor = 6,
    Band = 7,
    Lxor = 8,
    Bxor = 9,
    Swap = 10,
    Cswap = 11,
    CswapNe = 12,
    CswapLe = 13,
    CswapLt = 14,
    CswapGe = 15,
    CswapGt = 16,
    Mswap = 17,
}

impl AtomOp {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(AtomOp::Min),
            1 => Some(AtomOp::Max),
            2 => Some(AtomOp::Sum),
            3 => Some(AtomOp::Prod),
            4 => Some(AtomOp::Lor),
            5 => Some(AtomOp::Land),
            6 => Some(AtomOp::Bor),
            7 => Some(AtomOp::Band),
            8 => Some(AtomOp::Lxor),
            9 => Some(AtomOp::Bxor),
            10 => Some(AtomOp::Swap),
            11 => Some(AtomOp::Cswap),
            12 => Some(AtomOp::CswapNe),
            13 => Some(AtomOp::CswapLe),
            14 => Some(AtomOp::CswapLt),
            15 => Some(AtomOp::CswapGe),
            16 => Some(AtomOp::CswapGt),
            17 => Some(AtomOp::Mswap),
            _ => None,
        }
    }
}

/// Atomic data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AtomType {
    I8 = 0,
    U8 = 1,
    I16 = 2,
    U16 = 3,
    I32 = 4,
    U32 = 5,
    I64 = 6,
    U64 = 7,
    Float = 8,
    FloatComplex = 9,
    Double = 10,
    DoubleComplex = 11,
}

impl AtomType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(AtomType::I8),
            1 => Some(AtomType::U8),
            2 => Some(AtomType::I16),
            3 => Some(AtomType::U16),
            4 => Some(AtomType::I32),
            5 => Some(AtomType::U32),
            6 => Some(AtomType::I64),
            7 => Some(AtomType::U64),
            8 => Some(AtomType::Float),
            9 => Some(AtomType::FloatComplex),
            10 => Some(AtomType::Double),
            11 => Some(AtomType::DoubleComplex),
            _ => None,
        }
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            AtomType::I8 | AtomType::U8 => 1,
            AtomType::I16 | AtomType::U16 => 2,
            AtomType::I32 | AtomType::U32 | AtomType::Float => 4,
            AtomType::I64 | AtomType::U64 | AtomType::Double | AtomType::FloatComplex => 8,
            AtomType::DoubleComplex => 16,
        }
    }

    fn is_float(self) -> bool {
        matches!(self, AtomType::Float | AtomType::Double)
    }

    fn is_complex(self) -> bool {
        matches!(self, AtomType::FloatComplex | AtomType::DoubleComplex)
    }
}

/// Per-op validity and operand requirements.
#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    pub float_ok: bool,
    pub complex_ok: bool,
    pub atomic_ok: bool,
    pub swap_ok: bool,
    pub use_operand: bool,
}

/// The operand table.
pub fn op_info(op: AtomOp) -> OpInfo {
    let f = |float_ok, complex_ok, atomic_ok, swap_ok, use_operand| OpInfo {
        float_ok,
        complex_ok,
        atomic_ok,
        swap_ok,
        use_operand,
    };
    match op {
        AtomOp::Min => f(true, false, true, false, false),
        AtomOp::Max => f(true, false, true, false, false),
        AtomOp::Sum => f(true, true, true, false, false),
        AtomOp::Prod => f(true, true, true, false, false),
        AtomOp::Lor => f(false, false, true, false, false),
        AtomOp::Land => f(false, false, true, false, false),
        AtomOp::Bor => f(false, false, true, false, false),
        AtomOp::Band => f(false, false, true, false, false),
        AtomOp::Lxor => f(false, false, true, false, false),
        AtomOp::Bxor => f(false, false, true, false, false),
        AtomOp::Swap => f(true, true, false, true, false),
        AtomOp::Cswap => f(true, true, false, true, true),
        AtomOp::CswapNe => f(true, true, false, true, true),
        AtomOp::CswapLe => f(true, false, false, true, true),
        AtomOp::CswapLt => f(true, false, false, true, true),
        AtomOp::CswapGe => f(true, false, false, true, true),
        AtomOp::CswapGt => f(true, false, false, true, true),
        AtomOp::Mswap => f(false, false, false, true, true),
    }
}

/// Validate op/type for a one-way atomic (no fetch).
pub fn check_atomic(op: AtomOp, ty: AtomType) -> Result<()> {
    let info = op_info(op);
    if !info.atomic_ok {
        return Err(Error::ArgInvalid);
    }
    check_type(op, ty)
}

/// Validate op/type for a swap-class operation; `length` is the full
/// transfer length, bounded to one element when an operand is used.
pub fn check_swap(op: AtomOp, ty: AtomType, length: u64) -> Result<()> {
    let info = op_info(op);
    if !info.swap_ok {
        return Err(Error::ArgInvalid);
    }
    check_type(op, ty)?;
    if info.use_operand && length > ty.size() as u64 {
        return Err(Error::ArgInvalid);
    }
    Ok(())
}

fn check_type(op: AtomOp, ty: AtomType) -> Result<()> {
    let info = op_info(op);
    if ty.is_float() && !info.float_ok {
        return Err(Error::ArgInvalid);
    }
    if ty.is_complex() && !info.complex_ok {
        return Err(Error::ArgInvalid);
    }
    Ok(())
}

macro_rules! int_elems {
    ($t:ty, $tgt:expr, $src:expr, $op:expr) => {{
        const S: usize = std::mem::size_of::<$t>();
        for (tc, sc) in $tgt.chunks_exact_mut(S).zip($src.chunks_exact(S)) {
            let a = <$t>::from_ne_bytes(tc.try_into().unwrap());
            let b = <$t>::from_ne_bytes(sc.try_into().unwrap());
            let r: $t = match $op {
                AtomOp::Min => a.min(b),
                AtomOp::Max => a.max(b),
                AtomOp::Sum => a.wrapping_add(b),
                AtomOp::Prod => a.wrapping_mul(b),
                AtomOp::Lor => ((a != 0) || (b != 0)) as u8 as $t,
                AtomOp::Land => ((a != 0) && (b != 0)) as u8 as $t,
                AtomOp::Bor => a | b,
                AtomOp::Band => a & b,
                AtomOp::Lxor => ((a != 0) ^ (b != 0)) as u8 as $t,
                AtomOp::Bxor => a ^ b,
                _ => return Err(Error::ArgInvalid),
            };
            tc.copy_from_slice(&r.to_ne_bytes());
        }
        Ok(())
    }};
}

macro_rules! float_elems {
    ($t:ty, $tgt:expr, $src:expr, $op:expr) => {{
        const S: usize = std::mem::size_of::<$t>();
        for (tc, sc) in $tgt.chunks_exact_mut(S).zip($src.chunks_exact(S)) {
            let a = <$t>::from_ne_bytes(tc.try_into().unwrap());
            let b = <$t>::from_ne_bytes(sc.try_into().unwrap());
            let r: $t = match $op {
                AtomOp::Min => a.min(b),
                AtomOp::Max => a.max(b),
                AtomOp::Sum => a + b,
                AtomOp::Prod => a * b,
                _ => return Err(Error::ArgInvalid),
            };
            tc.copy_from_slice(&r.to_ne_bytes());
        }
        Ok(())
    }};
}

macro_rules! complex_elems {
    ($t:ty, $tgt:expr, $src:expr, $op:expr) => {{
        const S: usize = std::mem::size_of::<$t>();
        for (tc, sc) in $tgt.chunks_exact_mut(2 * S).zip($src.chunks_exact(2 * S)) {
            let ar = <$t>::from_ne_bytes(tc[..S].try_into().unwrap());
            let ai = <$t>::from_ne_bytes(tc[S..].try_into().unwrap());
            let br = <$t>::from_ne_bytes(sc[..S].try_into().unwrap());
            let bi = <$t>::from_ne_bytes(sc[S..].try_into().unwrap());
            let (rr, ri): ($t, $t) = match $op {
                AtomOp::Sum => (ar + br, ai + bi),
                AtomOp::Prod => (ar * br - ai * bi, ar * bi + ai * br),
                _ => return Err(Error::ArgInvalid),
            };
            tc[..S].copy_from_slice(&rr.to_ne_bytes());
            tc[S..].copy_from_slice(&ri.to_ne_bytes());
        }
        Ok(())
    }};
}

macro_rules! cswap_cmp {
    ($t:ty, $tgt:expr, $src:expr, $operand:expr, $op:expr) => {{
        const S: usize = std::mem::size_of::<$t>();
        let a = <$t>::from_ne_bytes($tgt[..S].try_into().unwrap());
        let o = <$t>::from_ne_bytes($operand[..S].try_into().unwrap());
        let do_swap = match $op {
            AtomOp::Cswap => o == a,
            AtomOp::CswapNe => o != a,
            AtomOp::CswapLe => o <= a,
            AtomOp::CswapLt => o < a,
            AtomOp::CswapGe => o >= a,
            AtomOp::CswapGt => o > a,
            _ => return Err(Error::ArgInvalid),
        };
        if do_swap {
            $tgt[..S].copy_from_slice(&$src[..S]);
        }
        Ok(())
    }};
}

macro_rules! mswap_bits {
    ($t:ty, $tgt:expr, $src:expr, $operand:expr) => {{
        const S: usize = std::mem::size_of::<$t>();
        let a = <$t>::from_ne_bytes($tgt[..S].try_into().unwrap());
        let b = <$t>::from_ne_bytes($src[..S].try_into().unwrap());
        let m = <$t>::from_ne_bytes($operand[..S].try_into().unwrap());
        let r = (a & !m) | (b & m);
        $tgt[..S].copy_from_slice(&r.to_ne_bytes());
        Ok(())
    }};
}

/// Apply `op` over `tgt` with source `src`.
///
/// `fetch`, when present, receives the pre-op contents of `tgt` (the
/// fetch half of fetch-atomic and swap). `tgt` and `src` must be the
/// same length, a multiple of the element size. The caller is expected
/// to have validated the combination via [`check_atomic`] /
/// [`check_swap`] and to hold the entry lock.
pub fn apply(
    op: AtomOp,
    ty: AtomType,
    tgt: &mut [u8],
    src: &[u8],
    operand: &[u8; 16],
    fetch: Option<&mut [u8]>,
) -> Result<()> {
    if src.len() != tgt.len() || tgt.len() % ty.size() != 0 {
        return Err(Error::ArgInvalid);
    }
    if tgt.is_empty() {
        return Ok(());
    }
    if let Some(f) = fetch {
        let n = tgt.len().min(f.len());
        f[..n].copy_from_slice(&tgt[..n]);
    }

    // Plain swap replaces the whole window; conditional/masked swaps
    // operate on one element.
    if op == AtomOp::Swap {
        tgt.copy_from_slice(src);
        return Ok(());
    }

    let info = op_info(op);
    if info.use_operand {
        return match op {
            AtomOp::Mswap => match ty {
                AtomType::I8 | AtomType::U8 => mswap_bits!(u8, tgt, src, operand),
                AtomType::I16 | AtomType::U16 => mswap_bits!(u16, tgt, src, operand),
                AtomType::I32 | AtomType::U32 => mswap_bits!(u32, tgt, src, operand),
                AtomType::I64 | AtomType::U64 => mswap_bits!(u64, tgt, src, operand),
                _ => Err(Error::ArgInvalid),
            },
            _ => match ty {
                AtomType::I8 => cswap_cmp!(i8, tgt, src, operand, op),
                AtomType::U8 => cswap_cmp!(u8, tgt, src, operand, op),
                AtomType::I16 => cswap_cmp!(i16, tgt, src, operand, op),
                AtomType::U16 => cswap_cmp!(u16, tgt, src, operand, op),
                AtomType::I32 => cswap_cmp!(i32, tgt, src, operand, op),
                AtomType::U32 => cswap_cmp!(u32, tgt, src, operand, op),
                AtomType::I64 => cswap_cmp!(i64, tgt, src, operand, op),
                AtomType::U64 => cswap_cmp!(u64, tgt, src, operand, op),
                AtomType::Float => cswap_cmp!(f32, tgt, src, operand, op),
                AtomType::Double => cswap_cmp!(f64, tgt, src, operand, op),
                // Complex equality swaps compare both components.
                AtomType::FloatComplex => match op {
                    AtomOp::Cswap | AtomOp::CswapNe => cswap_cmp!(u64, tgt, src, operand, op),
                    _ => Err(Error::ArgInvalid),
                },
                AtomType::DoubleComplex => Err(Error::ArgInvalid),
            },
        };
    }

    match ty {
        AtomType::I8 => int_elems!(i8, tgt, src, op),
        AtomType::U8 => int_elems!(u8, tgt, src, op),
        AtomType::I16 => int_elems!(i16, tgt, src, op),
        AtomType::U16 => int_elems!(u16, tgt, src, op),
        AtomType::I32 => int_elems!(i32, tgt, src, op),
        AtomType::U32 => int_elems!(u32, tgt, src, op),
        AtomType::I64 => int_elems!(i64, tgt, src, op),
        AtomType::U64 => int_elems!(u64, tgt, src, op),
        AtomType::Float => float_elems!(f32, tgt, src, op),
        AtomType::Double => float_elems!(f64, tgt, src, op),
        AtomType::FloatComplex => complex_elems!(f32, tgt, src, op),
        AtomType::DoubleComplex => complex_elems!(f64, tgt, src, op),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op16(v: u64) -> [u8; 16] {
        let mut o = [0u8; 16];
        o[..8].copy_from_slice(&v.to_ne_bytes());
        o
    }

    #[test]
    fn sum_u64() {
        let mut tgt = 100u64.to_ne_bytes().to_vec();
        let src = 23u64.to_ne_bytes().to_vec();
        apply(AtomOp::Sum, AtomType::U64, &mut tgt, &src, &[0; 16], None).unwrap();
        assert_eq!(u64::from_ne_bytes(tgt.try_into().unwrap()), 123);
    }

    #[test]
    fn fetch_sum_returns_original() {
        let mut tgt = 7u64.to_ne_bytes().to_vec();
        let src = 5u64.to_ne_bytes().to_vec();
        let mut fetch = vec![0u8; 8];
        apply(
            AtomOp::Sum,
            AtomType::U64,
            &mut tgt,
            &src,
            &[0; 16],
            Some(&mut fetch),
        )
        .unwrap();
        assert_eq!(u64::from_ne_bytes(fetch.try_into().unwrap()), 7);
        assert_eq!(u64::from_ne_bytes(tgt.try_into().unwrap()), 12);
    }

    #[test]
    fn min_max_elementwise() {
        let mut tgt: Vec<u8> = [3i32, 9, -4]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        let src: Vec<u8> = [5i32, 2, -7]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        apply(AtomOp::Min, AtomType::I32, &mut tgt, &src, &[0; 16], None).unwrap();
        let out: Vec<i32> = tgt
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(out, vec![3, 2, -7]);
    }

    #[test]
    fn cswap_lt_equal_does_not_swap() {
        let mut tgt = 5u64.to_ne_bytes().to_vec();
        let src = 99u64.to_ne_bytes().to_vec();
        apply(
            AtomOp::CswapLt,
            AtomType::U64,
            &mut tgt,
            &src,
            &op16(5),
            None,
        )
        .unwrap();
        assert_eq!(u64::from_ne_bytes(tgt.clone().try_into().unwrap()), 5);

        // Operand strictly below the target value swaps.
        apply(
            AtomOp::CswapLt,
            AtomType::U64,
            &mut tgt,
            &src,
            &op16(4),
            None,
        )
        .unwrap();
        assert_eq!(u64::from_ne_bytes(tgt.try_into().unwrap()), 99);
    }

    #[test]
    fn cswap_ne_equal_does_not_swap() {
        let mut tgt = 5u64.to_ne_bytes().to_vec();
        let src = 99u64.to_ne_bytes().to_vec();
        apply(
            AtomOp::CswapNe,
            AtomType::U64,
            &mut tgt,
            &src,
            &op16(5),
            None,
        )
        .unwrap();
        assert_eq!(u64::from_ne_bytes(tgt.try_into().unwrap()), 5);
    }

    #[test]
    fn cswap_equal_swaps() {
        let mut tgt = 5u64.to_ne_bytes().to_vec();
        let src = 99u64.to_ne_bytes().to_vec();
        apply(AtomOp::Cswap, AtomType::U64, &mut tgt, &src, &op16(5), None).unwrap();
        assert_eq!(u64::from_ne_bytes(tgt.try_into().unwrap()), 99);
    }

    #[test]
    fn mswap_masks_bits() {
        let mut tgt = 0xff00_ff00u32.to_ne_bytes().to_vec();
        let src = 0x1234_5678u32.to_ne_bytes().to_vec();
        let mut operand = [0u8; 16];
        operand[..4].copy_from_slice(&0x0000_ffffu32.to_ne_bytes());
        apply(
            AtomOp::Mswap,
            AtomType::U32,
            &mut tgt,
            &src,
            &operand,
            None,
        )
        .unwrap();
        assert_eq!(
            u32::from_ne_bytes(tgt.try_into().unwrap()),
            0xff00_5678u32
        );
    }

    #[test]
    fn complex_prod() {
        // (1 + 2i) * (3 + 4i) = -5 + 10i
        let mut tgt: Vec<u8> = [1f32, 2.0].iter().flat_map(|v| v.to_ne_bytes()).collect();
        let src: Vec<u8> = [3f32, 4.0].iter().flat_map(|v| v.to_ne_bytes()).collect();
        apply(
            AtomOp::Prod,
            AtomType::FloatComplex,
            &mut tgt,
            &src,
            &[0; 16],
            None,
        )
        .unwrap();
        let re = f32::from_ne_bytes(tgt[..4].try_into().unwrap());
        let im = f32::from_ne_bytes(tgt[4..].try_into().unwrap());
        assert_eq!((re, im), (-5.0, 10.0));
    }

    #[test]
    fn validity_table() {
        assert!(check_atomic(AtomOp::Sum, AtomType::DoubleComplex).is_ok());
        assert!(check_atomic(AtomOp::Band, AtomType::Float).is_err());
        assert!(check_atomic(AtomOp::Min, AtomType::FloatComplex).is_err());
        assert!(check_atomic(AtomOp::Swap, AtomType::U64).is_err());
        assert!(check_swap(AtomOp::Swap, AtomType::U64, 64).is_ok());
        assert!(check_swap(AtomOp::Cswap, AtomType::U64, 8).is_ok());
        assert!(check_swap(AtomOp::Cswap, AtomType::U64, 16).is_err());
        assert!(check_swap(AtomOp::Mswap, AtomType::Double, 8).is_err());
        assert!(check_swap(AtomOp::CswapLt, AtomType::FloatComplex, 8).is_err());
    }

    #[test]
    fn logical_ops() {
        let mut tgt = 0u8.to_ne_bytes().to_vec();
        let src = 7u8.to_ne_bytes().to_vec();
        apply(AtomOp::Lor, AtomType::U8, &mut tgt, &src, &[0; 16], None).unwrap();
        assert_eq!(tgt[0], 1);

        let mut tgt = 3u8.to_ne_bytes().to_vec();
        apply(AtomOp::Land, AtomType::U8, &mut tgt, &src, &[0; 16], None).unwrap();
        assert_eq!(tgt[0], 1);

        let mut tgt = 1u8.to_ne_bytes().to_vec();
        apply(AtomOp::Lxor, AtomType::U8, &mut tgt, &src, &[0; 16], None).unwrap();
        assert_eq!(tgt[0], 0);
    }
}
