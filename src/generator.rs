//! Template-directive expander producing device kernel source.
//!
//! Kernel templates are plain OpenCL C carrying `%KEY` substitutions and
//! `%NAME(args)` directives. The expander is parameterized by the base
//! element type and a vectorization width; complex arithmetic is emitted
//! over the `.even`/`.odd` vector subfields so one template serves all
//! four element types.
//!
//! Matching is longest-prefix on `%KEY`; the directive set is small and
//! closed, so no full macro machinery is needed.

use std::cell::Cell;

use crate::error::{Error, Result};
use crate::types::DataType;

/// Base element type a generator instance is built for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BaseType {
    Single,
    Double,
    Complex,
    DoubleComplex,
}

impl BaseType {
    pub fn from_dtype(dtype: DataType) -> BaseType {
        match dtype {
            DataType::F32 => BaseType::Single,
            DataType::F64 => BaseType::Double,
            DataType::C32 => BaseType::Complex,
            DataType::C64 => BaseType::DoubleComplex,
        }
    }

    fn is_complex(self) -> bool {
        matches!(self, BaseType::Complex | BaseType::DoubleComplex)
    }

    /// Primitive scalar type lanes are made of.
    fn ptype(self) -> &'static str {
        match self {
            BaseType::Single | BaseType::Complex => "float",
            _ => "double",
        }
    }

    /// The type of one element: `float2` for complex single, etc.
    fn elem_type(self) -> &'static str {
        match self {
            BaseType::Single => "float",
            BaseType::Double => "double",
            BaseType::Complex => "float2",
            BaseType::DoubleComplex => "double2",
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            BaseType::Single => "S",
            BaseType::Double => "D",
            BaseType::Complex => "C",
            BaseType::DoubleComplex => "Z",
        }
    }

    /// Literal suffix for floating constants of this base.
    fn literal_suffix(self) -> &'static str {
        match self {
            BaseType::Single | BaseType::Complex => "f",
            _ => "",
        }
    }
}

const VALID_WIDTHS: &[usize] = &[1, 2, 3, 4, 8, 16];

fn vec_type(ptype: &str, n: usize) -> Option<String> {
    if n == 1 {
        Some(ptype.to_string())
    } else if VALID_WIDTHS.contains(&n) {
        Some(format!("{}{}", ptype, n))
    } else {
        None
    }
}

/// Lane accessor `.S0`, `.S1`, ... `.SF`.
fn lane(i: usize) -> String {
    format!("S{:X}", i)
}

/// Complex element accessor over base lanes: `.s01`, `.s23`, ...
fn complex_lane(i: usize) -> String {
    format!("s{:X}{:X}", i * 2, i * 2 + 1)
}

#[derive(Clone, Copy, PartialEq)]
enum ReductionKind {
    Sum,
    Max,
    Min,
    Hypot,
    Ssq,
}

/// The kernel-source generator.
#[derive(Clone)]
pub struct KernelGenerator {
    base: BaseType,
    vector_width: usize,
    effective_width: usize,
    do_vload: bool,
    do_vstore: bool,
    wg_size: usize,
    keys: Vec<(String, String)>,
    scratch: Cell<usize>,
}

impl KernelGenerator {
    pub fn new(
        base: BaseType,
        vector_width: usize,
        do_vload: bool,
        do_vstore: bool,
        wg_size: usize,
    ) -> Result<KernelGenerator> {
        if vector_width == 0 {
            return Err(Error::invalid("vector width must be positive"));
        }
        let internal = if base.is_complex() { 2 } else { 1 };
        let effective_width = vector_width * internal;
        if !VALID_WIDTHS.contains(&effective_width) {
            return Err(Error::invalid(format!(
                "vector width {} is not expressible for {:?}",
                vector_width, base
            )));
        }

        let mut gen = KernelGenerator {
            base,
            vector_width,
            effective_width,
            do_vload,
            do_vstore,
            wg_size,
            keys: Vec::new(),
            scratch: Cell::new(0),
        };
        gen.register_types()?;
        Ok(gen)
    }

    /// Convenience constructor matching how solution steps configure the
    /// generator.
    pub fn for_extra(extra: &crate::flags::KernelExtra, wg_size: usize) -> Result<KernelGenerator> {
        use crate::flags::KernelExtraFlags as F;
        let vload = !extra.flags.contains(F::NO_COPY_VEC_A);
        let vstore = !extra.flags.contains(F::NO_COPY_VEC_C);
        KernelGenerator::new(
            BaseType::from_dtype(extra.dtype),
            extra.vec_len.max(1) as usize,
            vload,
            vstore,
            wg_size,
        )
    }

    /// Registers or replaces a plain substitution key. Keys must start
    /// with `%`.
    pub fn put<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        let key = key.into();
        debug_assert!(key.starts_with('%'));
        let value = value.into();
        if let Some(slot) = self.keys.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.keys.push((key, value));
        }
    }

    pub fn base(&self) -> BaseType {
        self.base
    }

    pub fn vector_width(&self) -> usize {
        self.vector_width
    }

    fn register_types(&mut self) -> Result<()> {
        let ptype = self.base.ptype();
        let derived = vec_type(ptype, self.effective_width)
            .ok_or_else(|| Error::invalid("bad effective vector width"))?;

        self.put("%TYPE", self.base.elem_type());
        self.put("%PTYPE", ptype);
        self.put("%PREFIX", self.base.prefix());
        self.put("%BASEWIDTH", if self.base.is_complex() { "2" } else { "1" });
        self.put("%TYPE%V", derived.clone());
        if let Some(t) = vec_type(ptype, self.vector_width) {
            self.put("%PTYPE%V", t);
        }

        // Reduced types: half, quarter and eighth of the effective width.
        for &(div, tkey, wkey) in &[
            (2usize, "%TYPE%HV", "%HV"),
            (4, "%TYPE%QV", "%QV"),
            (8, "%TYPE%OV", "%OV"),
        ] {
            let w = self.effective_width / div;
            if w == 0 {
                self.put(tkey, "NULL");
                continue;
            }
            if let Some(t) = vec_type(ptype, w) {
                self.put(tkey, t);
                self.put(wkey, w.to_string());
            }
        }

        // Super types: double, quadruple and octuple width.
        for &(mul, tkey, wkey) in &[
            (2usize, "%TYPE%DV", "%DV"),
            (4, "%TYPE%QUADV", "%QUADV"),
            (8, "%TYPE%OCTAV", "%OCTAV"),
        ] {
            let w = self.effective_width * mul;
            if w > 16 {
                self.put(tkey, "NULL");
                continue;
            }
            if let Some(t) = vec_type(ptype, w) {
                self.put(tkey, t);
                self.put(wkey, w.to_string());
            }
        }

        self.put("%V", self.vector_width.to_string());
        self.put(
            "%VSTORE_VALUE",
            if self.effective_width == 1 {
                "vstore".to_string()
            } else {
                format!("vstore{}", self.effective_width)
            },
        );

        Ok(())
    }

    fn value_of(&self, key: &str) -> Option<&str> {
        self.keys
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn derived_type(&self) -> &str {
        self.value_of("%TYPE%V").unwrap_or("float")
    }

    fn half_type(&self) -> &str {
        self.value_of("%TYPE%HV").unwrap_or("NULL")
    }

    fn quarter_type(&self) -> &str {
        self.value_of("%TYPE%QV").unwrap_or("NULL")
    }

    fn eighth_type(&self) -> &str {
        self.value_of("%TYPE%OV").unwrap_or("NULL")
    }

    fn fresh_ident(&self, stem: &str) -> String {
        let n = self.scratch.get();
        self.scratch.set(n + 1);
        format!("{}{}_", stem, n)
    }

    /// Expands every key and directive in `src`.
    pub fn expand(&self, src: &str) -> Result<String> {
        let mut out = String::with_capacity(src.len() * 2);
        let bytes = src.as_bytes();
        let mut pos = 0;

        while pos < bytes.len() {
            if bytes[pos] != b'%' {
                let ch_len = utf8_len(bytes[pos]);
                out.push_str(&src[pos..pos + ch_len]);
                pos += ch_len;
                continue;
            }

            let rest = &src[pos..];
            match self.longest_match(rest) {
                Match::Value(key_len, value) => {
                    out.push_str(value);
                    pos += key_len;
                }
                Match::Directive(name) => {
                    pos += name.len();
                    self.dispatch(name, src, &mut pos, &mut out)?;
                }
                Match::None => {
                    out.push('%');
                    pos += 1;
                }
            }
        }

        Ok(out)
    }

    fn longest_match<'a>(&'a self, rest: &str) -> Match<'a> {
        let mut best: Match<'a> = Match::None;
        let mut best_len = 0;

        for (key, value) in &self.keys {
            if key.len() > best_len && rest.starts_with(key.as_str()) {
                best = Match::Value(key.len(), value);
                best_len = key.len();
            }
        }
        for &name in DIRECTIVES {
            if name.len() > best_len && rest.starts_with(name) {
                best = Match::Directive(name);
                best_len = name.len();
            }
        }

        best
    }

    /// Parses a directive argument list and expands value keys inside the
    /// arguments so templates can route expressions through keys.
    fn args_of(&self, src: &str, pos: &mut usize) -> Result<Vec<String>> {
        parse_args(src, pos)?
            .into_iter()
            .map(|a| self.expand(&a))
            .collect()
    }

    fn dispatch(&self, name: &str, src: &str, pos: &mut usize, out: &mut String) -> Result<()> {
        match name {
            "%MUL" => self.mul(&self.args_of(src, pos)?, false, out),
            "%VMUL" => self.mul(&self.args_of(src, pos)?, true, out),
            "%MAD" => self.mad(&self.args_of(src, pos)?, false, out),
            "%VMAD" => self.mad(&self.args_of(src, pos)?, true, out),
            "%MAD_AND_REDUCE" => self.mad_and_reduce(&self.args_of(src, pos)?, false, out),
            "%VMAD_AND_REDUCE" => self.mad_and_reduce(&self.args_of(src, pos)?, true, out),
            "%DIV" => self.div(&self.args_of(src, pos)?, out),
            "%VDIV" => self.div(&self.args_of(src, pos)?, out),
            "%ADD" => self.add_sub(&self.args_of(src, pos)?, '+', out),
            "%SUB" => self.add_sub(&self.args_of(src, pos)?, '-', out),
            "%MAKEVEC" | "%INIT" => self.make_vec(&self.args_of(src, pos)?, None, out),
            "%VMAKEVEC" => self.make_vec(&self.args_of(src, pos)?, Some(1), out),
            "%VMAKEHVEC" => self.make_vec(&self.args_of(src, pos)?, Some(2), out),
            "%VMAKEQVEC" => self.make_vec(&self.args_of(src, pos)?, Some(4), out),
            "%VMAKEOVEC" => self.make_vec(&self.args_of(src, pos)?, Some(8), out),
            "%VLOAD" => self.vload(&self.args_of(src, pos)?, out),
            "%VSTORE" => self.vstore(&self.args_of(src, pos)?, out),
            "%CONJUGATE" => self.conjugate(&self.args_of(src, pos)?, out),
            "%CLEAR_IMAGINARY" => self.clear_imaginary(&self.args_of(src, pos)?, out),
            "%COMPLEX_JOIN" => self.complex_join(&self.args_of(src, pos)?, out),
            "%VLOADWITHINCX" => self.vload_with_incx(&self.args_of(src, pos)?, false, out),
            "%VLOADWITHINCXV2" => self.vload_with_incx(&self.args_of(src, pos)?, true, out),
            "%VSTOREWITHINCX" => self.vstore_with_incx(&self.args_of(src, pos)?, out),
            "%REDUCE_SUM" => self.reduce_chain(&self.args_of(src, pos)?, "+", out),
            "%REDUCE_SUM_REAL_HV" => self.reduce_sum_real_hv(&self.args_of(src, pos)?, out),
            "%REDUCE_MAX" => self.reduce_minmax(&self.args_of(src, pos)?, true, out),
            "%REDUCE_MIN" => self.reduce_minmax(&self.args_of(src, pos)?, false, out),
            "%REDUCE_HYPOT" => self.reduce_fn_chain(&self.args_of(src, pos)?, "hypot", out),
            "%IF" => return self.if_guard(src, pos, out),
            "%VFOR" => return self.vfor(src, pos, out, false),
            "%VFOR_REAL" => return self.vfor(src, pos, out, true),
            "%REDUCTION_BY_SUM" => {
                self.reduction(&self.args_of(src, pos)?, ReductionKind::Sum, out)?
            }
            "%REDUCTION_BY_MAX" => {
                self.reduction(&self.args_of(src, pos)?, ReductionKind::Max, out)?
            }
            "%REDUCTION_BY_MIN" => {
                self.reduction(&self.args_of(src, pos)?, ReductionKind::Min, out)?
            }
            "%REDUCTION_BY_HYPOT" => {
                self.reduction(&self.args_of(src, pos)?, ReductionKind::Hypot, out)?
            }
            "%REDUCTION_BY_SSQ" => {
                self.reduction(&self.args_of(src, pos)?, ReductionKind::Ssq, out)?
            }
            "%VABS" => self.vabs(&self.args_of(src, pos)?, out),
            "%ABS" => self.abs(&self.args_of(src, pos)?, out),
            _ => return Err(Error::invalid(format!("unknown directive {}", name))),
        }
        Ok(())
    }

    fn mul(&self, args: &[String], vector_op: bool, out: &mut String) {
        let (d, a, b) = (&args[0], &args[1], &args[2]);
        let _ = vector_op;
        if !self.base.is_complex() {
            out.push_str(&format!("{} = {} * {}", d, a, b));
        } else {
            out.push_str(&format!(
                "{d}.even = (({a}.even) * ({b}.even)) - (({a}.odd) * ({b}.odd));\n",
                d = d,
                a = a,
                b = b
            ));
            out.push_str(&format!(
                "{d}.odd = (({a}.even) * ({b}.odd)) + (({a}.odd) * ({b}.even));\n",
                d = d,
                a = a,
                b = b
            ));
        }
    }

    fn mad(&self, args: &[String], vector_op: bool, out: &mut String) {
        let (d, a, b) = (&args[0], &args[1], &args[2]);
        let _ = vector_op;
        if !self.base.is_complex() {
            out.push_str(&format!("{d} = mad({a},{b},{d})", d = d, a = a, b = b));
        } else {
            out.push_str(&format!(
                "{d}.even = {d}.even + (({a}.even) * ({b}.even)) - (({a}.odd) * ({b}.odd));\n",
                d = d,
                a = a,
                b = b
            ));
            out.push_str(&format!(
                "{d}.odd = {d}.odd + (({a}.even) * ({b}.odd)) + (({a}.odd) * ({b}.even));\n",
                d = d,
                a = a,
                b = b
            ));
        }
    }

    fn mad_and_reduce(&self, args: &[String], all_lanes: bool, out: &mut String) {
        let (d, a, b) = (&args[0], &args[1], &args[2]);
        if !self.base.is_complex() {
            if self.vector_width == 1 {
                out.push_str(&format!("{d} = mad({a},{b},{d});\n\t", d = d, a = a, b = b));
            } else if all_lanes {
                for i in 0..self.vector_width {
                    out.push_str(&format!(
                        "{d} = mad(({a}).{l},({b}).{l},({d}));\n\t",
                        d = d,
                        a = a,
                        b = b,
                        l = lane(i)
                    ));
                }
            } else {
                out.push_str(&format!(
                    "{d} = mad({a}.{l},{b}.{l},{d});\n\t",
                    d = d,
                    a = a,
                    b = b,
                    l = lane(0)
                ));
            }
        } else {
            let lanes = if all_lanes { self.vector_width } else { 1 };
            for i in 0..lanes {
                let (re, im) = (lane(2 * i), lane(2 * i + 1));
                out.push_str(&format!(
                    "({d}).S0 = mad(({a}).{re},({b}).{re},({d}).S0);\n\t",
                    d = d, a = a, b = b, re = re
                ));
                out.push_str(&format!(
                    "({d}).S0 = mad(({a}).{im},-({b}).{im},({d}).S0);\n\t",
                    d = d, a = a, b = b, im = im
                ));
                out.push_str(&format!(
                    "({d}).S1 = mad(({a}).{re},({b}).{im},({d}).S1);\n\t",
                    d = d, a = a, b = b, re = re, im = im
                ));
                out.push_str(&format!(
                    "({d}).S1 = mad(({a}).{im},({b}).{re},({d}).S1);\n\t",
                    d = d, a = a, b = b, re = re, im = im
                ));
            }
        }
    }

    fn div(&self, args: &[String], out: &mut String) {
        let (d, a, b) = (&args[0], &args[1], &args[2]);
        if !self.base.is_complex() {
            out.push_str(&format!("{} = {} / {}", d, a, b));
        } else {
            out.push_str(&format!(
                "{d}.even = (({a}.even) * ({b}.even)) + (({a}.odd) * ({b}.odd));\n",
                d = d, a = a, b = b
            ));
            out.push_str(&format!(
                "{d}.odd = -(({a}.even) * ({b}.odd)) + (({a}.odd) * ({b}.even));\n",
                d = d, a = a, b = b
            ));
            out.push_str(&format!(
                "{d}.even /= ({b}.even*{b}.even) + ({b}.odd*{b}.odd) ;\n",
                d = d, b = b
            ));
            out.push_str(&format!(
                "{d}.odd /= ({b}.even*{b}.even) + ({b}.odd*{b}.odd) ;\n",
                d = d, b = b
            ));
        }
    }

    fn add_sub(&self, args: &[String], op: char, out: &mut String) {
        out.push_str(&format!("{} = {} {} {}", args[0], args[1], op, args[2]));
    }

    fn make_vec(&self, args: &[String], div: Option<usize>, out: &mut String) {
        let id = &args[0];
        match div {
            None => {
                let suffix = self.base.literal_suffix();
                out.push_str(&format!("({})(", self.base.elem_type()));
                if self.base.is_complex() {
                    out.push_str(&format!(" {}{},", id, suffix));
                }
                out.push_str(&format!(" {}{})", id, suffix));
            }
            Some(d) => {
                let cast = match d {
                    1 => self.derived_type(),
                    2 => self.half_type(),
                    4 => self.quarter_type(),
                    _ => self.eighth_type(),
                };
                let count = (self.vector_width / d).max(1);
                out.push_str(&format!("({})(", cast));
                for _ in 1..count {
                    out.push_str(&format!(" {},", id));
                }
                out.push_str(&format!(" {})", id));
            }
        }
    }

    fn vload(&self, args: &[String], out: &mut String) {
        let (off, addr) = (&args[0], &args[1]);
        if !self.do_vload || self.effective_width == 1 {
            out.push_str(&format!(
                "*((__global {}*)({}))",
                self.derived_type(),
                addr
            ));
        } else {
            out.push_str(&format!(
                "vload{}( {}, (__global {} *){})",
                self.effective_width,
                off,
                self.base.ptype(),
                addr
            ));
        }
    }

    fn vstore(&self, args: &[String], out: &mut String) {
        let (val, off, addr) = (&args[0], &args[1], &args[2]);
        if !self.do_vstore || self.effective_width == 1 {
            out.push_str(&format!(
                "*((__global {}*)({}) + {}) = {}",
                self.derived_type(),
                addr,
                off,
                val
            ));
        } else {
            out.push_str(&format!(
                "vstore{}( {}, {}, (__global {} *){})",
                self.effective_width,
                val,
                off,
                self.base.ptype(),
                addr
            ));
        }
    }

    fn conjugate(&self, args: &[String], out: &mut String) {
        let (cond, var) = (&args[0], &args[1]);
        if self.base.is_complex() {
            out.push_str(&format!(
                "{v} = (({c} == 1)? ( {v}.odd = -{v}.odd, {v}) : {v})",
                v = var,
                c = cond
            ));
        }
    }

    fn clear_imaginary(&self, args: &[String], out: &mut String) {
        if self.base.is_complex() {
            out.push_str(&format!("{}.odd = 0.0f", args[0]));
        }
    }

    fn complex_join(&self, args: &[String], out: &mut String) {
        if !self.base.is_complex() {
            return;
        }
        let (dst, re, im) = (&args[0], &args[1], &args[2]);
        for i in 0..self.effective_width {
            let from = if i % 2 == 0 { re } else { im };
            if self.effective_width > 2 {
                out.push_str(&format!(
                    "{}.{} = {}.{};\n",
                    dst,
                    lane(i),
                    from,
                    lane(i / 2)
                ));
            } else {
                out.push_str(&format!("{}.{} = {};\n", dst, lane(i), from));
            }
        }
    }

    fn vload_with_incx(&self, args: &[String], ignore_first: bool, out: &mut String) {
        let (dst, src, incx) = (&args[0], &args[1], &args[2]);
        if !ignore_first {
            out.push_str(&format!("{} = ", dst));
        }
        out.push_str(&format!("({})(", self.derived_type()));
        for i in 0..self.vector_width {
            let sep = if i + 1 == self.vector_width { ')' } else { ',' };
            out.push_str(&format!(" {}[0 + ({} * {})]{}", src, incx, i, sep));
        }
    }

    fn vstore_with_incx(&self, args: &[String], out: &mut String) {
        let (dst, src, incx) = (&args[0], &args[1], &args[2]);
        for i in 0..self.vector_width {
            if self.base.is_complex() {
                out.push_str(&format!(
                    " {}[0 + ({} * {})] = {}.{};\n",
                    dst,
                    incx,
                    i,
                    src,
                    complex_lane(i)
                ));
            } else if self.vector_width != 1 {
                out.push_str(&format!(
                    " {}[0 + ({} * {})] = {}.{};\n",
                    dst,
                    incx,
                    i,
                    src,
                    lane(i)
                ));
            } else {
                out.push_str(&format!(" {}[0 + ({} * {})] = {};\n", dst, incx, i, src));
            }
        }
    }

    fn reduce_chain(&self, args: &[String], op: &str, out: &mut String) {
        let v = &args[0];
        if self.vector_width == 1 {
            out.push_str(&format!("({});\n", v));
            return;
        }
        for i in 0..self.vector_width {
            if i > 0 {
                out.push_str(&format!(" {} ", op));
            }
            if self.base.is_complex() {
                out.push_str(&format!("{}.{}", v, complex_lane(i)));
            } else {
                out.push_str(&format!("{}.{}", v, lane(i)));
            }
        }
        out.push_str(";\n");
    }

    fn reduce_fn_chain(&self, args: &[String], func: &str, out: &mut String) {
        let v = &args[0];
        if self.vector_width == 1 {
            out.push_str(&format!("({});\n", v));
            return;
        }
        for i in 0..self.vector_width - 1 {
            out.push_str(&format!("{}( {}.{}, ", func, v, lane(i)));
        }
        out.push_str(&format!(" {}.{} ", v, lane(self.vector_width - 1)));
        for _ in 0..self.vector_width - 1 {
            out.push(')');
        }
        out.push_str(";\n");
    }

    /// `%REDUCE_MAX(val)` folds vector lanes with `fmax`; the four-argument
    /// form `%REDUCE_MAX(val, max, idx, impl)` also tracks the lane index
    /// of the winning element (amax style).
    fn reduce_minmax(&self, args: &[String], is_max: bool, out: &mut String) {
        let func = if is_max { "fmax" } else { "fmin" };
        if args.len() < 3 {
            self.reduce_fn_chain(args, func, out);
            return;
        }

        let (val, max_var, idx_var) = (&args[0], &args[1], &args[2]);
        let follow_low = args.get(3).map(|s| s.as_str()) != Some("0");
        let cmp = if is_max { ">" } else { "<" };
        let m = self.fresh_ident("m");
        let i = self.fresh_ident("i");
        out.push_str(&format!(
            "{{ {pt} {m} = {v}.{l0}; uint {i} = 0;\n",
            pt = self.base.ptype(),
            m = m,
            v = val,
            l0 = lane(0),
            i = i
        ));
        for k in 1..self.vector_width {
            let better = if follow_low {
                format!("{v}.{l} {c} {m}", v = val, l = lane(k), c = cmp, m = m)
            } else {
                format!("!({m} {c} {v}.{l})", v = val, l = lane(k), c = cmp, m = m)
            };
            out.push_str(&format!(
                "if ({b}) {{ {m} = {v}.{l}; {i} = {k}; }}\n",
                b = better,
                m = m,
                v = val,
                l = lane(k),
                i = i,
                k = k
            ));
        }
        out.push_str(&format!(
            "{mx} = {m}; {ix} = {ix} * {w} + {i}; }}\n",
            mx = max_var,
            m = m,
            ix = idx_var,
            w = self.vector_width,
            i = i
        ));
    }

    fn reduce_sum_real_hv(&self, args: &[String], out: &mut String) {
        let v = &args[0];
        let n = (self.effective_width / 2).max(1);
        if n == 1 {
            out.push_str(&format!("({});\n", v));
            return;
        }
        for i in 0..n {
            if i > 0 {
                out.push_str(" + ");
            }
            out.push_str(&format!("{}.{}", v, lane(i)));
        }
        out.push_str(";\n");
    }

    fn if_guard(&self, src: &str, pos: &mut usize, out: &mut String) -> Result<()> {
        let args = parse_args(src, pos)?;
        let key = args
            .get(0)
            .ok_or_else(|| Error::invalid("%IF needs a key"))?;
        let text = if key.starts_with('%') {
            self.value_of(key).unwrap_or("0")
        } else {
            key.as_str()
        };
        let cond: i64 = text.trim().parse().unwrap_or(0);

        if cond >= 1 {
            return Ok(());
        }
        // Drop the rest of the line.
        let bytes = src.as_bytes();
        while *pos < bytes.len() && bytes[*pos] != b'\n' {
            *pos += 1;
        }
        if *pos < bytes.len() {
            *pos += 1;
        }
        out.push('\n');
        Ok(())
    }

    fn vfor(&self, src: &str, pos: &mut usize, out: &mut String, is_real: bool) -> Result<()> {
        let bytes = src.as_bytes();
        while *pos < bytes.len() && bytes[*pos] != b'{' {
            *pos += 1;
        }
        if *pos >= bytes.len() {
            return Err(Error::invalid("%VFOR: missing body"));
        }
        let start = *pos;
        let mut depth = 0usize;
        while *pos < bytes.len() {
            match bytes[*pos] {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        *pos += 1;
                        break;
                    }
                }
                _ => {}
            }
            *pos += 1;
        }
        if depth != 0 {
            return Err(Error::invalid("%VFOR: unbalanced braces"));
        }
        let body = &src[start..*pos];

        for v in 0..self.vector_width {
            let mut child = self.clone();
            child.put("%VFORINDEX", v.to_string());
            let suffix = if self.vector_width == 1 {
                String::new()
            } else if is_real || !self.base.is_complex() {
                format!(".{}", lane(v))
            } else {
                format!(".{}", complex_lane(v))
            };
            child.put("%VFORSUFFIX", suffix);
            out.push_str(&child.expand(body)?);
        }
        Ok(())
    }

    fn vabs(&self, args: &[String], out: &mut String) {
        let v = &args[0];
        if self.base.is_complex() {
            out.push_str(&format!("(fabs({v}.even) + fabs({v}.odd))", v = v));
        } else {
            out.push_str(&format!("fabs({})", v));
        }
    }

    fn abs(&self, args: &[String], out: &mut String) {
        out.push_str(&format!("fabs({})", args[0]));
    }

    /// Work-group-wide tree reduction over local scratch memory.
    fn reduction(&self, args: &[String], kind: ReductionKind, out: &mut String) -> Result<()> {
        if self.wg_size < 2 || !self.wg_size.is_power_of_two() {
            return Err(Error::invalid(
                "reduction requires a power-of-two work group size of at least 2",
            ));
        }
        if args.is_empty() || (kind == ReductionKind::Ssq && args.len() < 2) {
            return Err(Error::invalid("reduction directive misses arguments"));
        }
        let var = &args[0];
        let with_index = kind == ReductionKind::Max && args.len() >= 3;

        let lds = self.fresh_ident("redv");
        let lds2 = self.fresh_ident("redi");
        let lid = self.fresh_ident("lid");
        let ptype = self.base.ptype();

        if with_index {
            self.reduction_with_index(args, &lds, &lds2, &lid, out);
            return Ok(());
        }

        let p: Vec<String> = (0..5).map(|_| self.fresh_ident("p")).collect();

        if kind == ReductionKind::Ssq {
            let scale = var;
            let ssq = &args[1];
            out.push_str(&format!(
                "__local {pt} {lds} [ {n} ], {lds2} [ {n} ];\n",
                pt = ptype,
                lds = lds,
                lds2 = lds2,
                n = self.wg_size
            ));
            out.push_str(&format!(
                "\tuint {lid} = get_local_id(0);\n\t {lds} [ {lid} ] = {s}; {lds2} [ {lid} ] = {q};\n",
                lid = lid,
                lds = lds,
                lds2 = lds2,
                s = scale,
                q = ssq
            ));
            out.push_str(&format!(
                "\t{pt} {p0}, {p1}, {p2}, {p3}, {p4};\n",
                pt = ptype,
                p0 = p[0],
                p1 = p[1],
                p2 = p[2],
                p3 = p[3],
                p4 = p[4]
            ));
        } else {
            out.push_str(&format!(
                "__local {t} {lds} [ {n} ];\n",
                t = self.base.elem_type(),
                lds = lds,
                n = self.wg_size
            ));
            out.push_str(&format!(
                "\tuint {lid} = get_local_id(0);\n\t {lds} [ {lid} ] = {v};\n",
                lid = lid,
                lds = lds,
                v = var
            ));
        }
        out.push_str("\tbarrier(CLK_LOCAL_MEM_FENCE);\n\n");

        let combine = |i: &str| -> String {
            match kind {
                ReductionKind::Sum => format!(
                    " {lds} [ {lid} ] = {lds} [ {lid} ] + {lds} [ {lid} + {i} ];\n",
                    lds = lds,
                    lid = lid,
                    i = i
                ),
                ReductionKind::Max => format!(
                    " {lds} [ {lid} ] = fmax( {lds} [ {lid} ] , {lds} [ {lid} + {i} ] );\n",
                    lds = lds,
                    lid = lid,
                    i = i
                ),
                ReductionKind::Min => format!(
                    " {lds} [ {lid} ] = fmin( {lds} [ {lid} ] , {lds} [ {lid} + {i} ] );\n",
                    lds = lds,
                    lid = lid,
                    i = i
                ),
                ReductionKind::Hypot => format!(
                    " {lds} [ {lid} ] = hypot( {lds} [ {lid} ] , {lds} [ {lid} + {i} ] );\n",
                    lds = lds,
                    lid = lid,
                    i = i
                ),
                ReductionKind::Ssq => String::new(),
            }
        };

        // The classic rescaling update keeps (scale, ssq) well conditioned:
        // new_ssq = (s1/smax)^2 * q1 + (s2/smax)^2 * q2 with smax the larger
        // scale of the pair.
        let ssq_combine = |a_idx: &str, b_idx: &str| -> String {
            let (s1, smax, q, s2, q2) = (&p[0], &p[1], &p[2], &p[3], &p[4]);
            format!(
                " {s1} = {smax} = {lds} [ {a} ];\n\
                 \t {q} = {lds2} [ {a} ];\n\
                 \t {s2} = {lds} [ {b} ];\n\t {q2} = {lds2} [ {b} ];\n\
                 \t {smax} = fmax( {smax}, {s2} );\n\
                 \t {q} = (isnotequal({smax}, ({pt})0.0))?\n\
                 \t ((({s1} / {smax}) * ({s1} / {smax}) * {q}) + (({s2} / {smax}) * ({s2} / {smax}) * {q2})) : {q};\n\
                 \t {lds} [ {a} ] = {smax};\n {lds2} [ {a} ] = {q};\n",
                s1 = s1, smax = smax, q = q, s2 = s2, q2 = q2,
                lds = lds, lds2 = lds2, a = a_idx, b = b_idx, pt = ptype
            )
        };

        let mut i = self.wg_size / 2;
        while i >= 2 {
            out.push_str(&format!("\tif( {} < {} ) {{\n\t\t", lid, i));
            if kind == ReductionKind::Ssq {
                let b = format!("{} + {}", lid, i);
                out.push_str(&ssq_combine(&lid, &b));
            } else {
                out.push_str(&combine(&i.to_string()));
            }
            out.push_str("\t}\n\tbarrier(CLK_LOCAL_MEM_FENCE);\n\n");
            i /= 2;
        }

        out.push_str(&format!("\tif( {} == 0 ) {{\n\t", lid));
        match kind {
            ReductionKind::Sum => out.push_str(&format!(
                "{v} = {lds} [0] + {lds} [1];\n\t}}",
                v = var,
                lds = lds
            )),
            ReductionKind::Max => out.push_str(&format!(
                "{v} = fmax( {lds} [0] , {lds} [1] );\n\t}}",
                v = var,
                lds = lds
            )),
            ReductionKind::Min => out.push_str(&format!(
                "{v} = fmin( {lds} [0] , {lds} [1] );\n\t}}",
                v = var,
                lds = lds
            )),
            ReductionKind::Hypot => out.push_str(&format!(
                "{v} = hypot( {lds} [0] , {lds} [1] );\n\t}}",
                v = var,
                lds = lds
            )),
            ReductionKind::Ssq => {
                out.push_str(&ssq_combine("0", "1"));
                out.push_str(&format!(
                    "\t {v} = {lds} [0];\n\t {q} = {lds2} [0];\n\t}}",
                    v = var,
                    q = args[1],
                    lds = lds,
                    lds2 = lds2
                ));
            }
        }
        Ok(())
    }

    fn reduction_with_index(
        &self,
        args: &[String],
        lds: &str,
        lds2: &str,
        lid: &str,
        out: &mut String,
    ) {
        let (val, idx) = (&args[0], &args[1]);
        let impl_sel = args.get(2).map(|s| s.as_str()).unwrap_or("1");
        let atomic = impl_sel == "0" || impl_sel == "2";
        let follow_low = impl_sel == "0" || impl_sel == "1";
        let sel = self.fresh_ident("sel");
        let ptype = self.base.ptype();

        out.push_str(&format!("uint {};\n", sel));
        out.push_str(&format!(
            "__local {pt} {lds} [ {n} ];\n",
            pt = ptype,
            lds = lds,
            n = self.wg_size
        ));
        out.push_str(&format!(
            "\tuint {lid} = get_local_id(0);\n\t{lds} [ {lid} ] = {v};\n",
            lid = lid,
            lds = lds,
            v = val
        ));
        if atomic {
            out.push_str(&format!("\t__local uint {}[1];\n", lds2));
            out.push_str(&format!(
                "\tif({lid} == 0){{{lds2}[0] = UINT_MAX;}}\n",
                lid = lid,
                lds2 = lds2
            ));
        } else {
            out.push_str(&format!("\t__local uint {} [ {} ];\n", lds2, self.wg_size));
            out.push_str(&format!(
                "\t{lds2} [ {lid} ] = {i};\n",
                lds2 = lds2,
                lid = lid,
                i = idx
            ));
        }
        out.push_str("\tbarrier(CLK_LOCAL_MEM_FENCE);\n\n");

        let idx_cmp = if follow_low { "<" } else { ">" };
        let mut i = self.wg_size / 2;
        while i >= 2 {
            out.push_str(&format!("\tif( {} < {} ) {{\n", lid, i));
            if atomic {
                out.push_str(&format!(
                    "\t{lds}[{lid}] = fmax({lds}[{lid} + {i}], {lds}[{lid}]);\n",
                    lds = lds,
                    lid = lid,
                    i = i
                ));
            } else {
                out.push_str(&format!(
                    "\t{sel} = ({lds}[{lid} + {i}] > {lds}[{lid}]) ? {lid} + {i} : {lid};\n",
                    sel = sel,
                    lds = lds,
                    lid = lid,
                    i = i
                ));
                out.push_str(&format!(
                    "\t{sel} = ({lds}[{lid} + {i}] == {lds}[{lid}]) ? (({lds2}[{lid} + {i}] {c} {lds2}[{lid}]) ? {lid} + {i} : {lid}) : {sel};\n",
                    sel = sel,
                    lds = lds,
                    lds2 = lds2,
                    lid = lid,
                    i = i,
                    c = idx_cmp
                ));
                out.push_str(&format!(
                    "\t{lds}[{lid}] = {lds}[{sel}];\n\t {lds2}[{lid}] = {lds2}[{sel}];\n",
                    lds = lds,
                    lds2 = lds2,
                    lid = lid,
                    sel = sel
                ));
            }
            out.push_str("\t}\n\tbarrier(CLK_LOCAL_MEM_FENCE);\n\n");
            i /= 2;
        }

        if atomic {
            out.push_str(&format!(
                "\tif({lid} == 0){{{lds}[0] = fmax({lds}[1], {lds}[0]);}}\n\
                 \tbarrier(CLK_LOCAL_MEM_FENCE);\n\
                 \tif({v} == {lds}[0]){{atomic_min(({lds2} + 0), {i});}}\n\
                 \tbarrier(CLK_LOCAL_MEM_FENCE);\n\
                 \tif({lid} == 0){{{i} = {lds2}[0]; {v} = {lds}[0];}}\n\
                 \tbarrier(CLK_LOCAL_MEM_FENCE);\n",
                lid = lid,
                lds = lds,
                lds2 = lds2,
                v = val,
                i = idx
            ));
        } else {
            out.push_str(&format!(
                "\tif( {lid} == 0 ) {{\n\t{sel} = ({lds}[1] > {lds}[0]) ? 1 : 0;\n",
                lid = lid,
                sel = sel,
                lds = lds
            ));
            out.push_str(&format!(
                "\t{sel} = ({lds}[1] == {lds}[0]) ? (({lds2}[1] {c} {lds2}[0]) ? 1 : 0) : {sel};\n",
                sel = sel,
                lds = lds,
                lds2 = lds2,
                c = idx_cmp
            ));
            out.push_str(&format!(
                "\t{v} = {lds}[{sel}];\n\t {i} = {lds2}[{sel}];}}\n",
                v = val,
                i = idx,
                lds = lds,
                lds2 = lds2,
                sel = sel
            ));
        }
    }
}

enum Match<'a> {
    None,
    Value(usize, &'a str),
    Directive(&'static str),
}

const DIRECTIVES: &[&str] = &[
    "%MUL",
    "%VMUL",
    "%MAD",
    "%VMAD",
    "%MAD_AND_REDUCE",
    "%VMAD_AND_REDUCE",
    "%DIV",
    "%VDIV",
    "%ADD",
    "%SUB",
    "%MAKEVEC",
    "%INIT",
    "%VMAKEVEC",
    "%VMAKEHVEC",
    "%VMAKEQVEC",
    "%VMAKEOVEC",
    "%VLOAD",
    "%VSTORE",
    "%CONJUGATE",
    "%CLEAR_IMAGINARY",
    "%COMPLEX_JOIN",
    "%VLOADWITHINCX",
    "%VLOADWITHINCXV2",
    "%VSTOREWITHINCX",
    "%REDUCE_SUM",
    "%REDUCE_SUM_REAL_HV",
    "%REDUCE_MAX",
    "%REDUCE_MIN",
    "%REDUCE_HYPOT",
    "%IF",
    "%VFOR",
    "%VFOR_REAL",
    "%REDUCTION_BY_SUM",
    "%REDUCTION_BY_MAX",
    "%REDUCTION_BY_MIN",
    "%REDUCTION_BY_HYPOT",
    "%REDUCTION_BY_SSQ",
    "%VABS",
    "%ABS",
];

fn utf8_len(first: u8) -> usize {
    match first {
        b if b < 0x80 => 1,
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        _ => 2,
    }
}

/// Parses a parenthesized, comma-separated argument list starting at the
/// first `(` after `pos`, leaving `pos` just past the closing paren.
/// Nested parentheses inside an argument are kept intact.
fn parse_args(src: &str, pos: &mut usize) -> Result<Vec<String>> {
    let bytes = src.as_bytes();
    while *pos < bytes.len() && bytes[*pos] != b'(' {
        if !bytes[*pos].is_ascii_whitespace() {
            return Err(Error::invalid("directive expects an argument list"));
        }
        *pos += 1;
    }
    if *pos >= bytes.len() {
        return Err(Error::invalid("directive misses its argument list"));
    }
    *pos += 1;

    let mut args = Vec::new();
    let mut cur = String::new();
    let mut depth = 1usize;
    while *pos < bytes.len() {
        let c = bytes[*pos] as char;
        *pos += 1;
        match c {
            '(' => {
                depth += 1;
                cur.push(c);
            }
            ')' => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
                cur.push(c);
            }
            ',' if depth == 1 => {
                args.push(cur.trim().to_string());
                cur = String::new();
            }
            _ => cur.push(c),
        }
    }
    if depth != 0 {
        return Err(Error::invalid("unbalanced parentheses in directive"));
    }
    if !cur.trim().is_empty() || !args.is_empty() {
        args.push(cur.trim().to_string());
    }
    Ok(args)
}
