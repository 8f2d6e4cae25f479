//! Kernel parameter-layout metadata.
//!
//! The launch path needs to know, per kernel, where each argument lives in
//! the marshalled block, which arguments are device pointers, and which
//! 8-byte scalars might be pointers in disguise (suspicious) until a launch
//! confirms them. Layouts are derived from the mangled entry name and cached
//! across runs in a line-oriented, `|`-delimited file.

use serde::{Deserialize, Serialize};
use vgpu_protocol::{RuntimeError, RuntimeResult};

/// Parameter layout and pointer classification of one kernel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelDescriptor {
    /// Mangled entry name, as loaded from the module.
    pub name: String,
    /// Demangled signature.
    pub signature: String,
    pub nb_params: usize,
    pub param_offsets: Vec<u64>,
    pub param_sizes: Vec<u64>,
    /// Const-pointer parameters: device memory the kernel reads.
    pub input_params: Vec<usize>,
    /// Mutable-pointer parameters: device memory the kernel writes.
    pub output_params: Vec<usize>,
    /// Parameters known to be read and written.
    pub inout_params: Vec<usize>,
    /// Pointer-sized scalars that may carry device addresses.
    pub suspicious_params: Vec<usize>,
    pub has_verified_params: bool,
    /// Confirmed suspicious parameters: (param index, offset in the
    /// marshalled block).
    pub confirmed_suspicious: Vec<(usize, u64)>,
    /// Constant-bank footprint of the marshalled block.
    pub cbank_param_size: u64,
}

impl KernelDescriptor {
    /// Derive a descriptor from a mangled entry name. Falls back to an
    /// opaque zero-parameter descriptor when the name does not demangle;
    /// such kernels can still launch with a caller-supplied block.
    pub fn from_mangled(mangled: &str) -> Self {
        let Some(dm) = demangle(mangled) else {
            return Self {
                name: mangled.to_string(),
                signature: mangled.to_string(),
                ..Default::default()
            };
        };

        let mut desc = Self {
            name: mangled.to_string(),
            signature: dm.signature(),
            nb_params: dm.params.len(),
            ..Default::default()
        };

        let mut offset = 0u64;
        for (idx, ty) in dm.params.iter().enumerate() {
            let (size, align) = ty.layout();
            offset = (offset + align - 1) & !(align - 1);
            desc.param_offsets.push(offset);
            desc.param_sizes.push(size);
            offset += size;

            match ty.pointer_class() {
                PointerClass::ConstPointer => desc.input_params.push(idx),
                PointerClass::MutPointer => desc.output_params.push(idx),
                PointerClass::MaybePointer => desc.suspicious_params.push(idx),
                PointerClass::Scalar => {}
            }
        }
        desc.cbank_param_size = offset;
        desc
    }

    /// Confirm a suspicious parameter as a device pointer. Idempotent.
    pub fn confirm_suspicious(&mut self, idx: usize, offset: u64) {
        if !self.confirmed_suspicious.iter().any(|&(i, _)| i == idx) {
            self.confirmed_suspicious.push((idx, offset));
        }
        self.has_verified_params = true;
    }

    /// Serialize as one cache line. Field order is fixed; the loader of an
    /// older runtime must be able to skip trailing additions, so new fields
    /// only ever append.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.name);
        out.push('|');
        out.push_str(&self.signature);
        out.push('|');
        out.push_str(&self.nb_params.to_string());
        out.push('|');
        for off in &self.param_offsets {
            out.push_str(&off.to_string());
            out.push('|');
        }
        for size in &self.param_sizes {
            out.push_str(&size.to_string());
            out.push('|');
        }
        for list in [&self.input_params, &self.output_params, &self.inout_params, &self.suspicious_params] {
            out.push_str(&list.len().to_string());
            out.push('|');
            for idx in list {
                out.push_str(&idx.to_string());
                out.push('|');
            }
        }
        if self.has_verified_params {
            out.push_str("1|");
            out.push_str(&self.confirmed_suspicious.len().to_string());
            out.push('|');
            for (idx, off) in &self.confirmed_suspicious {
                out.push_str(&idx.to_string());
                out.push('|');
                out.push_str(&off.to_string());
                out.push('|');
            }
        } else {
            out.push_str("0|");
        }
        out.push_str(&self.cbank_param_size.to_string());
        out
    }

    /// Parse one cache line. Any malformed field is `InvalidInput`.
    pub fn decode(line: &str) -> RuntimeResult<Self> {
        let mut fields = line.split('|');
        let mut next = || fields.next().ok_or(RuntimeError::InvalidInput);
        fn num<T: std::str::FromStr>(s: &str) -> RuntimeResult<T> {
            s.trim().parse().map_err(|_| RuntimeError::InvalidInput)
        }

        let name = next()?.to_string();
        let signature = next()?.to_string();
        let nb_params: usize = num(next()?)?;
        if nb_params > u16::MAX as usize {
            return Err(RuntimeError::InvalidInput);
        }

        let mut param_offsets = Vec::with_capacity(nb_params);
        for _ in 0..nb_params {
            param_offsets.push(num(next()?)?);
        }
        let mut param_sizes = Vec::with_capacity(nb_params);
        for _ in 0..nb_params {
            param_sizes.push(num(next()?)?);
        }

        let mut index_list = || -> RuntimeResult<Vec<usize>> {
            let n: usize = num(next()?)?;
            if n > nb_params {
                return Err(RuntimeError::InvalidInput);
            }
            let mut list = Vec::with_capacity(n);
            for _ in 0..n {
                list.push(num(next()?)?);
            }
            Ok(list)
        };
        let input_params = index_list()?;
        let output_params = index_list()?;
        let inout_params = index_list()?;
        let suspicious_params = index_list()?;

        let has_verified_params = match next()? {
            "0" => false,
            "1" => true,
            _ => return Err(RuntimeError::InvalidInput),
        };
        let mut confirmed_suspicious = Vec::new();
        if has_verified_params {
            let n: usize = num(next()?)?;
            if n > nb_params {
                return Err(RuntimeError::InvalidInput);
            }
            for _ in 0..n {
                let idx = num(next()?)?;
                let off = num(next()?)?;
                confirmed_suspicious.push((idx, off));
            }
        }
        let cbank_param_size = num(next()?)?;

        Ok(Self {
            name,
            signature,
            nb_params,
            param_offsets,
            param_sizes,
            input_params,
            output_params,
            inout_params,
            suspicious_params,
            has_verified_params,
            confirmed_suspicious,
            cbank_param_size,
        })
    }
}

enum PointerClass {
    ConstPointer,
    MutPointer,
    MaybePointer,
    Scalar,
}

/// Parameter types the launch path distinguishes.
#[derive(Debug, Clone, PartialEq)]
enum CType {
    Void,
    Bool,
    Char,
    SChar,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    LongLong,
    ULongLong,
    Float,
    Double,
    Pointer(Box<CType>),
    Const(Box<CType>),
}

impl CType {
    fn layout(&self) -> (u64, u64) {
        match self {
            CType::Void => (0, 1),
            CType::Bool | CType::Char | CType::SChar | CType::UChar => (1, 1),
            CType::Short | CType::UShort => (2, 2),
            CType::Int | CType::UInt | CType::Float => (4, 4),
            CType::Long | CType::ULong | CType::LongLong | CType::ULongLong | CType::Double => (8, 8),
            CType::Pointer(_) => (8, 8),
            CType::Const(inner) => inner.layout(),
        }
    }

    fn pointer_class(&self) -> PointerClass {
        match self {
            CType::Pointer(inner) => {
                if matches!(**inner, CType::Const(_)) {
                    PointerClass::ConstPointer
                } else {
                    PointerClass::MutPointer
                }
            }
            CType::Const(inner) => inner.pointer_class(),
            CType::Long | CType::ULong | CType::LongLong | CType::ULongLong => {
                PointerClass::MaybePointer
            }
            _ => PointerClass::Scalar,
        }
    }

    fn render(&self) -> String {
        match self {
            CType::Void => "void".into(),
            CType::Bool => "bool".into(),
            CType::Char => "char".into(),
            CType::SChar => "signed char".into(),
            CType::UChar => "unsigned char".into(),
            CType::Short => "short".into(),
            CType::UShort => "unsigned short".into(),
            CType::Int => "int".into(),
            CType::UInt => "unsigned int".into(),
            CType::Long => "long".into(),
            CType::ULong => "unsigned long".into(),
            CType::LongLong => "long long".into(),
            CType::ULongLong => "unsigned long long".into(),
            CType::Float => "float".into(),
            CType::Double => "double".into(),
            CType::Pointer(inner) => format!("{}*", inner.render()),
            CType::Const(inner) => format!("{} const", inner.render()),
        }
    }
}

struct Demangled {
    name: String,
    params: Vec<CType>,
}

impl Demangled {
    fn signature(&self) -> String {
        let rendered: Vec<String> = self.params.iter().map(|p| p.render()).collect();
        format!("{}({})", self.name, rendered.join(", "))
    }
}

/// Demangle the subset of the Itanium scheme kernels actually use: a plain
/// (non-nested) entry name followed by builtin, pointer, const-qualified and
/// substituted parameter types.
fn demangle(mangled: &str) -> Option<Demangled> {
    let rest = mangled.strip_prefix("_Z")?;
    let bytes = rest.as_bytes();

    let mut pos = 0;
    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
        pos += 1;
    }
    let name_len: usize = rest[..pos].parse().ok()?;
    let name = rest.get(pos..pos + name_len)?.to_string();
    pos += name_len;

    let mut parser = TypeParser { bytes, pos, subs: Vec::new() };
    let mut params = Vec::new();
    while parser.pos < parser.bytes.len() {
        params.push(parser.parse_type()?);
    }
    // `f(void)` mangles as a single `v` parameter.
    if params == [CType::Void] {
        params.clear();
    }
    Some(Demangled { name, params })
}

struct TypeParser<'a> {
    bytes: &'a [u8],
    pos: usize,
    /// Substitution table: compound types in order of completion.
    subs: Vec<CType>,
}

impl TypeParser<'_> {
    fn parse_type(&mut self) -> Option<CType> {
        let c = *self.bytes.get(self.pos)?;
        self.pos += 1;
        let ty = match c {
            b'P' => {
                let inner = self.parse_type()?;
                let ty = CType::Pointer(Box::new(inner));
                self.subs.push(ty.clone());
                ty
            }
            b'K' => {
                let inner = self.parse_type()?;
                let ty = CType::Const(Box::new(inner));
                self.subs.push(ty.clone());
                ty
            }
            b'S' => return self.parse_substitution(),
            b'v' => CType::Void,
            b'b' => CType::Bool,
            b'c' => CType::Char,
            b'a' => CType::SChar,
            b'h' => CType::UChar,
            b's' => CType::Short,
            b't' => CType::UShort,
            b'i' => CType::Int,
            b'j' => CType::UInt,
            b'l' => CType::Long,
            b'm' => CType::ULong,
            b'x' => CType::LongLong,
            b'y' => CType::ULongLong,
            b'f' => CType::Float,
            b'd' => CType::Double,
            _ => return None,
        };
        Some(ty)
    }

    /// `S_` is the first substitution entry, `S0_`..`S9_`/`SA_`.. the rest
    /// (base 36, offset by one).
    fn parse_substitution(&mut self) -> Option<CType> {
        let c = *self.bytes.get(self.pos)?;
        if c == b'_' {
            self.pos += 1;
            return self.subs.first().cloned();
        }
        let mut seq: usize = 0;
        while let Some(&c) = self.bytes.get(self.pos) {
            if c == b'_' {
                self.pos += 1;
                return self.subs.get(seq + 1).cloned();
            }
            let digit = match c {
                b'0'..=b'9' => (c - b'0') as usize,
                b'A'..=b'Z' => (c - b'A') as usize + 10,
                _ => return None,
            };
            seq = seq * 36 + digit;
            self.pos += 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demangles_pointer_heavy_kernel() {
        let desc = KernelDescriptor::from_mangled("_Z8kernel_1PKfPfS1_S1_i");
        assert_eq!(desc.signature, "kernel_1(float const*, float*, float*, float*, int)");
        assert_eq!(desc.nb_params, 5);
        assert_eq!(desc.param_sizes, vec![8, 8, 8, 8, 4]);
        assert_eq!(desc.param_offsets, vec![0, 8, 16, 24, 32]);
        assert_eq!(desc.input_params, vec![0]);
        assert_eq!(desc.output_params, vec![1, 2, 3]);
        assert!(desc.inout_params.is_empty());
        assert!(desc.suspicious_params.is_empty());
        assert_eq!(desc.cbank_param_size, 36);
    }

    #[test]
    fn wide_scalars_are_suspicious() {
        let desc = KernelDescriptor::from_mangled("_Z6gatherPflj");
        assert_eq!(desc.signature, "gather(float*, long, unsigned int)");
        assert_eq!(desc.output_params, vec![0]);
        assert_eq!(desc.suspicious_params, vec![1]);
    }

    #[test]
    fn alignment_padding_in_offsets() {
        // int, then double: the double aligns to 8.
        let desc = KernelDescriptor::from_mangled("_Z3accid");
        assert_eq!(desc.param_offsets, vec![0, 8]);
        assert_eq!(desc.cbank_param_size, 16);
    }

    #[test]
    fn undemanglable_name_falls_back() {
        let desc = KernelDescriptor::from_mangled("plain_c_kernel");
        assert_eq!(desc.name, "plain_c_kernel");
        assert_eq!(desc.nb_params, 0);
    }

    #[test]
    fn cache_line_round_trip() {
        for mangled in ["_Z3addPfi", "_Z4axpyPKfPff", "_Z8kernel_1PKfPfS1_S1_i"] {
            let mut desc = KernelDescriptor::from_mangled(mangled);
            desc.confirm_suspicious(0, 0);
            let line = desc.encode();
            let back = KernelDescriptor::decode(&line).unwrap();
            assert_eq!(back, desc, "round trip mismatch for {mangled}");
        }
    }

    #[test]
    fn unverified_descriptor_round_trip() {
        let desc = KernelDescriptor::from_mangled("_Z6gatherPflj");
        let back = KernelDescriptor::decode(&desc.encode()).unwrap();
        assert_eq!(back, desc);
        assert!(!back.has_verified_params);
    }

    #[test]
    fn malformed_line_is_invalid_input() {
        assert_eq!(
            KernelDescriptor::decode("name|sig|notanumber|0"),
            Err(RuntimeError::InvalidInput)
        );
        assert_eq!(KernelDescriptor::decode(""), Err(RuntimeError::InvalidInput));
        // Truncated index list.
        assert_eq!(
            KernelDescriptor::decode("n|s|1|0|8|2|0"),
            Err(RuntimeError::InvalidInput)
        );
    }
}
