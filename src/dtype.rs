//! Element types and scalar values shared by views, accumulators and kernels

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

/// Element type of a view, accumulator or scalar kernel argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
}

impl DataType {
    /// Size of one element in bytes
    pub fn size(self) -> usize {
        match self {
            DataType::Bool | DataType::Int8 | DataType::UInt8 => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float32 => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Float64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    pub fn is_integer(self) -> bool {
        !self.is_float() && self != DataType::Bool
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64
        ) || self.is_float()
    }

    /// Native type name in generated source
    pub fn cpp_name(self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Int8 => "int8_t",
            DataType::Int16 => "int16_t",
            DataType::Int32 => "int32_t",
            DataType::Int64 => "int64_t",
            DataType::UInt8 => "uint8_t",
            DataType::UInt16 => "uint16_t",
            DataType::UInt32 => "uint32_t",
            DataType::UInt64 => "uint64_t",
            DataType::Float32 => "float",
            DataType::Float64 => "double",
        }
    }

    /// Resolve a scalar type name as written in kernel annotations
    ///
    /// A bare `float` is the Python float, a double. Qualified names such as
    /// `pk.float` follow [`DataType::element_from_name`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "float" => Some(DataType::Float64),
            _ => Self::element_from_name(name),
        }
    }

    /// Resolve an element type name of a view, scratch view or size query
    ///
    /// `float` is single precision and `double` double precision, as in C++.
    pub fn element_from_name(name: &str) -> Option<Self> {
        let name = name.rsplit('.').next().unwrap_or(name);
        let dtype = match name {
            "bool" => DataType::Bool,
            "int8" => DataType::Int8,
            "int16" => DataType::Int16,
            "int32" | "int" => DataType::Int32,
            "int64" => DataType::Int64,
            "uint8" => DataType::UInt8,
            "uint16" => DataType::UInt16,
            "uint32" => DataType::UInt32,
            "uint64" => DataType::UInt64,
            "float32" | "float" => DataType::Float32,
            "float64" | "double" => DataType::Float64,
            _ => return None,
        };
        Some(dtype)
    }

    /// Like [`DataType::element_from_name`] but reports unresolvable names as type errors
    pub fn resolve(name: &str) -> KernelResult<Self> {
        if name.trim().is_empty() {
            return Err(KernelError::type_error("element type is unspecified"));
        }
        Self::element_from_name(name.trim())
            .ok_or_else(|| KernelError::type_error(format!("unknown element type '{}'", name)))
    }

    /// Result type of a binary arithmetic operation between `self` and `other`
    pub fn promote(self, other: DataType) -> DataType {
        match (self.is_float(), other.is_float()) {
            (true, true) => self.max(other),
            (true, false) => self,
            (false, true) => other,
            (false, false) => {
                // Narrow integers and bools promote to int32 first
                let widen = |t: DataType| if t.size() < 4 { DataType::Int32 } else { t };
                let rank = |t: DataType| (t.size(), !t.is_signed());
                let (a, b) = (widen(self), widen(other));
                if rank(a) >= rank(b) {
                    a
                } else {
                    b
                }
            }
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::Bool => "bool",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Int32 => "int32",
            DataType::Int64 => "int64",
            DataType::UInt8 => "uint8",
            DataType::UInt16 => "uint16",
            DataType::UInt32 => "uint32",
            DataType::UInt64 => "uint64",
            DataType::Float32 => "float32",
            DataType::Float64 => "float64",
        };
        write!(f, "{}", name)
    }
}

/// A scalar value crossing the host/kernel boundary
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Scalar {
    /// Natural element type of the value
    pub fn dtype(self) -> DataType {
        match self {
            Scalar::Bool(_) => DataType::Bool,
            Scalar::Int(_) => DataType::Int32,
            Scalar::Float(_) => DataType::Float64,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::Bool(b) => b as i64 as f64,
            Scalar::Int(n) => n as f64,
            Scalar::Float(x) => x,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Scalar::Bool(b) => b as i64,
            Scalar::Int(n) => n,
            Scalar::Float(x) => x as i64,
        }
    }

    pub fn as_bool(self) -> bool {
        match self {
            Scalar::Bool(b) => b,
            Scalar::Int(n) => n != 0,
            Scalar::Float(x) => x != 0.0,
        }
    }

    /// Convert to the representation of `dtype`, wrapping integers like a native cast
    pub fn cast(self, dtype: DataType) -> Scalar {
        match dtype {
            DataType::Bool => Scalar::Bool(self.as_bool()),
            DataType::Float32 => Scalar::Float(self.as_f64() as f32 as f64),
            DataType::Float64 => Scalar::Float(self.as_f64()),
            DataType::Int8 => Scalar::Int(self.as_i64() as i8 as i64),
            DataType::Int16 => Scalar::Int(self.as_i64() as i16 as i64),
            DataType::Int32 => Scalar::Int(self.as_i64() as i32 as i64),
            DataType::Int64 => Scalar::Int(self.as_i64()),
            DataType::UInt8 => Scalar::Int(self.as_i64() as u8 as i64),
            DataType::UInt16 => Scalar::Int(self.as_i64() as u16 as i64),
            DataType::UInt32 => Scalar::Int(self.as_i64() as u32 as i64),
            DataType::UInt64 => Scalar::Int(self.as_i64()),
        }
    }

    /// Raw 64-bit pattern of the value stored as `dtype`
    pub fn to_bits(self, dtype: DataType) -> u64 {
        match self.cast(dtype) {
            Scalar::Bool(b) => b as u64,
            Scalar::Int(n) => n as u64,
            Scalar::Float(x) if dtype == DataType::Float32 => (x as f32).to_bits() as u64,
            Scalar::Float(x) => x.to_bits(),
        }
    }

    /// Inverse of [`Scalar::to_bits`]
    pub fn from_bits(bits: u64, dtype: DataType) -> Scalar {
        match dtype {
            DataType::Bool => Scalar::Bool(bits != 0),
            DataType::Float32 => Scalar::Float(f32::from_bits(bits as u32) as f64),
            DataType::Float64 => Scalar::Float(f64::from_bits(bits)),
            _ => Scalar::Int(bits as i64),
        }
    }

    /// Native little-endian bytes of the value stored as `dtype`
    pub fn to_ne_bytes(self, dtype: DataType) -> Vec<u8> {
        let bits = self.to_bits(dtype);
        match dtype.size() {
            1 => vec![bits as u8],
            2 => (bits as u16).to_ne_bytes().to_vec(),
            4 => (bits as u32).to_ne_bytes().to_vec(),
            _ => bits.to_ne_bytes().to_vec(),
        }
    }

    /// Decode a value of `dtype` from native bytes
    pub fn from_ne_bytes(bytes: &[u8], dtype: DataType) -> Scalar {
        let mut raw = [0u8; 8];
        raw[..bytes.len()].copy_from_slice(bytes);
        let bits = match dtype.size() {
            1 => raw[0] as u64,
            2 => u16::from_ne_bytes([raw[0], raw[1]]) as u64,
            4 => u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64,
            _ => u64::from_ne_bytes(raw),
        };
        // Sign-extend narrow signed integers
        let bits = match dtype {
            DataType::Int8 => bits as u8 as i8 as i64 as u64,
            DataType::Int16 => bits as u16 as i16 as i64 as u64,
            DataType::Int32 => bits as u32 as i32 as i64 as u64,
            _ => bits,
        };
        Scalar::from_bits(bits, dtype)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<f32> for Scalar {
    fn from(value: f32) -> Self {
        Scalar::Float(value as f64)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Scalar::Int(value as i64)
    }
}

impl From<usize> for Scalar {
    fn from(value: usize) -> Self {
        Scalar::Int(value as i64)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

impl std::fmt::Display for Scalar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(n) => write!(f, "{}", n),
            Scalar::Float(x) => write!(f, "{}", x),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(DataType::from_name("pk.double"), Some(DataType::Float64));
        assert_eq!(DataType::from_name("int"), Some(DataType::Int32));
        assert_eq!(DataType::from_name("float"), Some(DataType::Float64));
        assert_eq!(DataType::from_name("pk.float"), Some(DataType::Float32));
        assert_eq!(DataType::element_from_name("float"), Some(DataType::Float32));
        assert_eq!(DataType::element_from_name("pk.double"), Some(DataType::Float64));
        assert_eq!(DataType::resolve("float").unwrap(), DataType::Float32);
        assert_eq!(DataType::from_name("complex"), None);
        assert!(DataType::resolve("").is_err());
        assert_eq!(DataType::Float32.cpp_name(), "float");
    }

    #[test]
    fn test_promotion() {
        assert_eq!(DataType::Int32.promote(DataType::Float32), DataType::Float32);
        assert_eq!(DataType::Float32.promote(DataType::Float64), DataType::Float64);
        assert_eq!(DataType::Int8.promote(DataType::Int16), DataType::Int32);
        assert_eq!(DataType::Int32.promote(DataType::Int64), DataType::Int64);
        assert_eq!(DataType::Int64.promote(DataType::UInt64), DataType::UInt64);
    }

    #[test]
    fn test_cast_wraps_like_native() {
        assert_eq!(Scalar::Int(300).cast(DataType::UInt8), Scalar::Int(44));
        assert_eq!(Scalar::Float(2.9).cast(DataType::Int32), Scalar::Int(2));
        assert_eq!(Scalar::Int(-1).cast(DataType::Bool), Scalar::Bool(true));
    }

    #[test]
    fn test_bits_and_bytes() {
        for dtype in [DataType::Float32, DataType::Int16, DataType::Int64, DataType::Float64] {
            let value = Scalar::Int(-7).cast(dtype);
            assert_eq!(Scalar::from_bits(value.to_bits(dtype), dtype).as_f64(), -7.0);
            let bytes = value.to_ne_bytes(dtype);
            assert_eq!(bytes.len(), dtype.size());
            assert_eq!(Scalar::from_ne_bytes(&bytes, dtype).as_f64(), -7.0);
        }
    }
}
