//! Argument value types.
//!
//! Unlike the identifiers in [`crate::identifiers`], these types carry payload
//! with invariants (a binary array's byte length always matches its shape,
//! floats sent as JSON are finite) and are what the encoder consumes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{RemoteRef, WireError};

// ---------------------------------------------------------------------------
// Binary arrays
// ---------------------------------------------------------------------------

/// Element type of a [`BinaryArray`], named the way typed arrays are on the
/// renderer side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    /// Unsigned 8-bit integer (`Uint8Array`).
    Uint8,
    /// Signed 8-bit integer (`Int8Array`).
    Int8,
    /// Unsigned 16-bit integer (`Uint16Array`).
    Uint16,
    /// Signed 16-bit integer (`Int16Array`).
    Int16,
    /// Unsigned 32-bit integer (`Uint32Array`).
    Uint32,
    /// Signed 32-bit integer (`Int32Array`).
    Int32,
    /// IEEE-754 single precision (`Float32Array`).
    Float32,
    /// IEEE-754 double precision (`Float64Array`).
    Float64,
}

impl ElementType {
    /// Width of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            Self::Uint8 | Self::Int8 => 1,
            Self::Uint16 | Self::Int16 => 2,
            Self::Uint32 | Self::Int32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uint8 => "uint8",
            Self::Int8 => "int8",
            Self::Uint16 => "uint16",
            Self::Int16 => "int16",
            Self::Uint32 => "uint32",
            Self::Int32 => "int32",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------

/// A typed, shaped block of bytes sent out-of-band next to a message.
///
/// Element data is little-endian. The byte length always equals
/// `product(shape) * element_type.size_in_bytes()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryArray {
    element_type: ElementType,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl BinaryArray {
    /// Creates a [`BinaryArray`], rejecting data whose length does not match
    /// the shape and element type.
    pub fn new(
        element_type: ElementType,
        shape: Vec<usize>,
        data: Vec<u8>,
    ) -> Result<Self, WireError> {
        let elements = shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| WireError::invalid(format!("shape {shape:?} overflows")))?;
        let expected = elements
            .checked_mul(element_type.size_in_bytes())
            .ok_or_else(|| WireError::invalid(format!("shape {shape:?} overflows")))?;
        if data.len() != expected {
            return Err(WireError::invalid(format!(
                "{element_type} array of shape {shape:?} needs {expected} bytes, got {}",
                data.len()
            )));
        }
        Ok(Self {
            element_type,
            shape,
            data,
        })
    }

    /// One-dimensional `float32` array.
    pub fn from_f32s(values: &[f32]) -> Self {
        Self {
            element_type: ElementType::Float32,
            shape: vec![values.len()],
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// One-dimensional `uint16` array (typically an index buffer).
    pub fn from_u16s(values: &[u16]) -> Self {
        Self {
            element_type: ElementType::Uint16,
            shape: vec![values.len()],
            data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        }
    }

    /// One-dimensional `uint8` array.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            element_type: ElementType::Uint8,
            shape: vec![bytes.len()],
            data: bytes.to_vec(),
        }
    }

    /// Returns the same data under a new shape with the same element count.
    pub fn reshape(self, shape: Vec<usize>) -> Result<Self, WireError> {
        Self::new(self.element_type, shape, self.data)
    }

    /// Type of every element in the array.
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// Dimensions, outermost first.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Raw little-endian element data.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of elements (product of the shape).
    pub fn len(&self) -> usize {
        self.data.len() / self.element_type.size_in_bytes()
    }

    /// Returns `true` if the array holds no elements.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Argument values
// ---------------------------------------------------------------------------

/// A fully available instruction argument.
///
/// Pending query results are not representable here; the proxy awaits them
/// and substitutes the resolved JSON before handing arguments to the encoder.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    /// Any JSON value, passed through unchanged.
    Json(Value),
    /// A float kept apart from JSON so that NaN and infinities are rejected
    /// with a clear error instead of being silently turned into `null`.
    Float(f64),
    /// Bytes moved to the out-of-band buffer list.
    Buffer(BinaryArray),
    /// A renderer object handle.
    Ref(RemoteRef),
}

impl ArgValue {
    /// Checks that the value has a wire representation.
    pub fn validate(&self) -> Result<(), WireError> {
        match self {
            Self::Float(v) if !v.is_finite() => Err(WireError::invalid(format!(
                "float argument {v} is not finite"
            ))),
            _ => Ok(()),
        }
    }
}

macro_rules! json_arg_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for ArgValue {
                fn from(value: $ty) -> Self {
                    Self::Json(Value::from(value))
                }
            }
        )*
    };
}

json_arg_from!(bool, i32, i64, u32, u64, usize, String, &str);

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<f32> for ArgValue {
    fn from(value: f32) -> Self {
        Self::Float(f64::from(value))
    }
}

impl From<Value> for ArgValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<BinaryArray> for ArgValue {
    fn from(value: BinaryArray) -> Self {
        Self::Buffer(value)
    }
}

impl From<RemoteRef> for ArgValue {
    fn from(value: RemoteRef) -> Self {
        Self::Ref(value)
    }
}

impl From<&RemoteRef> for ArgValue {
    fn from(value: &RemoteRef) -> Self {
        Self::Ref(*value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_array_rejects_length_mismatch() {
        let err = BinaryArray::new(ElementType::Float32, vec![2, 3], vec![0; 20]).unwrap_err();
        assert!(matches!(err, WireError::InvalidArgument { .. }));
        assert!(BinaryArray::new(ElementType::Float32, vec![2, 3], vec![0; 24]).is_ok());
    }

    #[test]
    fn float_constructor_is_little_endian() {
        let array = BinaryArray::from_f32s(&[1.0]);
        assert_eq!(array.as_bytes(), &1.0f32.to_le_bytes());
        assert_eq!(array.shape(), &[1]);
        assert_eq!(array.len(), 1);
    }

    #[test]
    fn reshape_keeps_element_count() {
        let array = BinaryArray::from_f32s(&[0.0; 16]);
        let matrix = array.clone().reshape(vec![4, 4]).unwrap();
        assert_eq!(matrix.shape(), &[4, 4]);
        assert!(array.reshape(vec![3, 3]).is_err());
    }

    #[test]
    fn non_finite_floats_are_invalid() {
        assert!(ArgValue::from(f64::NAN).validate().is_err());
        assert!(ArgValue::from(f32::INFINITY).validate().is_err());
        assert!(ArgValue::from(0.5f32).validate().is_ok());
    }
}
