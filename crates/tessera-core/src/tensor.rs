//! Host tensors exchanged with a session.
//!
//! A [`Tensor`] owns its elements in a typed vector so that typed views never
//! need realignment. Kernels never see a `Tensor` directly; the execution frame
//! hands them [`crate::kernel::TensorView`] views instead.

use bytemuck::Pod;

use crate::error::{CoreError, Result};
use crate::types::{checked_byte_size, checked_numel, numel, DataType};

/// Rust element types that map onto a [`DataType`].
pub trait Element: Pod + Send + Sync + 'static {
    /// The matching element type.
    const DTYPE: DataType;
}

impl Element for f32 {
    const DTYPE: DataType = DataType::F32;
}
impl Element for f64 {
    const DTYPE: DataType = DataType::F64;
}
impl Element for i32 {
    const DTYPE: DataType = DataType::I32;
}
impl Element for i64 {
    const DTYPE: DataType = DataType::I64;
}
impl Element for u8 {
    const DTYPE: DataType = DataType::U8;
}

/// Whether elements of type `T` may be used to view data of type `dtype`.
///
/// Booleans are stored as one byte per element and viewed as `u8`.
pub fn element_matches<T: Element>(dtype: DataType) -> bool {
    T::DTYPE == dtype || (T::DTYPE == DataType::U8 && dtype == DataType::Bool)
}

/// Typed element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    /// `f32` elements.
    F32(Vec<f32>),
    /// `f64` elements.
    F64(Vec<f64>),
    /// `i32` elements.
    I32(Vec<i32>),
    /// `i64` elements.
    I64(Vec<i64>),
    /// `u8` elements.
    U8(Vec<u8>),
    /// Booleans, one byte each (0 or 1).
    Bool(Vec<u8>),
}

impl TensorData {
    fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::U8(v) | TensorData::Bool(v) => v.len(),
        }
    }

    fn dtype(&self) -> DataType {
        match self {
            TensorData::F32(_) => DataType::F32,
            TensorData::F64(_) => DataType::F64,
            TensorData::I32(_) => DataType::I32,
            TensorData::I64(_) => DataType::I64,
            TensorData::U8(_) => DataType::U8,
            TensorData::Bool(_) => DataType::Bool,
        }
    }
}

/// An owned, dense, row-major host tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: TensorData,
    shape: Vec<usize>,
}

impl Tensor {
    /// Create a tensor from typed storage, checking the element count.
    pub fn new(data: TensorData, shape: Vec<usize>) -> Result<Self> {
        let expected = checked_numel(&shape).ok_or_else(|| {
            CoreError::invalid_argument(format!("shape {shape:?} has too many elements"))
        })?;
        if data.len() != expected {
            return Err(CoreError::invalid_argument(format!(
                "tensor data has {} elements but shape {:?} needs {}",
                data.len(),
                shape,
                expected
            )));
        }
        Ok(Self { data, shape })
    }

    /// Create an `f32` tensor.
    ///
    /// ```rust
    /// use tessera_core::Tensor;
    ///
    /// let t = Tensor::from_f32(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2])?;
    /// assert_eq!(t.shape(), &[2, 2]);
    /// # Ok::<(), tessera_core::CoreError>(())
    /// ```
    pub fn from_f32(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        Self::new(TensorData::F32(data), shape)
    }

    /// Create an `f64` tensor.
    pub fn from_f64(data: Vec<f64>, shape: Vec<usize>) -> Result<Self> {
        Self::new(TensorData::F64(data), shape)
    }

    /// Create an `i32` tensor.
    pub fn from_i32(data: Vec<i32>, shape: Vec<usize>) -> Result<Self> {
        Self::new(TensorData::I32(data), shape)
    }

    /// Create an `i64` tensor.
    pub fn from_i64(data: Vec<i64>, shape: Vec<usize>) -> Result<Self> {
        Self::new(TensorData::I64(data), shape)
    }

    /// Create a `u8` tensor.
    pub fn from_u8(data: Vec<u8>, shape: Vec<usize>) -> Result<Self> {
        Self::new(TensorData::U8(data), shape)
    }

    /// Create a boolean tensor.
    pub fn from_bool(data: Vec<bool>, shape: Vec<usize>) -> Result<Self> {
        Self::new(
            TensorData::Bool(data.into_iter().map(u8::from).collect()),
            shape,
        )
    }

    /// Create a zero-filled tensor.
    pub fn zeros(dtype: DataType, shape: Vec<usize>) -> Self {
        let n = numel(&shape);
        let data = match dtype {
            DataType::F32 => TensorData::F32(vec![0.0; n]),
            DataType::F64 => TensorData::F64(vec![0.0; n]),
            DataType::I32 => TensorData::I32(vec![0; n]),
            DataType::I64 => TensorData::I64(vec![0; n]),
            DataType::U8 => TensorData::U8(vec![0; n]),
            DataType::Bool => TensorData::Bool(vec![0; n]),
        };
        Self { data, shape }
    }

    /// Rebuild a tensor from raw little-endian bytes of the given type.
    pub fn from_bytes(dtype: DataType, shape: Vec<usize>, bytes: &[u8]) -> Result<Self> {
        let expected = checked_byte_size(&shape, dtype)
            .ok_or_else(|| CoreError::internal(format!("shape {shape:?} overflows usize")))?;
        if bytes.len() != expected {
            return Err(CoreError::internal(format!(
                "expected {} bytes for {} tensor of shape {:?}, got {}",
                expected,
                dtype,
                shape,
                bytes.len()
            )));
        }
        let data = match dtype {
            DataType::F32 => TensorData::F32(bytemuck::pod_collect_to_vec(bytes)),
            DataType::F64 => TensorData::F64(bytemuck::pod_collect_to_vec(bytes)),
            DataType::I32 => TensorData::I32(bytemuck::pod_collect_to_vec(bytes)),
            DataType::I64 => TensorData::I64(bytemuck::pod_collect_to_vec(bytes)),
            DataType::U8 => TensorData::U8(bytes.to_vec()),
            DataType::Bool => TensorData::Bool(bytes.to_vec()),
        };
        Ok(Self { data, shape })
    }

    /// Element type.
    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    /// Dimensions.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Size of the element data in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.numel() * self.dtype().size_in_bytes()
    }

    /// Raw storage.
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Element data as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.data {
            TensorData::F32(v) => bytemuck::cast_slice(v),
            TensorData::F64(v) => bytemuck::cast_slice(v),
            TensorData::I32(v) => bytemuck::cast_slice(v),
            TensorData::I64(v) => bytemuck::cast_slice(v),
            TensorData::U8(v) | TensorData::Bool(v) => v,
        }
    }

    /// Typed view of the elements; `None` if `T` does not match the dtype.
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        if !element_matches::<T>(self.dtype()) {
            return None;
        }
        bytemuck::try_cast_slice(self.as_bytes()).ok()
    }

    /// Copy out `f32` elements.
    pub fn to_vec_f32(&self) -> Result<Vec<f32>> {
        self.as_slice::<f32>().map(<[f32]>::to_vec).ok_or_else(|| {
            CoreError::invalid_argument(format!("tensor is {}, not F32", self.dtype()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_count_checked() {
        let err = Tensor::from_f32(vec![1.0, 2.0, 3.0], vec![2, 2]).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument(_)));
    }

    #[test]
    fn test_bytes_roundtrip_preserves_values() {
        let t = Tensor::from_i64(vec![-3, 7, 1 << 40], vec![3]).unwrap();
        let back = Tensor::from_bytes(DataType::I64, vec![3], t.as_bytes()).unwrap();
        assert_eq!(t, back);
    }

    #[test]
    fn test_typed_view_checks_dtype() {
        let t = Tensor::from_f32(vec![1.0, 2.0], vec![2]).unwrap();
        assert_eq!(t.as_slice::<f32>(), Some(&[1.0f32, 2.0][..]));
        assert!(t.as_slice::<i32>().is_none());

        let b = Tensor::from_bool(vec![true, false], vec![2]).unwrap();
        assert_eq!(b.dtype(), DataType::Bool);
        assert_eq!(b.as_slice::<u8>(), Some(&[1u8, 0][..]));
    }

    #[test]
    fn test_scalar_tensor() {
        let t = Tensor::from_f32(vec![5.0], vec![]).unwrap();
        assert_eq!(t.numel(), 1);
        assert_eq!(t.size_in_bytes(), 4);
    }
}
