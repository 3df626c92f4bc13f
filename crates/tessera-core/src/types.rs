//! Fundamental data types shared across the runtime.

use std::fmt;
use std::ptr::NonNull;

use serde::{Deserialize, Serialize};

/// Index of a node in its graph.
pub type NodeId = usize;

/// Index of a value in its graph's value table.
pub type ValueId = usize;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// 8-bit unsigned integer.
    U8,
    /// Boolean stored as one byte.
    Bool,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F64 | DataType::I64 => 8,
            DataType::U8 | DataType::Bool => 1,
        }
    }

    /// Whether arithmetic kernels accept this type.
    pub fn is_numeric(self) -> bool {
        !matches!(self, DataType::Bool)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One dimension of a declared shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    /// Known extent.
    Fixed(usize),
    /// Extent bound at run time.
    Symbolic(String),
}

/// Declared shape of a graph value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape(pub Vec<Dim>);

impl Shape {
    /// A fully static shape.
    pub fn fixed(dims: impl IntoIterator<Item = usize>) -> Self {
        Self(dims.into_iter().map(Dim::Fixed).collect())
    }

    /// A rank-0 shape.
    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Concrete dimensions if every dim is fixed.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        self.0
            .iter()
            .map(|d| match d {
                Dim::Fixed(n) => Some(*n),
                Dim::Symbolic(_) => None,
            })
            .collect()
    }

    /// Whether a concrete shape is an instance of this declared shape.
    pub fn accepts(&self, dims: &[usize]) -> bool {
        self.0.len() == dims.len()
            && self.0.iter().zip(dims).all(|(d, &n)| match d {
                Dim::Fixed(f) => *f == n,
                Dim::Symbolic(_) => true,
            })
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match d {
                Dim::Fixed(n) => write!(f, "{n}")?,
                Dim::Symbolic(s) => write!(f, "{s}")?,
            }
        }
        write!(f, "]")
    }
}

/// Number of elements of a concrete shape.
pub fn numel(dims: &[usize]) -> usize {
    dims.iter().product()
}

/// Element count of a concrete shape, or `None` on overflow.
pub fn checked_numel(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// Storage bytes of a concrete shape, or `None` if it does not fit in `usize`.
pub fn checked_byte_size(dims: &[usize], dtype: DataType) -> Option<usize> {
    checked_numel(dims)?.checked_mul(dtype.size_in_bytes())
}

/// Attribute value attached to a node or to the whole module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// Integer attribute.
    Int(i64),
    /// Float attribute.
    Float(f64),
    /// String attribute.
    String(String),
    /// Integer list attribute.
    Ints(Vec<i64>),
    /// Float list attribute.
    Floats(Vec<f64>),
    /// Tensor shape attribute.
    Shape(Vec<usize>),
}

impl AttributeValue {
    /// The string payload, if this is a string attribute.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// The integer payload, if this is an integer attribute.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// Identity of an execution provider: its type tag and instance name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderKey {
    /// Provider type, e.g. `"cpu"`.
    pub provider_type: String,
    /// Instance name, unique per type.
    pub name: String,
}

impl ProviderKey {
    /// Create a provider key.
    pub fn new(provider_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            provider_type: provider_type.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider_type, self.name)
    }
}

/// Where a buffer lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryType {
    /// Host memory.
    SystemRAM,
    /// Accelerator memory.
    Device,
}

/// Allocator usage report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    /// Capacity in bytes (`usize::MAX` when unbounded).
    pub total_bytes: usize,
    /// Bytes currently handed out.
    pub allocated_bytes: usize,
    /// High-water mark of `allocated_bytes`.
    pub peak_bytes: usize,
}

/// A raw allocation handed out by a [`crate::TensorAllocator`].
///
/// The buffer does not free itself; it must be returned to the allocator that
/// produced it.
#[derive(Debug)]
pub struct TensorBuffer {
    /// Start of the allocation. Dangling (but aligned) when `size` is zero.
    pub ptr: NonNull<u8>,
    /// Usable size in bytes.
    pub size: usize,
    /// Alignment the allocation was made with.
    pub alignment: usize,
    /// Memory kind.
    pub memory_type: MemoryType,
}

// SAFETY: a TensorBuffer is an owned allocation; access to its bytes is
// coordinated by the execution frame that holds it.
unsafe impl Send for TensorBuffer {}
// SAFETY: see above; the handle itself is immutable.
unsafe impl Sync for TensorBuffer {}

impl TensorBuffer {
    /// A zero-sized buffer that owns no memory.
    pub fn empty(alignment: usize, memory_type: MemoryType) -> Self {
        Self {
            ptr: dangling_aligned(alignment),
            size: 0,
            alignment,
            memory_type,
        }
    }

    /// Whether the buffer owns no memory.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// An aligned, non-null pointer that must never be dereferenced.
pub fn dangling_aligned(alignment: usize) -> NonNull<u8> {
    let alignment = alignment.max(1);
    // Any non-zero multiple of the alignment is a valid dangling address.
    NonNull::new(alignment as *mut u8).unwrap_or(NonNull::dangling())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_sizes() {
        assert_eq!(DataType::F32.size_in_bytes(), 4);
        assert_eq!(DataType::I64.size_in_bytes(), 8);
        assert_eq!(DataType::Bool.size_in_bytes(), 1);
        assert!(!DataType::Bool.is_numeric());
    }

    #[test]
    fn test_shape_accepts() {
        let shape = Shape(vec![Dim::Symbolic("N".into()), Dim::Fixed(3)]);
        assert!(shape.accepts(&[7, 3]));
        assert!(!shape.accepts(&[7, 4]));
        assert!(!shape.accepts(&[3]));
        assert_eq!(shape.static_dims(), None);
        assert_eq!(Shape::fixed([2, 3]).static_dims(), Some(vec![2, 3]));
        assert_eq!(shape.to_string(), "[N, 3]");
    }

    #[test]
    fn test_dangling_is_aligned() {
        let ptr = dangling_aligned(64);
        assert_eq!(ptr.as_ptr() as usize % 64, 0);
    }
}
