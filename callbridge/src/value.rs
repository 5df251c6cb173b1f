//! Language-neutral values exchanged between host and worker.
//!
//! A [`Value`] is what a handler receives and returns. Numeric arrays are not
//! modelled as nested lists: an [`NdArray`] is a flat little-endian buffer
//! tagged with its [`ElementType`] and shape, so element type and
//! dimensions survive the trip across the bridge exactly.

use std::fmt;

use bytes::{Bytes, BytesMut};
use indexmap::IndexMap;

/// Highest array rank the bridge accepts.
pub const MAX_DIMS: usize = 32;

/// Ordered string-keyed mapping. Keys are unique, iteration follows insertion order.
pub type Mapping = IndexMap<String, Value>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValueError {
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("missing key '{0}'")]
    MissingKey(String),

    #[error("cannot read {requested} elements from a {actual} array")]
    ElementTypeMismatch {
        requested: ElementType,
        actual: ElementType,
    },

    #[error("shape {shape:?} holds {expected} elements but {actual} were supplied")]
    ShapeMismatch {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("shape {0:?} overflows the addressable element count")]
    ShapeOverflow(Vec<usize>),

    #[error("array rank {0} exceeds the maximum of {max}", max = MAX_DIMS)]
    TooManyDimensions(usize),
}

impl From<std::convert::Infallible> for ValueError {
    fn from(never: std::convert::Infallible) -> Self {
        match never {}
    }
}

/// Element type of an [`NdArray`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl ElementType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::Int16 => 2,
            Self::Int32 | Self::Float32 => 4,
            Self::Int64 | Self::Float64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Int16 => "int16",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "int16" => Some(Self::Int16),
            "int32" => Some(Self::Int32),
            "int64" => Some(Self::Int64),
            "float32" => Some(Self::Float32),
            "float64" => Some(Self::Float64),
            _ => None,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Native numeric type that can live in an [`NdArray`].
pub trait Element: Copy + fmt::Display + sealed::Sealed {
    const ELEMENT_TYPE: ElementType;

    fn write_le(self, dst: &mut BytesMut);

    /// Reads one element from exactly `ELEMENT_TYPE.size()` bytes.
    fn read_le(src: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Element for $ty {
                const ELEMENT_TYPE: ElementType = ElementType::$variant;

                fn write_le(self, dst: &mut BytesMut) {
                    dst.extend_from_slice(&self.to_le_bytes());
                }

                fn read_le(src: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(src);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_element!(i16 => Int16, i32 => Int32, i64 => Int64, f32 => Float32, f64 => Float64);

/// Number of elements a shape addresses. The empty shape is a scalar (one element).
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
}

/// Dense row-major numeric array.
///
/// Invariant: `data.len() == element_count(shape) * element_type.size()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdArray {
    element_type: ElementType,
    shape: Vec<usize>,
    data: Bytes,
}

impl NdArray {
    /// Build an array from native values laid out in row-major order.
    pub fn new<T: Element>(shape: Vec<usize>, values: Vec<T>) -> Result<Self, ValueError> {
        let expected = Self::check_shape(&shape)?;
        if expected != values.len() {
            return Err(ValueError::ShapeMismatch {
                shape,
                expected,
                actual: values.len(),
            });
        }

        let mut data = BytesMut::with_capacity(values.len() * T::ELEMENT_TYPE.size());
        for value in values {
            value.write_le(&mut data);
        }

        Ok(Self {
            element_type: T::ELEMENT_TYPE,
            shape,
            data: data.freeze(),
        })
    }

    /// One-dimensional array.
    pub fn vector<T: Element>(values: Vec<T>) -> Self {
        let shape = vec![values.len()];
        let mut data = BytesMut::with_capacity(values.len() * T::ELEMENT_TYPE.size());
        for value in values {
            value.write_le(&mut data);
        }
        Self {
            element_type: T::ELEMENT_TYPE,
            shape,
            data: data.freeze(),
        }
    }

    /// Two-dimensional array from rows. All rows must have the same length.
    pub fn from_rows<T: Element>(rows: Vec<Vec<T>>) -> Result<Self, ValueError> {
        let cols = rows.first().map_or(0, Vec::len);
        let shape = vec![rows.len(), cols];
        let values: Vec<T> = rows.into_iter().flatten().collect();
        Self::new(shape, values)
    }

    /// Wrap an already-encoded little-endian buffer.
    pub fn from_raw(
        element_type: ElementType,
        shape: Vec<usize>,
        data: Bytes,
    ) -> Result<Self, ValueError> {
        let count = Self::check_shape(&shape)?;
        let expected = count
            .checked_mul(element_type.size())
            .ok_or_else(|| ValueError::ShapeOverflow(shape.clone()))?;
        if data.len() != expected {
            return Err(ValueError::ShapeMismatch {
                shape,
                expected: count,
                actual: data.len() / element_type.size(),
            });
        }
        Ok(Self {
            element_type,
            shape,
            data,
        })
    }

    fn check_shape(shape: &[usize]) -> Result<usize, ValueError> {
        if shape.len() > MAX_DIMS {
            return Err(ValueError::TooManyDimensions(shape.len()));
        }
        element_count(shape).ok_or_else(|| ValueError::ShapeOverflow(shape.to_vec()))
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len() / self.element_type.size()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw little-endian element bytes.
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    /// Copy the elements out as `T`. `T` must match the element type exactly;
    /// no widening or narrowing happens.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, ValueError> {
        if T::ELEMENT_TYPE != self.element_type {
            return Err(ValueError::ElementTypeMismatch {
                requested: T::ELEMENT_TYPE,
                actual: self.element_type,
            });
        }
        Ok(self
            .data
            .chunks_exact(self.element_type.size())
            .map(T::read_le)
            .collect())
    }

    /// Elements converted to `f64` for numeric comparison. `int64` values
    /// beyond 2^53 lose precision here.
    pub fn to_f64_lossy(&self) -> Vec<f64> {
        let size = self.element_type.size();
        self.data
            .chunks_exact(size)
            .map(|chunk| match self.element_type {
                ElementType::Int16 => f64::from(i16::read_le(chunk)),
                ElementType::Int32 => f64::from(i32::read_le(chunk)),
                ElementType::Int64 => i64::read_le(chunk) as f64,
                ElementType::Float32 => f64::from(f32::read_le(chunk)),
                ElementType::Float64 => f64::read_le(chunk),
            })
            .collect()
    }

    /// Same shape and numerically equal elements, regardless of element type.
    pub fn values_equal(&self, other: &NdArray) -> bool {
        self.shape == other.shape && self.to_f64_lossy() == other.to_f64_lossy()
    }

    fn fmt_element(&self, f: &mut fmt::Formatter<'_>, index: usize) -> fmt::Result {
        let size = self.element_type.size();
        let chunk = &self.data[index * size..(index + 1) * size];
        match self.element_type {
            ElementType::Int16 => write!(f, "{}", i16::read_le(chunk)),
            ElementType::Int32 => write!(f, "{}", i32::read_le(chunk)),
            ElementType::Int64 => write!(f, "{}", i64::read_le(chunk)),
            ElementType::Float32 => write!(f, "{:?}", f32::read_le(chunk)),
            ElementType::Float64 => write!(f, "{:?}", f64::read_le(chunk)),
        }
    }

    fn fmt_axis(
        &self,
        f: &mut fmt::Formatter<'_>,
        axis: usize,
        offset: usize,
        stride: usize,
    ) -> fmt::Result {
        let dim = self.shape[axis];
        let inner = if dim == 0 { 0 } else { stride / dim };
        f.write_str("[")?;
        for i in 0..dim {
            if i > 0 {
                f.write_str(", ")?;
            }
            if axis + 1 == self.shape.len() {
                self.fmt_element(f, offset + i)?;
            } else {
                self.fmt_axis(f, axis + 1, offset + i * inner, inner)?;
            }
        }
        f.write_str("]")
    }
}

/// Nested-bracket rendering, e.g. `[[1.2, 3.2], [99.1, -14.1]]`.
impl fmt::Display for NdArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.shape.is_empty() {
            return self.fmt_element(f, 0);
        }
        self.fmt_axis(f, 0, 0, self.len())
    }
}

/// A value crossing the bridge.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    List(Vec<Value>),
    Mapping(Mapping),
    Array(NdArray),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int64(_) => "int64",
            Self::Float64(_) => "float64",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Mapping(_) => "mapping",
            Self::Array(_) => "array",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    fn mismatch(&self, expected: &'static str) -> ValueError {
        ValueError::TypeMismatch {
            expected,
            found: self.type_name(),
        }
    }

    pub fn as_bool(&self) -> Result<bool, ValueError> {
        match self {
            Self::Bool(b) => Ok(*b),
            other => Err(other.mismatch("bool")),
        }
    }

    pub fn as_i64(&self) -> Result<i64, ValueError> {
        match self {
            Self::Int64(n) => Ok(*n),
            other => Err(other.mismatch("int64")),
        }
    }

    /// Float value; `Int64` is accepted and converted.
    pub fn as_f64(&self) -> Result<f64, ValueError> {
        match self {
            Self::Float64(x) => Ok(*x),
            Self::Int64(n) => Ok(*n as f64),
            other => Err(other.mismatch("float64")),
        }
    }

    pub fn as_str(&self) -> Result<&str, ValueError> {
        match self {
            Self::String(s) => Ok(s),
            other => Err(other.mismatch("string")),
        }
    }

    pub fn as_list(&self) -> Result<&[Value], ValueError> {
        match self {
            Self::List(items) => Ok(items),
            other => Err(other.mismatch("list")),
        }
    }

    pub fn as_mapping(&self) -> Result<&Mapping, ValueError> {
        match self {
            Self::Mapping(map) => Ok(map),
            other => Err(other.mismatch("mapping")),
        }
    }

    pub fn as_array(&self) -> Result<&NdArray, ValueError> {
        match self {
            Self::Array(arr) => Ok(arr),
            other => Err(other.mismatch("array")),
        }
    }

    /// Look up `key` in a mapping value.
    pub fn get(&self, key: &str) -> Result<&Value, ValueError> {
        self.as_mapping()?
            .get(key)
            .ok_or_else(|| ValueError::MissingKey(key.to_string()))
    }

    /// Build a mapping value from `(key, value)` pairs. Later duplicates
    /// replace earlier ones in place.
    pub fn mapping<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self::Mapping(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Structural equality. Floats compare by bit pattern (so a NaN equals the
/// same NaN and `0.0 != -0.0`), mappings compare in key order.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int64(a), Self::Int64(b)) => a == b,
            (Self::Float64(a), Self::Float64(b)) => a.to_bits() == b.to_bits(),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Mapping(a), Self::Mapping(b)) => {
                a.len() == b.len()
                    && a
                        .iter()
                        .zip(b.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && va == vb)
            }
            (Self::Array(a), Self::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int64(n) => write!(f, "{n}"),
            Self::Float64(x) => write!(f, "{x:?}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Mapping(map) => {
                f.write_str("{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key:?}: {value}")?;
                }
                f.write_str("}")
            }
            Self::Array(arr) => write!(f, "{arr}"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int64(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Int64(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float64(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<Mapping> for Value {
    fn from(map: Mapping) -> Self {
        Self::Mapping(map)
    }
}

impl From<NdArray> for Value {
    fn from(arr: NdArray) -> Self {
        Self::Array(arr)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Self::Null, Into::into)
    }
}

impl TryFrom<Value> for bool {
    type Error = ValueError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_bool()
    }
}

impl TryFrom<Value> for i64 {
    type Error = ValueError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_i64()
    }
}

impl TryFrom<Value> for f64 {
    type Error = ValueError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value.as_f64()
    }
}

impl TryFrom<Value> for String {
    type Error = ValueError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(s) => Ok(s),
            other => Err(other.mismatch("string")),
        }
    }
}

impl TryFrom<Value> for Mapping {
    type Error = ValueError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Mapping(map) => Ok(map),
            other => Err(other.mismatch("mapping")),
        }
    }
}

impl TryFrom<Value> for NdArray {
    type Error = ValueError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Array(arr) => Ok(arr),
            other => Err(other.mismatch("array")),
        }
    }
}
