//! Binary encoding of [`Value`]s.
//!
//! Every value is `[tag u8][payload]`, all numbers little-endian:
//!
//! ```text
//! 0x00 Null
//! 0x01 Bool     [u8 0|1]
//! 0x02 Int64    [i64]
//! 0x03 Float64  [f64 bits]
//! 0x04 String   [u32 len][utf8]
//! 0x05 List     [u32 count][value]*
//! 0x06 Mapping  [u32 count]([u32 len][utf8 key][value])*
//! 0x07 Array    [element tag u8][ndims u8][u32 dim]*[raw element bytes]
//! ```
//!
//! Array buffers are copied byte for byte, so integer arrays keep their
//! width and float arrays keep their exact bit patterns.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::value::{ElementType, MAX_DIMS, Mapping, NdArray, Value, ValueError, element_count};

/// Deepest list/mapping nesting accepted on either side.
pub const MAX_DEPTH: usize = 128;

pub(crate) mod tag {
    pub const NULL: u8 = 0x00;
    pub const BOOL: u8 = 0x01;
    pub const INT64: u8 = 0x02;
    pub const FLOAT64: u8 = 0x03;
    pub const STRING: u8 = 0x04;
    pub const LIST: u8 = 0x05;
    pub const MAPPING: u8 = 0x06;
    pub const ARRAY: u8 = 0x07;
}

fn element_tag(element_type: ElementType) -> u8 {
    match element_type {
        ElementType::Int16 => 0x01,
        ElementType::Int32 => 0x02,
        ElementType::Int64 => 0x03,
        ElementType::Float32 => 0x04,
        ElementType::Float64 => 0x05,
    }
}

fn element_type_from_tag(tag: u8) -> Option<ElementType> {
    match tag {
        0x01 => Some(ElementType::Int16),
        0x02 => Some(ElementType::Int32),
        0x03 => Some(ElementType::Int64),
        0x04 => Some(ElementType::Float32),
        0x05 => Some(ElementType::Float64),
        _ => None,
    }
}

/// Malformed wire bytes.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated {context}: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        context: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("unknown value tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("unknown element type tag 0x{0:02x}")]
    UnknownElementType(u8),

    #[error("unknown response status 0x{0:02x}")]
    UnknownStatus(u8),

    #[error("invalid bool byte 0x{0:02x}")]
    InvalidBool(u8),

    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("duplicate mapping key '{0}'")]
    DuplicateKey(String),

    #[error("array rank {0} exceeds the maximum of {max}", max = MAX_DIMS)]
    TooManyDimensions(usize),

    #[error("array shape {0:?} overflows")]
    ShapeOverflow(Vec<usize>),

    #[error("invalid array: {0}")]
    InvalidArray(#[from] ValueError),

    #[error("nesting deeper than {max} levels", max = MAX_DEPTH)]
    TooDeep,

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("function name is empty")]
    EmptyFunctionName,
}

/// Value that cannot be represented on the wire.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("{what} length {len} exceeds the wire limit of {max}", max = u32::MAX)]
    TooLong { what: &'static str, len: usize },

    #[error("array rank {0} exceeds the maximum of {max}", max = MAX_DIMS)]
    TooManyDimensions(usize),

    #[error("nesting deeper than {max} levels", max = MAX_DEPTH)]
    TooDeep,

    #[error("function name is empty")]
    EmptyFunctionName,

    #[error("frame of {len} bytes exceeds the maximum of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EncodeError {
    /// Whether the failure happened on the transport rather than in the value.
    /// Non-I/O failures leave the output untouched.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// A message with a binary wire form.
pub trait WireMessage: Sized {
    fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError>;

    /// Decode a complete payload. Bytes left over are an error.
    fn decode(src: Bytes) -> Result<Self, DecodeError>;
}

impl WireMessage for Value {
    fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        encode_value(self, dst)
    }

    fn decode(src: Bytes) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(src);
        let value = reader.value()?;
        reader.finish()?;
        Ok(value)
    }
}

/// Encode `value` onto the end of `dst`.
pub fn encode_value(value: &Value, dst: &mut BytesMut) -> Result<(), EncodeError> {
    encode_at(value, dst, 0)
}

/// Encode `value` into a fresh buffer.
pub fn to_bytes(value: &Value) -> Result<Bytes, EncodeError> {
    let mut dst = BytesMut::new();
    encode_value(value, &mut dst)?;
    Ok(dst.freeze())
}

/// Decode exactly one value from `src`.
pub fn from_bytes(src: impl Into<Bytes>) -> Result<Value, DecodeError> {
    Value::decode(src.into())
}

pub(crate) fn put_len(dst: &mut BytesMut, len: usize, what: &'static str) -> Result<(), EncodeError> {
    let len32 = u32::try_from(len).map_err(|_| EncodeError::TooLong { what, len })?;
    dst.put_u32_le(len32);
    Ok(())
}

pub(crate) fn put_str(dst: &mut BytesMut, s: &str, what: &'static str) -> Result<(), EncodeError> {
    put_len(dst, s.len(), what)?;
    dst.put_slice(s.as_bytes());
    Ok(())
}

fn encode_at(value: &Value, dst: &mut BytesMut, depth: usize) -> Result<(), EncodeError> {
    if depth > MAX_DEPTH {
        return Err(EncodeError::TooDeep);
    }

    match value {
        Value::Null => dst.put_u8(tag::NULL),
        Value::Bool(b) => {
            dst.put_u8(tag::BOOL);
            dst.put_u8(u8::from(*b));
        }
        Value::Int64(n) => {
            dst.put_u8(tag::INT64);
            dst.put_i64_le(*n);
        }
        Value::Float64(x) => {
            dst.put_u8(tag::FLOAT64);
            dst.put_f64_le(*x);
        }
        Value::String(s) => {
            dst.put_u8(tag::STRING);
            put_str(dst, s, "string")?;
        }
        Value::List(items) => {
            dst.put_u8(tag::LIST);
            put_len(dst, items.len(), "list")?;
            for item in items {
                encode_at(item, dst, depth + 1)?;
            }
        }
        Value::Mapping(map) => {
            dst.put_u8(tag::MAPPING);
            put_len(dst, map.len(), "mapping")?;
            for (key, item) in map {
                put_str(dst, key, "mapping key")?;
                encode_at(item, dst, depth + 1)?;
            }
        }
        Value::Array(arr) => encode_array(arr, dst)?,
    }
    Ok(())
}

fn encode_array(arr: &NdArray, dst: &mut BytesMut) -> Result<(), EncodeError> {
    let ndims = u8::try_from(arr.ndim())
        .ok()
        .filter(|&n| usize::from(n) <= MAX_DIMS)
        .ok_or(EncodeError::TooManyDimensions(arr.ndim()))?;

    dst.put_u8(tag::ARRAY);
    dst.put_u8(element_tag(arr.element_type()));
    dst.put_u8(ndims);
    for &dim in arr.shape() {
        put_len(dst, dim, "array dimension")?;
    }
    dst.put_slice(arr.as_bytes());
    Ok(())
}

/// Cursor over an incoming payload. Every read is bounds-checked; nothing
/// here can panic on hostile input.
pub(crate) struct Reader {
    buf: Bytes,
}

impl Reader {
    pub(crate) fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn need(&self, needed: usize, context: &'static str) -> Result<(), DecodeError> {
        let remaining = self.buf.remaining();
        if remaining < needed {
            return Err(DecodeError::Truncated {
                context,
                needed,
                remaining,
            });
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self, context: &'static str) -> Result<u8, DecodeError> {
        self.need(1, context)?;
        Ok(self.buf.get_u8())
    }

    fn len(&mut self, context: &'static str) -> Result<usize, DecodeError> {
        self.need(4, context)?;
        Ok(self.buf.get_u32_le() as usize)
    }

    fn take(&mut self, n: usize, context: &'static str) -> Result<Bytes, DecodeError> {
        self.need(n, context)?;
        Ok(self.buf.split_to(n))
    }

    pub(crate) fn string(&mut self, context: &'static str) -> Result<String, DecodeError> {
        let len = self.len(context)?;
        let raw = self.take(len, context)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8(context))
    }

    pub(crate) fn value(&mut self) -> Result<Value, DecodeError> {
        self.value_at(0)
    }

    /// Fails if anything is left unread.
    pub(crate) fn finish(self) -> Result<(), DecodeError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }

    fn value_at(&mut self, depth: usize) -> Result<Value, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::TooDeep);
        }

        let value = match self.u8("value tag")? {
            tag::NULL => Value::Null,
            tag::BOOL => match self.u8("bool")? {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => return Err(DecodeError::InvalidBool(other)),
            },
            tag::INT64 => {
                self.need(8, "int64")?;
                Value::Int64(self.buf.get_i64_le())
            }
            tag::FLOAT64 => {
                self.need(8, "float64")?;
                Value::Float64(self.buf.get_f64_le())
            }
            tag::STRING => Value::String(self.string("string")?),
            tag::LIST => {
                let count = self.len("list length")?;
                // Each item takes at least one byte; don't trust `count` for allocation.
                let mut items = Vec::with_capacity(count.min(self.buf.remaining()));
                for _ in 0..count {
                    items.push(self.value_at(depth + 1)?);
                }
                Value::List(items)
            }
            tag::MAPPING => {
                let count = self.len("mapping length")?;
                let mut map = Mapping::with_capacity(count.min(self.buf.remaining()));
                for _ in 0..count {
                    let key = self.string("mapping key")?;
                    let item = self.value_at(depth + 1)?;
                    if map.contains_key(&key) {
                        return Err(DecodeError::DuplicateKey(key));
                    }
                    map.insert(key, item);
                }
                Value::Mapping(map)
            }
            tag::ARRAY => Value::Array(self.array()?),
            other => return Err(DecodeError::UnknownTag(other)),
        };
        Ok(value)
    }

    fn array(&mut self) -> Result<NdArray, DecodeError> {
        let elem_tag = self.u8("array element type")?;
        let element_type =
            element_type_from_tag(elem_tag).ok_or(DecodeError::UnknownElementType(elem_tag))?;

        let ndims = usize::from(self.u8("array rank")?);
        if ndims > MAX_DIMS {
            return Err(DecodeError::TooManyDimensions(ndims));
        }

        let mut shape = Vec::with_capacity(ndims);
        for _ in 0..ndims {
            shape.push(self.len("array dimension")?);
        }

        let byte_len = element_count(&shape)
            .and_then(|count| count.checked_mul(element_type.size()))
            .ok_or_else(|| DecodeError::ShapeOverflow(shape.clone()))?;
        let data = self.take(byte_len, "array buffer")?;

        Ok(NdArray::from_raw(element_type, shape, data)?)
    }
}
