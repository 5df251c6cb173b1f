//! Request/response messages exchanged between host and worker.
//!
//! ```text
//! Request:  [u32 len][utf8 function_name][value]
//! Response: [0x00][value]                      ok
//!           [0x01][u32 len][utf8 message]      error
//! ```
//!
//! One request is answered by exactly one response, in send order.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use super::wire::{DecodeError, EncodeError, Reader, WireMessage, encode_value, put_str};
use crate::value::Value;

/// A call to a named function in the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub function_name: String,
    pub argument: Value,
}

impl Request {
    pub fn new(function_name: impl Into<String>, argument: impl Into<Value>) -> Self {
        Self {
            function_name: function_name.into(),
            argument: argument.into(),
        }
    }
}

impl WireMessage for Request {
    fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        if self.function_name.is_empty() {
            return Err(EncodeError::EmptyFunctionName);
        }
        put_str(dst, &self.function_name, "function name")?;
        encode_value(&self.argument, dst)
    }

    fn decode(src: Bytes) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(src);
        let function_name = reader.string("function name")?;
        if function_name.is_empty() {
            return Err(DecodeError::EmptyFunctionName);
        }
        let argument = reader.value()?;
        reader.finish()?;
        Ok(Self {
            function_name,
            argument,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
}

impl Status {
    fn tag(self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::Error => 0x01,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// Outcome of one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok(Value),
    Error { message: String },
}

impl Response {
    pub fn ok(value: impl Into<Value>) -> Self {
        Self::Ok(value.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Self::Ok(_) => Status::Ok,
            Self::Error { .. } => Status::Error,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status() == Status::Ok
    }

    pub fn into_result(self) -> Result<Value, String> {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Error { message } => Err(message),
        }
    }
}

impl WireMessage for Response {
    fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        dst.put_u8(self.status().tag());
        match self {
            Self::Ok(value) => encode_value(value, dst),
            Self::Error { message } => put_str(dst, message, "error message"),
        }
    }

    fn decode(src: Bytes) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(src);
        let response = match reader.u8("response status")? {
            0x00 => Self::Ok(reader.value()?),
            0x01 => Self::Error {
                message: reader.string("error message")?,
            },
            other => return Err(DecodeError::UnknownStatus(other)),
        };
        reader.finish()?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::NdArray;

    fn encoded<T: WireMessage>(msg: &T) -> Bytes {
        let mut dst = BytesMut::new();
        msg.encode(&mut dst).unwrap();
        dst.freeze()
    }

    #[test]
    fn request_roundtrips() {
        let req = Request::new(
            "add",
            Value::mapping([("a", Value::Int64(3)), ("b", Value::Int64(4))]),
        );
        assert_eq!(Request::decode(encoded(&req)).unwrap(), req);
    }

    #[test]
    fn request_wire_layout() {
        let req = Request::new("id", Value::Null);
        insta::assert_snapshot!(
            format!("{:02x?}", &encoded(&req)[..]),
            @"[02, 00, 00, 00, 69, 64, 00]"
        );
    }

    #[test]
    fn response_roundtrips() {
        let ok = Response::ok(NdArray::vector(vec![6.5f64, 5.6]));
        assert_eq!(Response::decode(encoded(&ok)).unwrap(), ok);

        let err = Response::error("unknown function 'nope'");
        assert_eq!(Response::decode(encoded(&err)).unwrap(), err);
    }

    #[test]
    fn empty_function_name_is_rejected_both_ways() {
        let req = Request::new("", Value::Null);
        let mut dst = BytesMut::new();
        assert!(matches!(
            req.encode(&mut dst),
            Err(EncodeError::EmptyFunctionName)
        ));

        let raw = Bytes::from_static(&[0, 0, 0, 0, 0x00]);
        assert_eq!(
            Request::decode(raw).unwrap_err(),
            DecodeError::EmptyFunctionName
        );
    }

    #[test]
    fn unknown_status_is_rejected() {
        let raw = Bytes::from_static(&[0x07, 0x00]);
        assert_eq!(
            Response::decode(raw).unwrap_err(),
            DecodeError::UnknownStatus(0x07)
        );
    }

    #[test]
    fn request_without_argument_is_truncated() {
        let raw = Bytes::from_static(&[1, 0, 0, 0, b'f']);
        assert!(matches!(
            Request::decode(raw).unwrap_err(),
            DecodeError::Truncated { context: "value tag", .. }
        ));
    }

    #[test]
    fn response_into_result() {
        assert_eq!(Response::ok(7i64).into_result(), Ok(Value::Int64(7)));
        assert_eq!(
            Response::error("boom").into_result(),
            Err("boom".to_string())
        );
        assert_eq!(Response::error("boom").status().to_string(), "error");
    }
}
