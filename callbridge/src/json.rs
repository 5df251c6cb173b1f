//! JSON view of [`Value`], used by the host CLI.
//!
//! Plain JSON maps onto the dynamic variants. Typed arrays need an explicit
//! tagged object so their element type is never guessed:
//!
//! ```json
//! {"$array": {"dtype": "float64", "shape": [2, 2], "data": [1.2, 3.2, 99.1, -14.1]}}
//! ```
//!
//! `data` is the flat row-major element list. Non-finite floats are written
//! as `null` and read back as NaN.

use serde_json::{Map, Number};

use crate::value::{ElementType, Mapping, NdArray, Value, ValueError};

const ARRAY_KEY: &str = "$array";

#[derive(Debug, thiserror::Error)]
pub enum JsonError {
    #[error("invalid $array object: {0}")]
    MalformedArray(&'static str),

    #[error("unknown dtype '{0}'")]
    UnknownDtype(String),

    #[error("element {index} is not a valid {dtype}: {value}")]
    BadElement {
        index: usize,
        dtype: ElementType,
        value: serde_json::Value,
    },

    #[error(transparent)]
    Value(#[from] ValueError),
}

impl Value {
    pub fn from_json(json: &serde_json::Value) -> Result<Self, JsonError> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int64(i),
                None => Value::Float64(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::List(
                items
                    .iter()
                    .map(Value::from_json)
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(map) => match map.get(ARRAY_KEY) {
                Some(body) if map.len() == 1 => Value::Array(array_from_json(body)?),
                _ => Value::Mapping(
                    map.iter()
                        .map(|(k, v)| Value::from_json(v).map(|v| (k.clone(), v)))
                        .collect::<Result<Mapping, JsonError>>()?,
                ),
            },
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int64(n) => serde_json::Value::from(*n),
            Value::Float64(x) => float_to_json(*x),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => items.iter().map(Value::to_json).collect(),
            Value::Mapping(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Array(arr) => array_to_json(arr),
        }
    }
}

fn float_to_json(x: f64) -> serde_json::Value {
    Number::from_f64(x).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

fn array_to_json(arr: &NdArray) -> serde_json::Value {
    let data: Vec<serde_json::Value> = match arr.element_type() {
        ElementType::Int16 => ints(arr.to_vec::<i16>().map(widen)),
        ElementType::Int32 => ints(arr.to_vec::<i32>().map(widen)),
        ElementType::Int64 => ints(arr.to_vec::<i64>()),
        // Shortest decimal form, so 1.2f32 prints as 1.2 rather than 1.2000000476837158.
        ElementType::Float32 => arr
            .to_vec::<f32>()
            .unwrap_or_default()
            .into_iter()
            .map(|x| float_to_json(x.to_string().parse().unwrap_or(f64::NAN)))
            .collect(),
        ElementType::Float64 => arr
            .to_vec::<f64>()
            .unwrap_or_default()
            .into_iter()
            .map(float_to_json)
            .collect(),
    };

    let mut body = Map::new();
    body.insert("dtype".into(), arr.element_type().name().into());
    body.insert("shape".into(), arr.shape().iter().copied().collect());
    body.insert("data".into(), serde_json::Value::Array(data));

    let mut outer = Map::new();
    outer.insert(ARRAY_KEY.into(), serde_json::Value::Object(body));
    serde_json::Value::Object(outer)
}

fn widen<T: Into<i64>>(values: Vec<T>) -> Vec<i64> {
    values.into_iter().map(Into::into).collect()
}

fn ints(values: Result<Vec<i64>, ValueError>) -> Vec<serde_json::Value> {
    values
        .unwrap_or_default()
        .into_iter()
        .map(serde_json::Value::from)
        .collect()
}

fn array_from_json(body: &serde_json::Value) -> Result<NdArray, JsonError> {
    let body = body
        .as_object()
        .ok_or(JsonError::MalformedArray("expected an object"))?;

    let dtype = body
        .get("dtype")
        .and_then(serde_json::Value::as_str)
        .ok_or(JsonError::MalformedArray("missing string 'dtype'"))?;
    let dtype =
        ElementType::from_name(dtype).ok_or_else(|| JsonError::UnknownDtype(dtype.to_string()))?;

    let shape = body
        .get("shape")
        .and_then(serde_json::Value::as_array)
        .ok_or(JsonError::MalformedArray("missing array 'shape'"))?
        .iter()
        .map(|dim| {
            dim.as_u64()
                .and_then(|d| usize::try_from(d).ok())
                .ok_or(JsonError::MalformedArray("shape entries must be non-negative integers"))
        })
        .collect::<Result<Vec<usize>, _>>()?;

    let data = body
        .get("data")
        .and_then(serde_json::Value::as_array)
        .ok_or(JsonError::MalformedArray("missing array 'data'"))?;

    let arr = match dtype {
        ElementType::Int16 => NdArray::new(shape, int_elements::<i16>(data, dtype)?)?,
        ElementType::Int32 => NdArray::new(shape, int_elements::<i32>(data, dtype)?)?,
        ElementType::Int64 => NdArray::new(shape, int_elements::<i64>(data, dtype)?)?,
        ElementType::Float32 => NdArray::new(
            shape,
            float_elements(data, dtype)?
                .into_iter()
                .map(|x| x as f32)
                .collect(),
        )?,
        ElementType::Float64 => NdArray::new(shape, float_elements(data, dtype)?)?,
    };
    Ok(arr)
}

fn int_elements<T: TryFrom<i64>>(
    data: &[serde_json::Value],
    dtype: ElementType,
) -> Result<Vec<T>, JsonError> {
    data.iter()
        .enumerate()
        .map(|(index, value)| {
            value
                .as_i64()
                .and_then(|n| T::try_from(n).ok())
                .ok_or_else(|| JsonError::BadElement {
                    index,
                    dtype,
                    value: value.clone(),
                })
        })
        .collect()
}

fn float_elements(data: &[serde_json::Value], dtype: ElementType) -> Result<Vec<f64>, JsonError> {
    data.iter()
        .enumerate()
        .map(|(index, value)| match value {
            serde_json::Value::Null => Ok(f64::NAN),
            other => other.as_f64().ok_or_else(|| JsonError::BadElement {
                index,
                dtype,
                value: other.clone(),
            }),
        })
        .collect()
}
