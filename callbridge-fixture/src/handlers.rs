//! Example handlers served by the fixture worker.

use callbridge::value::Element;
use callbridge::{ElementType, HandlerError, NdArray, Value};

/// `{"a": x, "b": y}` → `{"result": x + y}`. Prints its input.
pub fn add(input: Value) -> Result<Value, HandlerError> {
    println!("{input}");
    let sum = add_scalars(input.get("a")?, input.get("b")?)?;
    Ok(Value::mapping([("result", sum)]))
}

/// `{"a": x, "b": y}` → `x + y`. Prints its input.
pub fn add_scalar_output(input: Value) -> Result<Value, HandlerError> {
    println!("{input}");
    add_scalars(input.get("a")?, input.get("b")?)
}

/// `{"a": arr, "b": arr}` → elementwise `a + b`. Prints its input.
pub fn add_numpy_arrays(input: Value) -> Result<Value, HandlerError> {
    println!("{input}");
    let a = input.get("a")?.as_array()?;
    let b = input.get("b")?.as_array()?;
    if a.element_type() != b.element_type() || a.shape() != b.shape() {
        return Err(HandlerError::new(format!(
            "operands could not be added: {} {:?} and {} {:?}",
            a.element_type(),
            a.shape(),
            b.element_type(),
            b.shape()
        )));
    }

    let sum = match a.element_type() {
        ElementType::Int16 => zip_with(a, b, i16::checked_add)?,
        ElementType::Int32 => zip_with(a, b, i32::checked_add)?,
        ElementType::Int64 => zip_with(a, b, i64::checked_add)?,
        ElementType::Float32 => zip_with(a, b, |x: f32, y| Some(x + y))?,
        ElementType::Float64 => zip_with(a, b, |x: f64, y| Some(x + y))?,
    };
    Ok(Value::Array(sum))
}

pub fn identity(input: Value) -> Result<Value, HandlerError> {
    Ok(input)
}

/// Checks `arr2D` against a fixed 2x2 float array and echoes the input.
pub fn verify_2d_array(input: Value) -> Result<Value, HandlerError> {
    let expected = NdArray::from_rows(vec![vec![1.2f64, 3.2], vec![99.1, -14.1]])?;
    expect_array(input.get("arr2D")?.as_array()?, &expected)?;
    Ok(input)
}

/// Checks `arr1D` against a fixed float vector and echoes the input.
pub fn verify_1d_array(input: Value) -> Result<Value, HandlerError> {
    let expected = NdArray::vector(vec![1.2f64, 3.2, 99.1, -14.1]);
    expect_array(input.get("arr1D")?.as_array()?, &expected)?;
    Ok(input)
}

/// Checks `a` against `[10]` and echoes the input.
pub fn verify_1d_int32_array(input: Value) -> Result<Value, HandlerError> {
    let expected = NdArray::vector(vec![10i32]);
    expect_array(input.get("a")?.as_array()?, &expected)?;
    Ok(input)
}

fn expect_array(actual: &NdArray, expected: &NdArray) -> Result<(), HandlerError> {
    if actual.values_equal(expected) {
        Ok(())
    } else {
        Err(HandlerError::new(format!(
            "expected arr {expected} but was {actual}"
        )))
    }
}

fn add_scalars(a: &Value, b: &Value) -> Result<Value, HandlerError> {
    match (a, b) {
        (Value::Int64(x), Value::Int64(y)) => x
            .checked_add(*y)
            .map(Value::Int64)
            .ok_or_else(|| HandlerError::new(format!("{x} + {y} overflows int64"))),
        _ => Ok(Value::Float64(a.as_f64()? + b.as_f64()?)),
    }
}

fn zip_with<T: Element>(
    a: &NdArray,
    b: &NdArray,
    op: impl Fn(T, T) -> Option<T>,
) -> Result<NdArray, HandlerError> {
    let values = a
        .to_vec::<T>()?
        .into_iter()
        .zip(b.to_vec::<T>()?)
        .map(|(x, y)| op(x, y).ok_or_else(|| HandlerError::new(format!("{x} + {y} overflows"))))
        .collect::<Result<Vec<T>, _>>()?;
    Ok(NdArray::new(a.shape().to_vec(), values)?)
}
