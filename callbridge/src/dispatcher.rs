//! Routes a decoded request to its handler and turns the outcome into a
//! response. Nothing a handler does, including panicking, escapes as
//! anything other than an error response.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use crate::bridge::protocol::{Request, Response};
use crate::registry::{HandlerRegistry, RegistryError};

#[derive(Debug)]
pub struct Dispatcher {
    registry: HandlerRegistry,
}

impl Dispatcher {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Handle one request. Always produces exactly one response.
    pub fn dispatch(&self, request: Request) -> Response {
        let Request {
            function_name,
            argument,
        } = request;

        let handler = match self.registry.lookup(&function_name) {
            Ok(handler) => handler,
            Err(e @ RegistryError::NotFound(_)) => {
                tracing::warn!(function = %function_name, "Unknown function requested");
                return Response::error(e.to_string());
            }
            Err(e) => return Response::error(e.to_string()),
        };

        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(argument)));
        let elapsed = start.elapsed();

        match outcome {
            Ok(Ok(value)) => {
                tracing::debug!(
                    function = %function_name,
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    result = value.type_name(),
                    "Handler returned"
                );
                Response::Ok(value)
            }
            Ok(Err(e)) => {
                tracing::debug!(
                    function = %function_name,
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    error = %e,
                    "Handler failed"
                );
                Response::error(e.message())
            }
            Err(payload) => {
                let detail = panic_message(payload.as_ref());
                tracing::error!(function = %function_name, panic = %detail, "Handler panicked");
                Response::error(format!("handler '{function_name}' panicked: {detail}"))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HandlerError;
    use crate::value::{NdArray, Value};

    fn add(v: Value) -> Result<Value, HandlerError> {
        let sum = v.get("a")?.as_i64()? + v.get("b")?.as_i64()?;
        Ok(Value::mapping([("result", Value::Int64(sum))]))
    }

    fn add_scalar_output(v: Value) -> Result<Value, HandlerError> {
        Ok(Value::Int64(v.get("a")?.as_i64()? + v.get("b")?.as_i64()?))
    }

    fn identity(v: Value) -> Result<Value, HandlerError> {
        Ok(v)
    }

    fn verify_2d_array(v: Value) -> Result<Value, HandlerError> {
        let expected = NdArray::from_rows(vec![vec![1.2f64, 3.2], vec![99.1, -14.1]])?;
        let arr = v.get("arr")?.as_array()?;
        if arr != &expected {
            return Err(HandlerError::new(format!(
                "expected arr {expected} but was {arr}"
            )));
        }
        Ok(Value::Null)
    }

    fn explode(_: Value) -> Result<Value, HandlerError> {
        panic!("kaboom")
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            crate::handlers![add, add_scalar_output, identity, verify_2d_array, explode].unwrap(),
        )
    }

    fn ab(a: i64, b: i64) -> Value {
        Value::mapping([("a", Value::Int64(a)), ("b", Value::Int64(b))])
    }

    #[test]
    fn add_returns_mapping() {
        let response = dispatcher().dispatch(Request::new("add", ab(3, 4)));
        assert_eq!(
            response,
            Response::Ok(Value::mapping([("result", Value::Int64(7))]))
        );
    }

    #[test]
    fn add_scalar_output_returns_scalar() {
        let response = dispatcher().dispatch(Request::new("add_scalar_output", ab(3, 4)));
        assert_eq!(response, Response::ok(7i64));
    }

    #[test]
    fn identity_preserves_array_bits() {
        let arr = NdArray::from_rows(vec![vec![0.1f64, -0.0], vec![f64::MIN_POSITIVE, 1e300]])
            .unwrap();
        let response = dispatcher().dispatch(Request::new("identity", arr.clone()));
        let out = match response {
            Response::Ok(Value::Array(out)) => out,
            other => panic!("expected array response, got {other:?}"),
        };
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out.as_bytes(), arr.as_bytes());
    }

    #[test]
    fn unknown_function_is_an_error_response() {
        let response = dispatcher().dispatch(Request::new("no_such_fn", Value::Null));
        insta::assert_debug_snapshot!(response, @r#"
        Error {
            message: "unknown function 'no_such_fn'",
        }
        "#);
    }

    #[test]
    fn handler_failure_message_is_forwarded() {
        let wrong = NdArray::from_rows(vec![vec![1.0f64, 2.0], vec![3.0, 4.0]]).unwrap();
        let response = dispatcher().dispatch(Request::new(
            "verify_2d_array",
            Value::mapping([("arr", Value::Array(wrong))]),
        ));
        let message = response.into_result().unwrap_err();
        insta::assert_snapshot!(
            message,
            @"expected arr [[1.2, 3.2], [99.1, -14.1]] but was [[1.0, 2.0], [3.0, 4.0]]"
        );
    }

    #[test]
    fn argument_type_errors_become_responses() {
        let response = dispatcher().dispatch(Request::new("add", Value::Null));
        assert_eq!(response, Response::error("expected mapping, found null"));
    }

    #[test]
    fn panics_are_contained() {
        let dispatcher = dispatcher();
        let response = dispatcher.dispatch(Request::new("explode", Value::Null));
        assert_eq!(
            response,
            Response::error("handler 'explode' panicked: kaboom")
        );

        // The dispatcher keeps serving afterwards.
        assert!(dispatcher.dispatch(Request::new("add", ab(1, 1))).is_ok());
    }
}
