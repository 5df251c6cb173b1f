//! Name → handler table, built once at worker startup.

use std::collections::HashMap;
use std::fmt;

use crate::value::{Value, ValueError};

/// Failure raised by a handler. Its message is what the host sees.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ValueError> for HandlerError {
    fn from(err: ValueError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("function '{0}' is already registered")]
    DuplicateName(String),

    #[error("function name must not be empty")]
    EmptyName,

    #[error("unknown function '{0}'")]
    NotFound(String),
}

/// A registered function: one value in, one value or a failure out.
pub type HandlerFn = dyn Fn(Value) -> Result<Value, HandlerError> + Send + Sync;

/// Exact-match, case-sensitive function table.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<HandlerFn>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`. Any error type convertible into
    /// [`HandlerError`] may be returned by the handler.
    pub fn register<F, E>(&mut self, name: impl Into<String>, handler: F) -> Result<(), RegistryError>
    where
        F: Fn(Value) -> Result<Value, E> + Send + Sync + 'static,
        E: Into<HandlerError>,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::DuplicateName(name));
        }
        self.handlers.insert(
            name,
            Box::new(move |argument| handler(argument).map_err(Into::into)),
        );
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<F, E>(mut self, name: impl Into<String>, handler: F) -> Result<Self, RegistryError>
    where
        F: Fn(Value) -> Result<Value, E> + Send + Sync + 'static,
        E: Into<HandlerError>,
    {
        self.register(name, handler)?;
        Ok(self)
    }

    pub fn lookup(&self, name: &str) -> Result<&HandlerFn, RegistryError> {
        self.handlers
            .get(name)
            .map(Box::as_ref)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

/// Build a [`HandlerRegistry`] from function items, each registered under
/// its own identifier.
///
/// ```
/// use callbridge::{HandlerError, Value, handlers};
///
/// fn identity(v: Value) -> Result<Value, HandlerError> {
///     Ok(v)
/// }
///
/// let registry = handlers![identity].unwrap();
/// assert!(registry.contains("identity"));
/// ```
#[macro_export]
macro_rules! handlers {
    ($($handler:ident),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut registry = $crate::HandlerRegistry::new();
        #[allow(unused_mut)]
        let mut result: ::std::result::Result<(), $crate::RegistryError> = Ok(());
        $(
            if result.is_ok() {
                result = registry.register(stringify!($handler), $handler);
            }
        )*
        result.map(|()| registry)
    }};
}
