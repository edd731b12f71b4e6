//! Operation registry and invocation dispatcher.
//!
//! Operations are registered once at startup and then invoked by name from any
//! number of concurrent callers. `invoke` always hands back a discriminated
//! `Result<Payload, DispatchError>`; handler failures (including panics) are
//! mapped into `DispatchError::Backend` and never escape the dispatcher.

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// Raw JSON object as supplied by the hosting protocol.
pub type JsonObject = Map<String, Value>;

/// A flat mapping of field name to primitive value.
pub type Record = Map<String, Value>;

/// Format anyhow error with full cause chain
pub fn format_error(e: &anyhow::Error) -> String {
    let mut msg = e.to_string();
    for cause in e.chain().skip(1) {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
    }
    msg
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handlers may fail with `DispatchError::InvalidArgument` for checks that span
/// several parameters; everything else is a backend failure.
fn handler_error(e: anyhow::Error) -> DispatchError {
    match e.downcast::<DispatchError>() {
        Ok(invalid @ DispatchError::InvalidArgument { .. }) => invalid,
        Ok(other) => DispatchError::Backend(other.to_string()),
        Err(e) => DispatchError::Backend(format_error(&e)),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Boolean,
}

impl ParamKind {
    const fn json_type(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
        }
    }
}

/// A declared operation parameter.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
    pub description: String,
    /// Missing or `null` values are rejected when set.
    pub required: bool,
    /// Strings only. Empty and whitespace-only strings are rejected unless set.
    pub allow_empty: bool,
    /// Integers only. Inclusive lower bound.
    pub minimum: Option<i64>,
}

impl Param {
    pub fn new(name: impl Into<String>, kind: ParamKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            required: true,
            allow_empty: false,
            minimum: None,
        }
    }

    pub fn string(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, ParamKind::String, description)
    }

    pub fn integer(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Integer, description)
    }

    pub fn boolean(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Boolean, description)
    }

    #[must_use]
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    #[must_use]
    pub fn minimum(mut self, minimum: i64) -> Self {
        self.minimum = Some(minimum);
        self
    }

    fn coerce(&self, value: &Value) -> std::result::Result<ArgValue, String> {
        let coerced = match (self.kind, value) {
            (ParamKind::String, Value::String(s)) => {
                if !self.allow_empty && s.trim().is_empty() {
                    return Err("must not be empty".to_string());
                }
                ArgValue::Str(s.clone())
            }
            (ParamKind::String, Value::Number(n)) => ArgValue::Str(n.to_string()),
            (ParamKind::String, Value::Bool(b)) => ArgValue::Str(b.to_string()),
            (ParamKind::Integer, Value::Number(n)) => n
                .as_i64()
                .map(ArgValue::Int)
                .ok_or_else(|| format!("expected an integer, got {n}"))?,
            (ParamKind::Integer, Value::String(s)) => s
                .trim()
                .parse::<i64>()
                .map(ArgValue::Int)
                .map_err(|_| format!("expected an integer, got '{s}'"))?,
            (ParamKind::Boolean, Value::Bool(b)) => ArgValue::Bool(*b),
            (ParamKind::Boolean, Value::String(s)) if s.eq_ignore_ascii_case("true") => {
                ArgValue::Bool(true)
            }
            (ParamKind::Boolean, Value::String(s)) if s.eq_ignore_ascii_case("false") => {
                ArgValue::Bool(false)
            }
            (kind, other) => {
                return Err(format!(
                    "expected {}, got {}",
                    kind.json_type(),
                    json_type_name(other)
                ));
            }
        };

        if let (ArgValue::Int(n), Some(min)) = (&coerced, self.minimum)
            && *n < min
        {
            return Err(format!("must be at least {min}, got {n}"));
        }

        Ok(coerced)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

/// Arguments that passed validation against an operation's parameters.
#[derive(Debug, Clone, Default)]
pub struct Arguments {
    values: HashMap<String, ArgValue>,
}

impl Arguments {
    pub fn str(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(ArgValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(ArgValue::Int(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.values.get(name) {
            Some(ArgValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn required_str(&self, name: &str) -> anyhow::Result<&str> {
        self.str(name)
            .ok_or_else(|| anyhow::anyhow!("Argument '{name}' was not supplied"))
    }
}

/// Success payload of an invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    List(Vec<String>),
    Records(Vec<Record>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DuplicateOperation,
    InvalidOperation,
    UnknownOperation,
    InvalidArgument,
    Backend,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Operation '{0}' is already registered")]
    DuplicateOperation(String),

    #[error("Invalid definition for operation '{name}': {reason}")]
    InvalidOperation { name: String, reason: String },

    #[error("Operation '{name}' not found. Available: {available}")]
    UnknownOperation { name: String, available: String },

    #[error("Invalid argument '{parameter}': {reason}")]
    InvalidArgument { parameter: String, reason: String },

    /// Backend message, passed through with its cause chain.
    #[error("{0}")]
    Backend(String),
}

impl DispatchError {
    pub fn invalid_argument(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateOperation(_) => ErrorKind::DuplicateOperation,
            Self::InvalidOperation { .. } => ErrorKind::InvalidOperation,
            Self::UnknownOperation { .. } => ErrorKind::UnknownOperation,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::Backend(_) => ErrorKind::Backend,
        }
    }

    pub fn parameter(&self) -> Option<&str> {
        match self {
            Self::InvalidArgument { parameter, .. } => Some(parameter),
            _ => None,
        }
    }
}

/// Wire form of an invocation result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Envelope {
    Success {
        result: Payload,
    },
    Error {
        kind: ErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parameter: Option<String>,
    },
}

impl From<std::result::Result<Payload, DispatchError>> for Envelope {
    fn from(result: std::result::Result<Payload, DispatchError>) -> Self {
        match result {
            Ok(result) => Self::Success { result },
            Err(e) => Self::Error {
                kind: e.kind(),
                parameter: e.parameter().map(str::to_string),
                message: e.to_string(),
            },
        }
    }
}

/// Backend work behind an operation.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, args: Arguments) -> anyhow::Result<Payload>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Arguments) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
{
    async fn call(&self, args: Arguments) -> anyhow::Result<Payload> {
        (self)(args).await
    }
}

#[derive(Clone)]
pub struct Operation {
    name: String,
    description: String,
    params: Vec<Param>,
    handler: Arc<dyn Handler>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl Operation {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
            handler: Arc::new(handler),
        }
    }

    #[must_use]
    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// JSON Schema describing the accepted arguments.
    pub fn input_schema(&self) -> JsonObject {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for param in &self.params {
            let mut property = json!({
                "type": param.kind.json_type(),
                "description": param.description,
            });
            if param.kind == ParamKind::String && !param.allow_empty {
                property["minLength"] = json!(1);
            }
            if let Some(min) = param.minimum {
                property["minimum"] = json!(min);
            }
            properties.insert(param.name.clone(), property);

            if param.required {
                required.push(Value::String(param.name.clone()));
            }
        }

        let mut schema = Map::new();
        schema.insert("type".to_string(), json!("object"));
        schema.insert("properties".to_string(), Value::Object(properties));
        schema.insert("required".to_string(), Value::Array(required));
        schema
    }

    /// Check raw arguments against the declared parameters, in declaration order.
    fn validate(&self, raw: &JsonObject) -> std::result::Result<Arguments, DispatchError> {
        let mut values = HashMap::with_capacity(self.params.len());

        for param in &self.params {
            match raw.get(&param.name) {
                None | Some(Value::Null) => {
                    if param.required {
                        return Err(DispatchError::invalid_argument(
                            &param.name,
                            "missing required argument",
                        ));
                    }
                }
                Some(value) => {
                    let coerced = param
                        .coerce(value)
                        .map_err(|reason| DispatchError::invalid_argument(&param.name, reason))?;
                    values.insert(param.name.clone(), coerced);
                }
            }
        }

        if let Some(unexpected) = raw
            .keys()
            .find(|key| !self.params.iter().any(|p| &p.name == *key))
        {
            return Err(DispatchError::invalid_argument(
                unexpected,
                "unexpected argument",
            ));
        }

        Ok(Arguments { values })
    }
}

/// Registry of operations, populated at startup and read-only afterwards.
#[derive(Debug, Default)]
pub struct Registry {
    operations: Vec<Operation>,
    index: HashMap<String, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, operation: Operation) -> std::result::Result<(), DispatchError> {
        if operation.name.trim().is_empty() {
            return Err(DispatchError::InvalidOperation {
                name: operation.name,
                reason: "name must not be empty".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for param in &operation.params {
            if !seen.insert(param.name.as_str()) {
                return Err(DispatchError::InvalidOperation {
                    name: operation.name.clone(),
                    reason: format!("parameter '{}' is declared twice", param.name),
                });
            }
        }

        if self.index.contains_key(&operation.name) {
            return Err(DispatchError::DuplicateOperation(operation.name));
        }

        tracing::debug!("Registered operation '{}'", operation.name);
        self.index.insert(operation.name.clone(), self.operations.len());
        self.operations.push(operation);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Operation> {
        self.index.get(name).map(|&i| &self.operations[i])
    }

    /// Operations in registration order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn names(&self) -> Vec<&str> {
        self.operations.iter().map(Operation::name).collect()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Validate `raw` and run the named operation's handler once.
    pub async fn invoke(
        &self,
        name: &str,
        raw: &JsonObject,
    ) -> std::result::Result<Payload, DispatchError> {
        let span = tracing::info_span!("invoke", operation = %name);
        self.dispatch(name, raw).instrument(span).await
    }

    async fn dispatch(
        &self,
        name: &str,
        raw: &JsonObject,
    ) -> std::result::Result<Payload, DispatchError> {
        let started = Instant::now();
        tracing::debug!(arguments = raw.len(), "Invocation started");

        let result = async {
            let operation = self
                .get(name)
                .ok_or_else(|| DispatchError::UnknownOperation {
                    name: name.to_string(),
                    available: self.names().join(", "),
                })?;
            let args = operation.validate(raw)?;

            match AssertUnwindSafe(operation.handler.call(args))
                .catch_unwind()
                .await
            {
                Ok(result) => result.map_err(handler_error),
                Err(panic) => Err(DispatchError::Backend(format!(
                    "Operation '{name}' panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            }
        }
        .await;

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &result {
            Ok(_) => tracing::info!(elapsed_ms, "Invocation succeeded"),
            Err(DispatchError::Backend(message)) => {
                tracing::warn!(elapsed_ms, "Backend error: {message}");
            }
            Err(e) => tracing::warn!(elapsed_ms, kind = ?e.kind(), "Invocation rejected: {e}"),
        }

        result
    }
}
