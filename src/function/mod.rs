//! Function system for samples
//!
//! A function is a named, schema-typed capability the agent may invoke. The
//! model selects functions by slug at runtime; resolution is a lookup in a
//! `FunctionSet`, never reflection.

pub mod context;

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_openai::types::{ChatCompletionTool, ChatCompletionToolArgs, ChatCompletionToolType, FunctionObjectArgs};
use async_trait::async_trait;
use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tower::BoxError;
use tracing::warn;

pub use context::{Clock, FixedClock, RunContext, SystemClock};

/// Failure of a single function call.
#[derive(Debug, Error)]
pub enum FunctionError {
    /// The arguments do not match the function's input schema
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The function ran and failed
    #[error(transparent)]
    Failed(BoxError),
}

impl FunctionError {
    pub fn failed(err: impl Into<BoxError>) -> Self {
        FunctionError::Failed(err.into())
    }
}

/// Stable identifier derived from a display name: lowercased, spaces to underscores.
pub fn slugify(name: &str) -> String {
    name.to_lowercase().replace(' ', "_")
}

/// Trait for every capability an agent can call
#[async_trait]
pub trait Function: Send + Sync {
    /// Display name, e.g. "Send Message"
    fn name(&self) -> &str;

    /// Identifier the model uses to call this function
    fn slug(&self) -> String {
        slugify(self.name())
    }

    fn description(&self) -> &str;

    /// JSON schema of the input object
    fn input_schema(&self) -> Value;

    /// JSON schema of the output object
    fn output_schema(&self) -> Value;

    /// Invoke the function. Calls must be safe to retry.
    async fn call(&self, input: Value, cx: &mut RunContext) -> Result<Value, FunctionError>;
}

/// Build an OpenAI tool specification.
pub fn tool_spec(name: &str, description: &str, parameters: Value) -> ChatCompletionTool {
    let func = FunctionObjectArgs::default()
        .name(name)
        .description(description)
        .parameters(parameters)
        .build()
        .expect("valid function object");
    ChatCompletionToolArgs::default()
        .r#type(ChatCompletionToolType::Function)
        .function(func)
        .build()
        .expect("valid chat tool")
}

/// Tool specification for a function: slug, description and input schema.
pub fn to_openai_tool(function: &dyn Function) -> ChatCompletionTool {
    tool_spec(&function.slug(), function.description(), function.input_schema())
}

/// Schema of `T` as a JSON value, definitions included.
pub fn schema_value<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema).expect("schema to value")
}

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, FunctionError>> + Send + Sync>;

/// Function with schemas derived from Rust input/output types.
///
/// Decoding the model's arguments into `I` is the validation step.
pub struct TypedFunction<I, O> {
    name: String,
    description: String,
    input_schema: Value,
    output_schema: Value,
    handler: Handler,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> std::fmt::Debug for TypedFunction<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedFunction")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

#[async_trait]
impl<I, O> Function for TypedFunction<I, O> {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.input_schema.clone()
    }

    fn output_schema(&self) -> Value {
        self.output_schema.clone()
    }

    async fn call(&self, input: Value, _cx: &mut RunContext) -> Result<Value, FunctionError> {
        (self.handler)(input).await
    }
}

/// DX sugar: create a function from a typed async handler.
/// - `I` is the input struct (Deserialize + JsonSchema)
/// - `O` is the output struct (Serialize + JsonSchema)
pub fn function_typed<I, O, H, Fut>(
    name: impl Into<String>,
    description: impl Into<String>,
    handler: H,
) -> TypedFunction<I, O>
where
    I: DeserializeOwned + JsonSchema + Send + 'static,
    O: Serialize + JsonSchema + Send + 'static,
    H: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, BoxError>> + Send + 'static,
{
    let handler = Arc::new(handler);
    let erased: Handler = Arc::new(move |raw: Value| {
        let h = handler.clone();
        Box::pin(async move {
            let input: I = serde_json::from_value(raw)
                .map_err(|e| FunctionError::InvalidArguments(e.to_string()))?;
            let output = (h.as_ref())(input).await.map_err(FunctionError::Failed)?;
            serde_json::to_value(output).map_err(FunctionError::failed)
        })
    });
    TypedFunction {
        name: name.into(),
        description: description.into(),
        input_schema: schema_value::<I>(),
        output_schema: schema_value::<O>(),
        handler: erased,
        _types: PhantomData,
    }
}

/// Function defined by explicit JSON schemas and a JSON handler.
pub struct RawFunction {
    name: String,
    description: String,
    input_schema: Value,
    output_schema: Value,
    handler: Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, BoxError>> + Send + Sync>,
}

impl RawFunction {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        output_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            output_schema,
            handler: Arc::new(move |v| Box::pin(handler(v))),
        }
    }
}

impl std::fmt::Debug for RawFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFunction")
            .field("name", &self.name)
            .field("input_schema", &self.input_schema)
            .finish()
    }
}

#[async_trait]
impl Function for RawFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> Value {
        self.input_schema.clone()
    }

    fn output_schema(&self) -> Value {
        self.output_schema.clone()
    }

    async fn call(&self, input: Value, _cx: &mut RunContext) -> Result<Value, FunctionError> {
        check_required(&self.input_schema, &input).map_err(FunctionError::InvalidArguments)?;
        (self.handler)(input).await.map_err(FunctionError::Failed)
    }
}

/// Minimal structural check: the input is an object carrying every `required` key.
fn check_required(schema: &Value, input: &Value) -> Result<(), String> {
    if schema.get("type").and_then(|t| t.as_str()) == Some("object") && !input.is_object() {
        return Err("arguments must be an object".to_string());
    }
    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        for field in required.iter().filter_map(|f| f.as_str()) {
            if input.get(field).is_none() {
                return Err(format!("missing required field: {}", field));
            }
        }
    }
    Ok(())
}

/// Ordered set of functions, resolved by slug.
#[derive(Clone, Default)]
pub struct FunctionSet {
    functions: Vec<Arc<dyn Function>>,
    slug_to_index: HashMap<String, usize>,
}

impl FunctionSet {
    pub fn new(functions: Vec<Arc<dyn Function>>) -> Self {
        let mut set = Self::default();
        for f in functions {
            set.insert(f);
        }
        set
    }

    /// Add a function. A second function with the same slug is ignored.
    pub fn insert(&mut self, function: Arc<dyn Function>) {
        let slug = function.slug();
        if self.slug_to_index.contains_key(&slug) {
            warn!(slug = %slug, "duplicate function slug ignored");
            return;
        }
        self.slug_to_index.insert(slug, self.functions.len());
        self.functions.push(function);
    }

    pub fn get(&self, slug: &str) -> Option<&Arc<dyn Function>> {
        self.slug_to_index.get(slug).map(|&i| &self.functions[i])
    }

    pub fn contains(&self, slug: &str) -> bool {
        self.slug_to_index.contains_key(slug)
    }

    pub fn slugs(&self) -> Vec<String> {
        self.functions.iter().map(|f| f.slug()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Function>> {
        self.functions.iter()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Tool specifications in registration order.
    pub fn tool_specs(&self) -> Vec<ChatCompletionTool> {
        self.functions.iter().map(|f| to_openai_tool(f.as_ref())).collect()
    }
}

impl std::fmt::Debug for FunctionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.slugs()).finish()
    }
}
