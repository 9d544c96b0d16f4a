use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tower::BoxError;

use crate::function::{function_typed, TypedFunction};

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AddInput {
    pub a: i64,
    pub b: i64,
}

#[derive(Debug, Serialize, JsonSchema)]
pub struct AddOutput {
    pub result: i64,
}

/// "Add": integer addition. Overflow is a function failure.
pub fn add() -> TypedFunction<AddInput, AddOutput> {
    function_typed("Add", "Add two numbers", |input: AddInput| async move {
        let result = input
            .a
            .checked_add(input.b)
            .ok_or_else(|| BoxError::from("integer overflow"))?;
        Ok::<_, BoxError>(AddOutput { result })
    })
}
