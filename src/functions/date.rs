use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::function::{schema_value, Function, FunctionError, RunContext};

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct CurrentDateInput {}

#[derive(Debug, Serialize, JsonSchema)]
pub struct CurrentDateOutput {
    /// ISO 8601 date
    pub date: String,
    pub weekday: String,
}

/// "Current Date": today's date according to the run's clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentDate;

#[async_trait]
impl Function for CurrentDate {
    fn name(&self) -> &str {
        "Current Date"
    }

    fn description(&self) -> &str {
        "Get the current date"
    }

    fn input_schema(&self) -> Value {
        schema_value::<CurrentDateInput>()
    }

    fn output_schema(&self) -> Value {
        schema_value::<CurrentDateOutput>()
    }

    async fn call(&self, input: Value, cx: &mut RunContext) -> Result<Value, FunctionError> {
        // Models sometimes send `null` for a parameterless call.
        if !input.is_null() {
            serde_json::from_value::<CurrentDateInput>(input)
                .map_err(|e| FunctionError::InvalidArguments(e.to_string()))?;
        }
        let today = cx.today();
        let out = CurrentDateOutput {
            date: today.format("%Y-%m-%d").to_string(),
            weekday: today.format("%A").to_string(),
        };
        serde_json::to_value(out).map_err(FunctionError::failed)
    }
}
