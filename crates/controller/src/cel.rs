use std::sync::Arc;

use cel_interpreter::{Context, Program, Value};

use crate::{Error, Result};

/// Checks that a cost expression compiles and evaluates to an integer over
/// the variable schema the processor exposes at runtime: `model` and
/// `backend` as strings, `input_tokens`, `output_tokens` and `total_tokens`
/// as unsigned integers. Representative bindings are used for the probe run
/// since undeclared references only surface at evaluation time.
pub fn validate_cost_expression(expression: &str) -> Result<()> {
    let program = Program::compile(expression).map_err(|e| Error::Cel {
        expression: expression.to_string(),
        message: e.to_string(),
    })?;

    let mut context = Context::default();
    context.add_variable_from_value("model", Value::String(Arc::new("some-model".to_string())));
    context.add_variable_from_value(
        "backend",
        Value::String(Arc::new("some-backend.default".to_string())),
    );
    context.add_variable_from_value("input_tokens", Value::UInt(1));
    context.add_variable_from_value("output_tokens", Value::UInt(1));
    context.add_variable_from_value("total_tokens", Value::UInt(2));

    let value = program.execute(&context).map_err(|e| Error::Cel {
        expression: expression.to_string(),
        message: e.to_string(),
    })?;

    match value {
        Value::Int(_) | Value::UInt(_) => Ok(()),
        other => Err(Error::Cel {
            expression: expression.to_string(),
            message: format!("must evaluate to an integer, got {other:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_token_arithmetic() {
        validate_cost_expression("input_tokens + output_tokens").unwrap();
        validate_cost_expression("input_tokens * output_tokens").unwrap();
        validate_cost_expression("total_tokens").unwrap();
    }

    #[test]
    fn accepts_conditionals_over_the_variable_schema() {
        validate_cost_expression("model == 'x' ? input_tokens : total_tokens").unwrap();
        validate_cost_expression("backend == 'b.ns' ? 0 : total_tokens").unwrap();
    }

    #[test]
    fn rejects_unknown_variables() {
        let err = validate_cost_expression("bogus_var").unwrap_err();
        assert!(matches!(err, Error::Cel { .. }), "got {err:?}");
        assert!(err.to_string().contains("bogus_var"));
    }

    #[test]
    fn rejects_non_integer_results() {
        let err = validate_cost_expression("model").unwrap_err();
        assert!(err.to_string().contains("integer"), "got {err}");
    }

    #[test]
    fn rejects_syntax_errors() {
        validate_cost_expression("input_tokens +").unwrap_err();
    }
}
