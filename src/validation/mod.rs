//! Validation expression evaluator
//!
//! Validation rules are CEL expressions evaluated against a probe result
//! (`spec`, `data`) plus the named contexts. Two failure modes are kept apart:
//!
//! - a syntax error is an authoring mistake and is returned as
//!   [`EvalError::Syntax`];
//! - a runtime error (missing field, type mismatch) means the result did not
//!   satisfy the rule and evaluates to `false`.

pub mod convert;
mod functions;

use cel_interpreter::{Context, ExecutionError, Program, Value};
use serde_json::Map;
use std::collections::BTreeMap;

pub use convert::{cel_to_json, json_to_cel, render};

/// Default rule for DNS checks: NOERROR, at least one A record, under 10s
pub const DEFAULT_DNS_VALIDATION_RULE: &str = "data['response-code'] == 'NOERROR' && size(data['A']) >= 1 && (timestamp(data['endTimestamp']) - timestamp(data['startTimestamp']) < duration('10s'))";

/// Default rule for HTTP checks
pub const DEFAULT_HTTP_VALIDATION_RULE: &str = "data['status-code'] in [200, 201]";

/// Default rule for internal checks
pub const DEFAULT_INTERNAL_VALIDATION_RULE: &str = "true";

/// Names bound to the result record; contexts may not use them
const RESERVED_NAMES: &[&str] = &["spec", "data"];

/// Evaluator errors
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("Invalid CEL expression '{expression}': {message}")]
    Syntax { expression: String, message: String },

    #[error("validation context cannot contain a '{0}' key")]
    ReservedContextKey(String),
}

/// Variables visible to an expression
#[derive(Debug, Clone, Default)]
pub struct Activation {
    variables: BTreeMap<String, Value>,
}

impl Activation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind every key of a JSON object as a top-level variable
    pub fn from_json_map(map: &Map<String, serde_json::Value>) -> Self {
        let mut activation = Self::new();
        for (name, value) in map {
            activation.insert(name, value);
        }
        activation
    }

    /// Bind a probe result plus named contexts.
    ///
    /// Fails when a context would shadow `spec` or `data`.
    pub fn for_result<'a, I>(
        spec: &Map<String, serde_json::Value>,
        data: &Map<String, serde_json::Value>,
        contexts: I,
    ) -> Result<Self, EvalError>
    where
        I: IntoIterator<Item = (&'a str, serde_json::Value)>,
    {
        let mut activation = Self::new();
        for (name, value) in contexts {
            if RESERVED_NAMES.contains(&name) {
                return Err(EvalError::ReservedContextKey(name.to_string()));
            }
            activation.insert(name, &value);
        }
        activation.insert_value("spec", json_to_cel(&serde_json::Value::Object(spec.clone())));
        activation.insert_value("data", json_to_cel(&serde_json::Value::Object(data.clone())));
        Ok(activation)
    }

    pub fn insert(&mut self, name: &str, value: &serde_json::Value) {
        self.insert_value(name, json_to_cel(value));
    }

    pub fn insert_value(&mut self, name: &str, value: Value) {
        self.variables.insert(name.to_string(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    fn to_context(&self) -> Context<'static> {
        let mut context = Context::default();
        context.add_function("parse_json", functions::parse_json);
        context.add_function("parse_yaml", functions::parse_yaml);
        context.add_function("b64encode", functions::b64encode);
        context.add_function("b64decode", functions::b64decode);
        for (name, value) in &self.variables {
            context.add_variable_from_value(name.clone(), value.clone());
        }
        context
    }
}

/// A compiled validation expression
pub struct Validator {
    expression: String,
    program: Program,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("expression", &self.expression)
            .finish()
    }
}

impl Validator {
    /// Compile an expression. Syntax errors are returned, never swallowed.
    pub fn compile(expression: &str) -> Result<Self, EvalError> {
        let program = Program::compile(expression).map_err(|e| EvalError::Syntax {
            expression: expression.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            expression: expression.to_string(),
            program,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Evaluate and return the raw value
    pub fn evaluate_value(&self, activation: &Activation) -> Result<Value, ExecutionError> {
        let context = activation.to_context();
        self.program.execute(&context)
    }

    /// Evaluate as a verdict. Runtime errors and non-boolean results are `false`.
    pub fn evaluate(&self, activation: &Activation) -> bool {
        match self.evaluate_value(activation) {
            Ok(Value::Bool(passed)) => passed,
            Ok(other) => {
                tracing::debug!(
                    expression = %self.expression,
                    "Validation rule returned non-boolean value {:?}",
                    other
                );
                false
            }
            Err(e) => {
                tracing::debug!(
                    expression = %self.expression,
                    error = %e,
                    "Validation rule failed to evaluate"
                );
                false
            }
        }
    }
}

/// Compile and evaluate `expression` with every key of `context` bound as a variable
pub fn evaluate(context: &Map<String, serde_json::Value>, expression: &str) -> Result<bool, EvalError> {
    let validator = Validator::compile(expression)?;
    Ok(validator.evaluate(&Activation::from_json_map(context)))
}

/// Check that an expression compiles
pub fn check_syntax(expression: &str) -> Result<(), EvalError> {
    Validator::compile(expression).map(|_| ())
}
