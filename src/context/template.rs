//! `{{ expression }}` substitution

use serde_json::{Map, Value};

use super::{ContextError, ContextMap};
use crate::validation::{Activation, Validator, render};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Substitutes templates against a context map. The activation is built on
/// first use so documents without templates never touch directory contexts.
pub struct TemplateRenderer<'a> {
    contexts: &'a ContextMap,
    activation: Option<Activation>,
}

impl<'a> TemplateRenderer<'a> {
    pub fn new(contexts: &'a ContextMap) -> Self {
        Self {
            contexts,
            activation: None,
        }
    }

    /// Replace templates in every string key and value, recursing into
    /// objects and arrays
    pub fn render_value(&mut self, value: &Value) -> Result<Value, ContextError> {
        match value {
            Value::Object(map) => {
                let mut rendered = Map::with_capacity(map.len());
                for (key, item) in map {
                    let key = if has_template(key) {
                        self.render_str(key)?
                    } else {
                        key.clone()
                    };
                    rendered.insert(key, self.render_value(item)?);
                }
                Ok(Value::Object(rendered))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::String(s) if has_template(s) => self.render_str(s).map(Value::String),
            other => Ok(other.clone()),
        }
    }

    /// Replace every `{{ expr }}` in `input` with the rendered result of `expr`
    pub fn render_str(&mut self, input: &str) -> Result<String, ContextError> {
        let mut output = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find(OPEN) {
            let after_open = &rest[start + OPEN.len()..];
            let Some(end) = after_open.find(CLOSE) else {
                break;
            };
            output.push_str(&rest[..start]);
            output.push_str(&self.evaluate(after_open[..end].trim())?);
            rest = &after_open[end + CLOSE.len()..];
        }
        output.push_str(rest);
        Ok(output)
    }

    fn evaluate(&mut self, expression: &str) -> Result<String, ContextError> {
        let validator = Validator::compile(expression)?;
        if self.activation.is_none() {
            self.activation = Some(self.contexts.to_activation()?);
        }
        let activation = self.activation.as_ref().ok_or(ContextError::NotInitialised)?;

        match validator.evaluate_value(activation) {
            Ok(value) => Ok(render(&value)),
            Err(e) => {
                tracing::warn!(
                    expression = %expression,
                    error = %e,
                    "Template expression failed to evaluate"
                );
                Ok("false".to_string())
            }
        }
    }
}

fn has_template(s: &str) -> bool {
    s.find(OPEN)
        .map(|start| s[start + OPEN.len()..].contains(CLOSE))
        .unwrap_or(false)
}

/// Replace templates throughout `value` using `contexts`
pub fn replace_templates(value: &Value, contexts: &ContextMap) -> Result<Value, ContextError> {
    TemplateRenderer::new(contexts).render_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextValue;
    use serde_json::json;

    fn contexts() -> ContextMap {
        let mut map = ContextMap::new();
        map.insert(
            "example",
            ContextValue::Value(json!({"host": "example.com", "port": 8080, "tags": ["a"]})),
        );
        map
    }

    #[test]
    fn test_string_without_template_untouched() {
        let empty = ContextMap::new();
        let mut renderer = TemplateRenderer::new(&empty);
        assert_eq!(renderer.render_str("plain {{ text").unwrap(), "plain {{ text");
    }

    #[test]
    fn test_multiple_templates_in_one_string() {
        let contexts = contexts();
        let mut renderer = TemplateRenderer::new(&contexts);
        assert_eq!(
            renderer
                .render_str("https://{{ example.host }}:{{example.port}}/path")
                .unwrap(),
            "https://example.com:8080/path"
        );
    }

    #[test]
    fn test_keys_lists_and_nesting() {
        let doc = json!({
            "{{ example.host }}": "key",
            "list": ["{{ example.host }}", {"nested": "{{ example.port }}"}, 3],
            "untouched": true
        });
        let rendered = replace_templates(&doc, &contexts()).unwrap();
        assert_eq!(
            rendered,
            json!({
                "example.com": "key",
                "list": ["example.com", {"nested": "8080"}, 3],
                "untouched": true
            })
        );
    }

    #[test]
    fn test_syntax_error_propagates() {
        let err = replace_templates(&json!({"a": "{{ example. }}"}), &contexts()).unwrap_err();
        assert!(matches!(err, ContextError::Eval(_)));
    }

    #[test]
    fn test_runtime_error_renders_false() {
        let rendered = replace_templates(&json!({"a": "{{ missing.value }}"}), &contexts()).unwrap();
        assert_eq!(rendered, json!({"a": "false"}));
    }

    #[test]
    fn test_boolean_renders_as_cel_literal() {
        let rendered = replace_templates(
            &json!({"a": "{{ example.port == 8080 }}", "b": "{{ size(example.tags) > 1 }}"}),
            &contexts(),
        )
        .unwrap();
        assert_eq!(rendered, json!({"a": "true", "b": "false"}));
    }
}
