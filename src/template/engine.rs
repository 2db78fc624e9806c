//! Template engine with `${...}` placeholder syntax
//!
//! Uses minijinja with custom syntax configuration:
//! - Variable delimiters: `${...}`
//! - Block delimiters: `{%...%}`
//! - Comment delimiters: `{#...#}`
//! - Escape: `$${...}` produces literal `${...}`

use minijinja::syntax::SyntaxConfig;
use minijinja::{Environment, UndefinedBehavior, Value};

use super::error::TemplateError;

/// Placeholder for escaped `$${` during preprocessing
const ESCAPED_PLACEHOLDER: &str = "\x00__PHANTOMLET_ESCAPED_DOLLAR_BRACE__\x00";

/// Template engine for status document rendering
///
/// Undefined variables are strict errors: a template referencing a field
/// the input lacks fails the render instead of silently emitting nothing,
/// which keeps status documents well-formed.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create a new template engine.
    ///
    /// # Panics
    ///
    /// Panics if the minijinja syntax configuration fails to build, which
    /// cannot happen with the hardcoded delimiters used here.
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_syntax(Self::syntax());
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_filter("default", default_filter);

        Self { env }
    }

    fn syntax() -> SyntaxConfig {
        SyntaxConfig::builder()
            .variable_delimiters("${", "}")
            .block_delimiters("{%", "%}")
            .comment_delimiters("{#", "#}")
            .build()
            .expect("template syntax configuration is hardcoded and valid")
    }

    /// Render a template string with the given context value
    ///
    /// # Errors
    ///
    /// Returns `TemplateError` for invalid syntax, undefined variables,
    /// or failing filters.
    pub fn render(&self, template: &str, ctx: &Value) -> Result<String, TemplateError> {
        let preprocessed = template.replace("$${", ESCAPED_PLACEHOLDER);

        let rendered = self
            .env
            .render_str(&preprocessed, ctx)
            .map_err(TemplateError::from)?;

        Ok(rendered.replace(ESCAPED_PLACEHOLDER, "${"))
    }

    /// Check that a template parses, without rendering it.
    ///
    /// Undefined variables are not detected here; they surface per render.
    pub fn validate_syntax(template: &str) -> Result<(), TemplateError> {
        let mut env = Environment::new();
        env.set_syntax(Self::syntax());
        env.template_from_str(template)
            .map(|_| ())
            .map_err(TemplateError::from)
    }
}

/// `${value | default("fallback")}` - substitute a fallback for null values
fn default_filter(value: Value, fallback: Value) -> Value {
    if value.is_undefined() || value.is_none() {
        fallback
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: serde_json::Value) -> Value {
        Value::from_serialize(&value)
    }

    #[test]
    fn test_simple_variable() {
        let engine = TemplateEngine::new();
        let result = engine
            .render("${name}", &ctx(json!({"name": "node0"})))
            .expect("simple variable should render");
        assert_eq!(result, "node0");
    }

    #[test]
    fn test_nested_field_access() {
        let engine = TemplateEngine::new();
        let result = engine
            .render(
                "${pod.spec.nodeName}",
                &ctx(json!({"pod": {"spec": {"nodeName": "node0"}}})),
            )
            .expect("nested field should render");
        assert_eq!(result, "node0");
    }

    #[test]
    fn test_for_block_over_list() {
        let engine = TemplateEngine::new();
        let result = engine
            .render(
                "{%- for c in containers %}\n- ${c.name}{%- endfor %}",
                &ctx(json!({"containers": [{"name": "a"}, {"name": "b"}]})),
            )
            .expect("for block should render");
        assert_eq!(result, "\n- a\n- b");
    }

    #[test]
    fn test_undefined_variable_is_strict() {
        let engine = TemplateEngine::new();
        assert!(engine.render("${missing}", &ctx(json!({}))).is_err());
        assert!(engine
            .render("${a.b.c}", &ctx(json!({"a": {}})))
            .is_err());
    }

    #[test]
    fn test_escape_produces_literal() {
        let engine = TemplateEngine::new();
        let result = engine
            .render("$${HOME} and ${name}", &ctx(json!({"name": "x"})))
            .expect("escape should render");
        assert_eq!(result, "${HOME} and x");
    }

    #[test]
    fn test_literal_dollar_without_brace() {
        let engine = TemplateEngine::new();
        let result = engine
            .render("$PATH costs $5", &ctx(json!({})))
            .expect("plain dollars pass through");
        assert_eq!(result, "$PATH costs $5");
    }

    #[test]
    fn test_default_filter_on_null() {
        let engine = TemplateEngine::new();
        let result = engine
            .render("${ip | default(\"\")}", &ctx(json!({"ip": null})))
            .expect("default filter should render");
        assert_eq!(result, "");
    }

    #[test]
    fn test_validate_syntax() {
        assert!(TemplateEngine::validate_syntax("phase: ${phase}").is_ok());
        assert!(TemplateEngine::validate_syntax("{% for c in list %}x{% endfor %}").is_ok());
        assert!(TemplateEngine::validate_syntax("{% for c in %}").is_err());
    }
}
