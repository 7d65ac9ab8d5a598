//! Prompt rendering capability.

use handlebars::Handlebars;
use serde_json::Value;
use thiserror::Error;

/// Prompt rendering error.
#[derive(Debug, Error)]
pub enum PromptError {
    #[error("template error: {0}")]
    Template(String),

    #[error("render error: {0}")]
    Render(String),

    #[error("unknown template `{0}`")]
    UnknownTemplate(String),
}

/// Capability for turning templates plus step data into prompt text.
pub trait PromptService: Send + Sync {
    /// Renders an inline template against the given variables.
    fn render(&self, template: &str, vars: &Value) -> Result<String, PromptError>;

    /// Renders a previously registered template.
    fn render_named(&self, name: &str, vars: &Value) -> Result<String, PromptError>;
}

/// Handlebars-backed [`PromptService`].
pub struct HandlebarsPromptService {
    registry: Handlebars<'static>,
}

impl Default for HandlebarsPromptService {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlebarsPromptService {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        // Missing variables render empty rather than failing the step.
        registry.set_strict_mode(false);
        Self { registry }
    }

    /// Registers a named template at setup time.
    pub fn register_template(
        &mut self,
        name: impl Into<String>,
        template: &str,
    ) -> Result<(), PromptError> {
        self.registry
            .register_template_string(&name.into(), template)
            .map_err(|err| PromptError::Template(err.to_string()))
    }

    pub fn has_template(&self, name: &str) -> bool {
        self.registry.has_template(name)
    }
}

impl PromptService for HandlebarsPromptService {
    fn render(&self, template: &str, vars: &Value) -> Result<String, PromptError> {
        self.registry
            .render_template(template, vars)
            .map_err(|err| PromptError::Render(err.to_string()))
    }

    fn render_named(&self, name: &str, vars: &Value) -> Result<String, PromptError> {
        if !self.registry.has_template(name) {
            return Err(PromptError::UnknownTemplate(name.to_string()));
        }
        self.registry
            .render(name, vars)
            .map_err(|err| PromptError::Render(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_inline() {
        let prompts = HandlebarsPromptService::new();
        let text = prompts
            .render("Hello {{name}}!", &json!({"name": "Ada"}))
            .unwrap();
        assert_eq!(text, "Hello Ada!");
    }

    #[test]
    fn test_missing_variable_renders_empty() {
        let prompts = HandlebarsPromptService::new();
        let text = prompts.render("Hi {{who}}", &json!({})).unwrap();
        assert_eq!(text, "Hi ");
    }

    #[test]
    fn test_named_templates() {
        let mut prompts = HandlebarsPromptService::new();
        prompts
            .register_template("greet", "Welcome, {{user}}.")
            .unwrap();
        assert!(prompts.has_template("greet"));

        let text = prompts
            .render_named("greet", &json!({"user": "Ada"}))
            .unwrap();
        assert_eq!(text, "Welcome, Ada.");

        let err = prompts.render_named("missing", &json!({})).unwrap_err();
        assert!(matches!(err, PromptError::UnknownTemplate(_)));
    }
}
