//! Body template rendering.
//!
//! Strict mode is deliberate: a job referencing a variable it does not
//! carry is a malformed payload and must fail before any transport
//! attempt, not go out with a hole in the body.

use crate::error::DispatchResult;
use handlebars::Handlebars;
use std::collections::BTreeMap;

pub struct TemplateEngine {
    registry: Handlebars<'static>,
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        Self { registry }
    }

    pub fn render(
        &self,
        template: &str,
        variables: &BTreeMap<String, String>,
    ) -> DispatchResult<String> {
        Ok(self.registry.render_template(template, variables)?)
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}
