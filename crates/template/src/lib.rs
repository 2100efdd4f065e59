//! Handlebars-style templates for digest subjects, bodies and query URLs.
//!
//! Supports `{{path}}` substitution (HTML-escaped or raw `{{{path}}}`),
//! `#if` / `#unless` / `#each` blocks with `{{else}}`, and inline helpers
//! such as `formatDate`. Rendering is a pure function of the template, the
//! context and the `now` the renderer was built with.

pub mod dates;
pub mod helpers;
pub mod parser;
mod render;


use chrono::{DateTime, Utc};
use thiserror::Error;

use digest_common::error::DigestError;
use digest_common::value::Value;

use crate::helpers::{Helper, HelperRegistry};
use crate::parser::Node;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RenderError {
    /// Malformed template text. Raised at compile time.
    #[error("template syntax error: {0}")]
    Syntax(String),

    /// A `{{path}}` substitution refers to data the context does not have.
    #[error("missing value for '{0}'")]
    MissingValue(String),

    /// A helper was unknown or rejected its arguments.
    #[error("helper error: {0}")]
    Helper(String),
}

impl From<RenderError> for DigestError {
    fn from(err: RenderError) -> Self {
        DigestError::Render(err.to_string())
    }
}

/// How substituted values are escaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escape {
    /// Escape HTML metacharacters in `{{...}}` output. Used for digest bodies.
    Html,
    /// Emit values verbatim. Used for subjects and URLs.
    None,
}

/// A compiled template, reusable across renders.
#[derive(Debug, Clone)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    pub fn compile(source: &str) -> Result<Self, RenderError> {
        Ok(Self {
            nodes: parser::parse(source)?,
        })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

/// Renders templates against a context at a fixed point in time.
pub struct Renderer {
    now: DateTime<Utc>,
    escape: Escape,
    helpers: HelperRegistry,
}

impl Renderer {
    /// A renderer that resolves relative dates against `now` and escapes HTML.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now,
            escape: Escape::Html,
            helpers: HelperRegistry::new(),
        }
    }

    pub fn with_escape(mut self, escape: Escape) -> Self {
        self.escape = escape;
        self
    }

    pub fn with_helper(mut self, helper: Box<dyn Helper>) -> Self {
        self.helpers.register(helper);
        self
    }

    /// Compile and render `source` in one step.
    pub fn render(&self, source: &str, context: &Value) -> Result<String, RenderError> {
        let template = Template::compile(source)?;
        self.render_template(&template, context)
    }

    pub fn render_template(
        &self,
        template: &Template,
        context: &Value,
    ) -> Result<String, RenderError> {
        render::render(self, template.nodes(), context)
    }
}

/// Render `template` against `context`, resolving relative dates against `now`.
pub fn render(template: &str, context: &Value, now: DateTime<Utc>) -> Result<String, RenderError> {
    Renderer::at(now).render(template, context)
}
