//! Inline helpers callable from templates, e.g. `{{formatDate '2 days ago' 'YYYY-MM-DD'}}`.

use chrono::{DateTime, Utc};

use digest_common::value::Value;

use crate::{RenderError, dates};

/// Trait implemented by every inline helper.
pub trait Helper: Send + Sync {
    /// Name used to invoke the helper from a template.
    fn name(&self) -> &'static str;

    /// Evaluate the helper. Arguments are already resolved against the
    /// current scope; `now` is the renderer's clock reading.
    fn call(&self, args: &[Value], now: DateTime<Utc>) -> Result<Value, RenderError>;
}

/// `formatDate phrase [pattern]`.
pub struct FormatDate;

impl Helper for FormatDate {
    fn name(&self) -> &'static str {
        "formatDate"
    }

    fn call(&self, args: &[Value], now: DateTime<Utc>) -> Result<Value, RenderError> {
        let phrase = match args.first() {
            Some(Value::String(s)) => s.as_str(),
            Some(Value::Absent) => return Ok(Value::Absent),
            Some(other) => {
                return Err(RenderError::Helper(format!(
                    "formatDate: expected a date string, got '{}'",
                    other
                )));
            }
            None => {
                return Err(RenderError::Helper(
                    "formatDate: missing date argument".to_string(),
                ));
            }
        };

        let pattern = match args.get(1) {
            Some(Value::String(s)) => s.as_str(),
            None => "YYYY-MM-DD",
            Some(other) => {
                return Err(RenderError::Helper(format!(
                    "formatDate: expected a format pattern, got '{}'",
                    other
                )));
            }
        };

        let date = dates::resolve(phrase, now)?;
        Ok(Value::String(dates::format(date, pattern)))
    }
}

/// Registry of the helpers a renderer can call.
pub struct HelperRegistry {
    helpers: Vec<Box<dyn Helper>>,
}

impl HelperRegistry {
    /// A registry with every built-in helper.
    pub fn new() -> Self {
        Self {
            helpers: vec![Box::new(FormatDate)],
        }
    }

    /// Register an additional helper. A helper with the same name replaces
    /// the existing one.
    pub fn register(&mut self, helper: Box<dyn Helper>) {
        self.helpers.retain(|h| h.name() != helper.name());
        self.helpers.push(helper);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Helper> {
        self.helpers
            .iter()
            .find(|h| h.name() == name)
            .map(|h| h.as_ref())
    }
}

impl Default for HelperRegistry {
    fn default() -> Self {
        Self::new()
    }
}
