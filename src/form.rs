//! Client-side form validation that gates mutation submission.

use std::collections::BTreeMap;

use crate::mutation::Mutation;
use crate::{Result, SkuldError};

/// Field errors of a form. Submission is refused while any are present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormState {
    errors: BTreeMap<String, String>,
}

impl FormState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.insert(field.into(), message.into());
    }

    pub fn clear_error(&mut self, field: &str) {
        self.errors.remove(field);
    }

    /// Record `message` for `field` when `value` is blank, clear it otherwise.
    pub fn require(&mut self, field: &str, value: &str, message: &str) {
        if value.trim().is_empty() {
            self.set_error(field, message);
        } else {
            self.clear_error(field);
        }
    }

    pub fn error(&self, field: &str) -> Option<&str> {
        self.errors.get(field).map(String::as_str)
    }

    pub fn errors(&self) -> &BTreeMap<String, String> {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// `Err(SkuldError::Validation)` listing every failing field.
    pub fn ensure_valid(&self) -> Result<()> {
        if !self.has_errors() {
            return Ok(());
        }
        let message = self
            .errors
            .iter()
            .map(|(field, message)| format!("{field}: {message}"))
            .collect::<Vec<_>>()
            .join(", ");
        Err(SkuldError::Validation(message))
    }

    /// Run `mutation` only if the form is valid. A refused submission never
    /// reaches the mutation, so its status stays as it was.
    pub async fn submit<V, T>(&self, mutation: &Mutation<V, T>, vars: V) -> Result<T>
    where
        V: Send + 'static,
        T: Clone + Send + Sync + 'static,
    {
        self.ensure_valid()?;
        mutation.mutate_async(vars).await
    }
}
