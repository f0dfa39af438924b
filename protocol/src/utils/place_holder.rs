use std::collections::HashMap;
use strfmt::FmtError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlaceHolderError {
    #[error("formatting error: {0}")]
    FormatError(#[from] FmtError),
}

pub trait PlaceHolderRender {
    /// Replaces `{Name}` placeholders with values from `vars`.
    ///
    /// Unknown placeholders are an error, so a template that drifted from the
    /// variables the caller provides never renders half-filled.
    fn format(&self, vars: &HashMap<String, String>) -> Result<String, PlaceHolderError>;
}

impl PlaceHolderRender for String {
    fn format(&self, vars: &HashMap<String, String>) -> Result<String, PlaceHolderError> {
        strfmt::strfmt(self, vars).map_err(PlaceHolderError::FormatError)
    }
}

impl PlaceHolderRender for &str {
    fn format(&self, vars: &HashMap<String, String>) -> Result<String, PlaceHolderError> {
        strfmt::strfmt(self, vars).map_err(PlaceHolderError::FormatError)
    }
}

/// Renders every element of an argument vector.
pub fn render_all<S: AsRef<str>>(
    templates: &[S],
    vars: &HashMap<String, String>,
) -> Result<Vec<String>, PlaceHolderError> {
    templates.iter().map(|t| t.as_ref().format(vars)).collect()
}
