//! SQL generation for published data services.
//!
//! Everything here is pure: parameters are assembled and coerced in
//! [`params`], checked and table-qualified in [`safety`], and turned into the
//! final engine SQL by [`builder`].

pub mod builder;
pub mod params;
pub mod safety;

pub use builder::{QueryContext, script_query, wizard_query};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlError {
    /// One message per offending parameter.
    Invalid(Vec<String>),
    Unsafe(String),
}

impl SqlError {
    pub fn invalid(message: impl Into<String>) -> Self {
        SqlError::Invalid(vec![message.into()])
    }

    pub fn unsafe_sql(reason: impl Into<String>) -> Self {
        SqlError::Unsafe(reason.into())
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Invalid(errors) => write!(f, "invalid parameters: {}", errors.join("; ")),
            SqlError::Unsafe(reason) => write!(f, "unsafe sql: {}", reason),
        }
    }
}

impl std::error::Error for SqlError {}
