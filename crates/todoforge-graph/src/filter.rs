//! OData `$filter` expressions used against To Do resources.

use crate::models::TaskStatus;

/// Escape a value for use inside a single-quoted OData string literal.
pub fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Lists whose display name contains `name`.
pub fn display_name_contains(name: &str) -> String {
    format!("contains(displayName,'{}')", escape_literal(name))
}

/// Tasks whose title contains `text`.
pub fn title_contains(text: &str) -> String {
    format!("contains(title,'{}')", escape_literal(text))
}

/// Tasks with exactly this status.
pub fn status_eq(status: TaskStatus) -> String {
    format!("status eq '{}'", status)
}

/// Tasks with any status but this one.
pub fn status_ne(status: TaskStatus) -> String {
    format!("status ne '{}'", status)
}
