//! Output file naming.
//!
//! A name is produced in three steps: placeholder substitution
//! (`{streamer}`, `{room_title}`), strftime expansion against local time,
//! and a character filter that keeps word characters, `-`, `.`, `%`,
//! brackets (`{}[]【】「」`) and whitespace.  Spaces are kept as-is because
//! streamer names and titles often contain them.

use std::fmt::Write as _;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local};
use thiserror::Error;

/// Time suffix appended to the streamer name when no template is set.
pub const DEFAULT_TIME_PATTERN: &str = "%Y-%m-%dT%H_%M_%S";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilenameError {
    #[error("could not derive file name from '{0}'")]
    Invalid(String),
    #[error("invalid time directive in template '{0}'")]
    BadTimeFormat(String),
}

/// Per-session values substituted into a template.
#[derive(Debug, Clone, Copy)]
pub struct NameFields<'a> {
    pub streamer: &'a str,
    pub room_title: Option<&'a str>,
}

/// Render the output base name for a capture starting at `now`.
pub fn render(
    template: Option<&str>,
    fields: NameFields<'_>,
    now: DateTime<Local>,
) -> Result<String, FilenameError> {
    let template = match template {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => format!("{{streamer}}{DEFAULT_TIME_PATTERN}"),
    };
    // Substituted values are literal text: escape `%` so a title like
    // "100%" survives strftime expansion.
    let substituted = template
        .replace("{streamer}", &escape_percent(fields.streamer))
        .replace(
            "{room_title}",
            &escape_percent(fields.room_title.unwrap_or_default()),
        );
    let expanded = expand_time(&substituted, now)?;
    sanitize(&expanded)
}

/// Expand strftime directives in `template` against `now`.
pub fn expand_time(template: &str, now: DateTime<Local>) -> Result<String, FilenameError> {
    if StrftimeItems::new(template).any(|item| matches!(item, Item::Error)) {
        return Err(FilenameError::BadTimeFormat(template.to_string()));
    }
    let mut out = String::with_capacity(template.len() + 16);
    write!(out, "{}", now.format(template))
        .map_err(|_| FilenameError::BadTimeFormat(template.to_string()))?;
    Ok(out)
}

/// Drop every character that is not safe in a recording file name.
///
/// Fails when nothing usable is left (`""`, `"."` or `".."`).
pub fn sanitize(name: &str) -> Result<String, FilenameError> {
    let s: String = name.chars().filter(|&c| is_permitted(c)).collect();
    if s.is_empty() || s == "." || s == ".." {
        return Err(FilenameError::Invalid(name.to_string()));
    }
    Ok(s)
}

fn is_permitted(c: char) -> bool {
    c.is_alphanumeric()
        || c.is_whitespace()
        || matches!(
            c,
            '_' | '-' | '.' | '%' | '{' | '}' | '[' | ']' | '【' | '】' | '「' | '」'
        )
}

fn escape_percent(s: &str) -> String {
    s.replace('%', "%%")
}
