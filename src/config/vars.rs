//! `${VAR}` substitution in pipeline config files.
//!
//! Recognised forms:
//! - `$VAR`, `${VAR}`: value of VAR; an error if VAR is unset
//! - `${VAR:-fallback}`: fallback when VAR is unset or empty
//! - `${VAR-fallback}`: fallback only when VAR is unset
//! - `$$`: a literal `$`

use std::env;
use std::sync::LazyLock;

use regex::{Captures, Regex};

static VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \$\$
        | \$\{ (?P<braced>[A-Za-z_][A-Za-z0-9_]*) (?: (?P<op>:?-) (?P<fallback>[^}]*) )? \}
        | \$ (?P<bare>[A-Za-z_][A-Za-z0-9_]*)
        ",
    )
    .expect("variable pattern is a valid regex")
});

/// Substitute variables from the process environment.
///
/// Every problem is collected so a config with several missing variables
/// reports all of them at once.
pub(crate) fn interpolate(input: &str) -> Result<String, Vec<String>> {
    interpolate_with(input, |name| env::var(name).ok())
}

/// Substitute variables using `lookup` to resolve names.
pub(crate) fn interpolate_with<F>(input: &str, lookup: F) -> Result<String, Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut errors = Vec::new();
    let text = VAR_PATTERN.replace_all(input, |caps: &Captures<'_>| {
        match substitute(caps, &lookup) {
            Ok(value) => value,
            Err(problem) => {
                errors.push(problem);
                caps[0].to_string()
            }
        }
    });

    if errors.is_empty() {
        Ok(text.into_owned())
    } else {
        Err(errors)
    }
}

fn substitute<F>(caps: &Captures<'_>, lookup: &F) -> Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(name) = caps.name("braced").or_else(|| caps.name("bare")) else {
        return Ok("$".to_string());
    };
    let name = name.as_str();
    let fallback = caps.name("fallback").map(|m| m.as_str());
    let empty_uses_fallback = caps.name("op").is_some_and(|m| m.as_str() == ":-");

    match lookup(name) {
        Some(value) if value.contains(['\n', '\r']) => Err(format!(
            "environment variable '{name}' contains newlines, which is not allowed"
        )),
        Some(value) if value.is_empty() && empty_uses_fallback => {
            Ok(fallback.unwrap_or_default().to_string())
        }
        Some(value) => Ok(value),
        None => fallback
            .map(str::to_string)
            .ok_or_else(|| format!("environment variable '{name}' is not set")),
    }
}
