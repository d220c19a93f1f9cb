use anyhow::{anyhow, Result};
use regex::{Captures, Regex};
use std::sync::OnceLock;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$(\$)?\{([A-Za-z_][A-Za-z0-9_]*)(?::-(.*?))?\}")
            .expect("static envsubst regex")
    })
}

/// Expand `${NAME}` and `${NAME:-default}` from the process environment.
///
/// `$${NAME}` is written out as a literal `${NAME}`, which is how a rewrite
/// replacement refers to a named capture group. Numbered references such as
/// `$1` and `${1}` never match a placeholder and pass through unchanged.
pub fn expand_env(input: &str) -> Result<String> {
    expand_with(input, |name| std::env::var(name).ok())
}

/// [`expand_env`] with an explicit variable lookup.
pub fn expand_with<F>(input: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = Vec::new();
    let expanded = placeholder().replace_all(input, |caps: &Captures<'_>| {
        let name = &caps[2];
        if caps.get(1).is_some() {
            return caps[0][1..].to_string();
        }
        match (lookup(name), caps.get(3)) {
            (Some(value), _) => value,
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
                String::new()
            }
        }
    });
    if !missing.is_empty() {
        return Err(anyhow!("missing environment variable: {}", missing.join(", ")));
    }
    Ok(expanded.into_owned())
}
