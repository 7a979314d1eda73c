//! `${NAME}` and `${NAME:-default}` expansion for config files.

use anyhow::{anyhow, Result};
use regex::Regex;
use std::sync::OnceLock;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-(.*?))?\}").expect("placeholder regex")
    })
}

/// Expand placeholders from the process environment.
pub fn expand_env(input: &str) -> Result<String> {
    expand_with(input, |name| std::env::var(name).ok())
}

/// Expand placeholders using `lookup`; a missing variable without a default
/// is an error so typos do not silently become empty strings.
pub fn expand_with<F>(input: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in placeholder().captures_iter(input) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&input[last..whole.start()]);
        let value = match (lookup(name.as_str()), caps.get(2)) {
            (Some(v), _) => v,
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => {
                return Err(anyhow!(
                    "missing environment variable: {}",
                    name.as_str()
                ))
            }
        };
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}
