use serde::Deserialize;
use std::collections::HashMap;

const STRICT_PREFIXES: &[&str] = &[
    "SERVER_", "HTTP_", "REQUEST_", "REMOTE_", "PATH_", "CONTENT_",
];
const STRICT_EXACT: &[&str] = &["SCRIPT_NAME", "QUERY_STRING", "AUTH_TYPE"];
/// Variables copied under a different output name (input, output).
const STRICT_RENAMES: &[(&str, &str)] = &[];

/// Which request variables are handed to the worker as Params.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvFilterPolicy {
    /// Curated CGI prefixes and names only.
    Strict,
    /// Any variable whose name is already upper-case.
    #[default]
    Lenient,
}

impl EnvFilterPolicy {
    pub fn filter(&self, env: &HashMap<String, String>) -> HashMap<String, String> {
        match self {
            Self::Strict => filter_strict(env),
            Self::Lenient => filter_lenient(env),
        }
    }
}

pub fn filter_strict(env: &HashMap<String, String>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (name, value) in env {
        let keep = STRICT_PREFIXES.iter().any(|p| name.starts_with(p))
            || STRICT_EXACT.contains(&name.as_str());
        if keep {
            out.insert(name.clone(), value.clone());
        }
        for (from, to) in STRICT_RENAMES {
            if name == from {
                out.insert((*to).to_string(), value.clone());
            }
        }
    }
    out
}

pub fn filter_lenient(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .filter(|(name, _)| name.to_uppercase() == **name)
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}
