use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::config::model::EnvVar;

/// Compiled pattern matching `{{ env:NAME }}` template expressions.
static ENV_TEMPLATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\{\{\s*env:(\w+)\s*\}\}$").expect("env template regex must compile")
});

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("env var '{variable}' referenced by '{field}' is not set")]
    UnsetVariable { field: String, variable: String },
}

/// Resolve a list of `{name, value}` pairs into a plain env map.
///
/// A value of the exact form `{{ env:NAME }}` is replaced with the value of
/// `NAME` from the calling environment; anything else passes through
/// verbatim. The non-interpolated form never survives resolution — an unset
/// variable is an error, not an empty string.
pub fn interpolate_envs(envs: &[EnvVar]) -> Result<BTreeMap<String, String>, TemplateError> {
    let mut out = BTreeMap::new();
    for env in envs {
        let value = match ENV_TEMPLATE_RE.captures(env.value.trim()) {
            Some(cap) => {
                let variable = cap[1].to_string();
                std::env::var(&variable).map_err(|_| TemplateError::UnsetVariable {
                    field: env.name.clone(),
                    variable,
                })?
            }
            None => env.value.clone(),
        };
        out.insert(env.name.clone(), value);
    }
    Ok(out)
}
