//! Agent specs as loaded from the agents config document.

use serde::{Deserialize, Serialize};

/// Static description of a south-side agent subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub description: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl AgentSpec {
    /// Resolves a `${VAR}` placeholder in `api_key` against the process
    /// environment. Any shape other than an exact `${NAME}` match is
    /// returned unchanged. Unresolved variables resolve to an empty string.
    #[must_use]
    pub fn resolved_api_key(&self) -> Option<String> {
        let raw = self.api_key.as_deref()?;
        Some(resolve_placeholder(raw))
    }
}

fn resolve_placeholder(raw: &str) -> String {
    let Some(name) = raw.strip_prefix("${").and_then(|s| s.strip_suffix('}')) else {
        return raw.to_string();
    };
    std::env::var(name).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(api_key: Option<&str>) -> AgentSpec {
        AgentSpec {
            name: "gemini".into(),
            description: "Gemini CLI agent".into(),
            command: vec!["gemini".into(), "--acp".into()],
            api_key: api_key.map(String::from),
        }
    }

    #[test]
    fn resolves_matching_env_var() {
        unsafe {
            std::env::set_var("ACP2_TEST_KEY", "secret-value");
        }
        let spec = spec(Some("${ACP2_TEST_KEY}"));

        assert_eq!(spec.resolved_api_key().as_deref(), Some("secret-value"));
        unsafe {
            std::env::remove_var("ACP2_TEST_KEY");
        }
    }

    #[test]
    fn unresolved_var_becomes_empty_string() {
        let spec = spec(Some("${ACP2_DEFINITELY_UNSET_VAR}"));

        assert_eq!(spec.resolved_api_key().as_deref(), Some(""));
    }

    #[test]
    fn literal_value_passes_through() {
        let spec = spec(Some("literal-key"));

        assert_eq!(spec.resolved_api_key().as_deref(), Some("literal-key"));
    }

    #[test]
    fn missing_api_key_resolves_to_none() {
        let spec = spec(None);

        assert_eq!(spec.resolved_api_key(), None);
    }
}
