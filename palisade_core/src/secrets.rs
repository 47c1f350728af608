//! Secrets loader: per-destination env vars from an optional YAML file.
//!
//! A missing file yields an empty store. Scalar values are coerced to strings
//! so YAML-parsed ints and bools pass cleanly into a subprocess environment.

use crate::error::{CoreError, Result};
use std::{collections::HashMap, path::Path};

#[derive(Debug, Default)]
pub struct SecretsStore {
    secrets: HashMap<String, HashMap<String, String>>,
}

impl SecretsStore {
    /// Load the secrets file. A missing file is silently treated as empty.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }

        let raw: serde_yaml::Value = serde_yaml::from_str(&text)?;
        let serde_yaml::Value::Mapping(entries) = raw else {
            return Err(CoreError::Config(format!(
                "{}: secrets file must be a YAML mapping at the top level",
                path.display()
            )));
        };

        let mut secrets = HashMap::with_capacity(entries.len());
        for (dest_name, env_vars) in entries {
            let dest_name = yaml_scalar_to_string(&dest_name).ok_or_else(|| {
                CoreError::Config(format!(
                    "{}: destination names must be strings",
                    path.display()
                ))
            })?;
            let serde_yaml::Value::Mapping(env_vars) = env_vars else {
                return Err(CoreError::Config(format!(
                    "{}: entry '{dest_name}' must be a mapping of env var names to values",
                    path.display()
                )));
            };

            let mut env = HashMap::with_capacity(env_vars.len());
            for (key, value) in env_vars {
                let (Some(key), Some(value)) =
                    (yaml_scalar_to_string(&key), yaml_scalar_to_string(&value))
                else {
                    return Err(CoreError::Config(format!(
                        "{}: entry '{dest_name}' has a non-scalar env var",
                        path.display()
                    )));
                };
                env.insert(key, value);
            }
            secrets.insert(dest_name, env);
        }

        Ok(Self { secrets })
    }

    /// Secrets-file env vars for the named destination, or an empty map.
    pub fn destination_env(&self, name: &str) -> HashMap<String, String> {
        self.secrets.get(name).cloned().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

fn yaml_scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn load_str(yaml: &str) -> Result<SecretsStore> {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();
        SecretsStore::load(file.path())
    }

    #[test]
    fn missing_file_yields_empty_store() {
        let store = SecretsStore::load(Path::new("/nonexistent/secrets.yml")).unwrap();
        assert!(store.is_empty());
        assert!(store.destination_env("anything").is_empty());
    }

    #[test]
    fn per_destination_env_returned() {
        let store = load_str("github:\n  GITHUB_TOKEN: abc123\n  API_URL: https://api\n").unwrap();
        let env = store.destination_env("github");
        assert_eq!(env.get("GITHUB_TOKEN").map(String::as_str), Some("abc123"));
        assert_eq!(env.len(), 2);
        assert!(store.destination_env("other").is_empty());
    }

    #[test]
    fn scalars_coerced_to_strings() {
        let store = load_str("tool:\n  PORT: 8080\n  DEBUG: true\n").unwrap();
        let env = store.destination_env("tool");
        assert_eq!(env.get("PORT").map(String::as_str), Some("8080"));
        assert_eq!(env.get("DEBUG").map(String::as_str), Some("true"));
    }

    #[test]
    fn non_mapping_entry_fails() {
        let err = load_str("tool: just-a-string\n").unwrap_err();
        assert!(err.to_string().contains("must be a mapping"));
    }

    #[test]
    fn empty_file_yields_empty_store() {
        assert!(load_str("").unwrap().is_empty());
    }
}
