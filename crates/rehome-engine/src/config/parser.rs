//! Job YAML parsing with environment variable substitution.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::types::JobConfig;

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid env var regex"));

/// Substitute `${VAR_NAME}` patterns with environment variable values.
///
/// # Errors
///
/// Returns an error naming every referenced variable that is not set.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let mut missing = Vec::new();
    let substituted = ENV_VAR_RE.replace_all(input, |cap: &regex::Captures<'_>| {
        let name = &cap[1];
        std::env::var(name).unwrap_or_else(|_| {
            if !missing.iter().any(|m| m == name) {
                missing.push(name.to_string());
            }
            String::new()
        })
    });

    if !missing.is_empty() {
        anyhow::bail!("Missing environment variable(s): {}", missing.join(", "));
    }

    Ok(substituted.into_owned())
}

/// Parse a job YAML string (after env var substitution).
///
/// # Errors
///
/// Returns an error if env var substitution fails or the YAML is invalid.
pub fn parse_job_str(yaml_str: &str) -> Result<JobConfig> {
    let substituted = substitute_env_vars(yaml_str)?;
    let config: JobConfig =
        serde_yaml::from_str(&substituted).context("Failed to parse job YAML")?;
    Ok(config)
}

/// Parse a job YAML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn parse_job(path: &Path) -> Result<JobConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file: {}", path.display()))?;
    parse_job_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("RH_TEST_HOST", "sftp.example.com");
        let input = "host: ${RH_TEST_HOST}\nport: 22";
        let result = substitute_env_vars(input).unwrap();
        assert!(result.contains("sftp.example.com"));
        assert!(!result.contains("${RH_TEST_HOST}"));
        std::env::remove_var("RH_TEST_HOST");
    }

    #[test]
    fn test_repeated_env_var() {
        std::env::set_var("RH_TEST_USER", "svc");
        let result = substitute_env_vars("a: ${RH_TEST_USER}\nb: ${RH_TEST_USER}").unwrap();
        assert_eq!(result, "a: svc\nb: svc");
        std::env::remove_var("RH_TEST_USER");
    }

    #[test]
    fn test_missing_env_vars_reported_together() {
        let err = substitute_env_vars("a: ${RH_MISSING_ONE}\nb: ${RH_MISSING_TWO}\nc: ${RH_MISSING_ONE}")
            .unwrap_err()
            .to_string();
        assert_eq!(
            err,
            "Missing environment variable(s): RH_MISSING_ONE, RH_MISSING_TWO"
        );
    }

    #[test]
    fn test_no_env_vars_passthrough() {
        let input = "password: plain$text";
        assert_eq!(substitute_env_vars(input).unwrap(), input);
    }

    #[test]
    fn test_parse_job_with_env_password() {
        std::env::set_var("RH_TEST_ORIGIN_PASSWORD", "s3cret");
        let yaml = r#"
version: "1.0"
job:
  name: reorg
origin:
  host: origin
  user: svc
  password: ${RH_TEST_ORIGIN_PASSWORD}
destination:
  host: dest
  user: svc
  password: x
  base_dir: /organized
"#;
        let config = parse_job_str(yaml).unwrap();
        assert_eq!(config.origin.password.as_deref(), Some("s3cret"));
        std::env::remove_var("RH_TEST_ORIGIN_PASSWORD");
    }

    #[test]
    fn test_parse_job_missing_file() {
        let err = parse_job(Path::new("/definitely/not/here.yaml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read job file"));
    }

    #[test]
    fn test_parse_job_invalid_yaml() {
        let err = parse_job_str("version: [").unwrap_err();
        assert!(err.to_string().contains("Failed to parse job YAML"));
    }
}
