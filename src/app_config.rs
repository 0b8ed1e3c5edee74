//! Application configuration loading for CLI defaults.

use std::env;
use std::fmt::Display;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

/// Name of the directory under the config home.
const CONFIG_DIR_NAME: &str = "mangabook";

/// File configuration for download defaults (`key = value` lines).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Default library directory.
    pub output_dir: Option<PathBuf>,
    /// Default translated language.
    pub language: Option<String>,
    /// Default global concurrency (same range as CLI).
    pub concurrency: Option<u8>,
    /// Default per-volume concurrency.
    pub per_group_concurrency: Option<u8>,
    /// Default attempts for transient failures.
    pub max_retries: Option<u8>,
    /// Default per-host rate limit in milliseconds.
    pub rate_limit: Option<u64>,
    /// Manifest retention horizon in days.
    pub retention_days: Option<u32>,
    /// Trust valid local files (false behaves like `--no-check-local`).
    pub check_local: Option<bool>,
    /// Fetch data-saver renditions.
    pub data_saver: Option<bool>,
    /// API endpoint override.
    pub api_base_url: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
}

impl FileConfig {
    /// Checks every value against the same ranges the CLI enforces.
    pub fn validate(&self) -> Result<()> {
        check_range("concurrency", self.concurrency, 1..=100)?;
        check_range("per_group_concurrency", self.per_group_concurrency, 1..=100)?;
        check_range("max_retries", self.max_retries, 1..=10)?;
        check_range("rate_limit", self.rate_limit, 0..=60_000)?;
        check_range("retention_days", self.retention_days, 0..=3650)?;
        check_range("connect_timeout_secs", self.connect_timeout_secs, 1..=3600)?;
        check_range("read_timeout_secs", self.read_timeout_secs, 1..=3600)?;

        if self
            .language
            .as_deref()
            .is_some_and(|language| language.trim().is_empty())
        {
            bail!("Invalid config value for `language`: expected a language code such as \"en\"");
        }
        if let Some(api_base_url) = &self.api_base_url
            && url::Url::parse(api_base_url).is_err()
        {
            bail!("Invalid config value for `api_base_url`: '{api_base_url}' is not a URL");
        }
        Ok(())
    }
}

fn check_range<T>(field: &str, value: Option<T>, range: RangeInclusive<T>) -> Result<()>
where
    T: PartialOrd + Display,
{
    match value {
        Some(value) if !range.contains(&value) => bail!(
            "Invalid config value for `{field}`: {value}. Expected range: {}..={}",
            range.start(),
            range.end()
        ),
        _ => Ok(()),
    }
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed file config when a config file exists and was valid.
    pub config: Option<FileConfig>,
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/mangabook/config.toml`
/// 2. `$HOME/.config/mangabook/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join(CONFIG_DIR_NAME)
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(CONFIG_DIR_NAME)
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads config from the default path if present.
pub fn load_default_file_config() -> Result<LoadedConfig> {
    let path = resolve_default_config_path();
    let config = match path.as_deref() {
        Some(path_ref) if path_ref.exists() => Some(load_file_config(path_ref)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line_number = line_index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_number}: expected key = value");
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let invalid = || format!("Invalid `{key}` value on line {line_number}");

        match key {
            "output_dir" => cfg.output_dir = Some(PathBuf::from(quoted(value).with_context(invalid)?)),
            "language" => cfg.language = Some(quoted(value).with_context(invalid)?),
            "api_base_url" => cfg.api_base_url = Some(quoted(value).with_context(invalid)?),
            "concurrency" => cfg.concurrency = Some(unsigned(value).with_context(invalid)?),
            "per_group_concurrency" => {
                cfg.per_group_concurrency = Some(unsigned(value).with_context(invalid)?);
            }
            "max_retries" => cfg.max_retries = Some(unsigned(value).with_context(invalid)?),
            "rate_limit" => cfg.rate_limit = Some(unsigned(value).with_context(invalid)?),
            "retention_days" => cfg.retention_days = Some(unsigned(value).with_context(invalid)?),
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(unsigned(value).with_context(invalid)?);
            }
            "read_timeout_secs" => {
                cfg.read_timeout_secs = Some(unsigned(value).with_context(invalid)?);
            }
            "check_local" => cfg.check_local = Some(boolean(value).with_context(invalid)?),
            "data_saver" => cfg.data_saver = Some(boolean(value).with_context(invalid)?),
            unknown => bail!("Unknown configuration key: '{unknown}' on line {line_number}"),
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn quoted(raw_value: &str) -> Result<String> {
    raw_value
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("Expected double-quoted string"))
}

/// Parses a plain decimal integer that fits `T`.
fn unsigned<T: TryFrom<u64>>(raw_value: &str) -> Result<T> {
    let token = raw_value.trim();
    if token.is_empty() || !token.bytes().all(|byte| byte.is_ascii_digit()) {
        bail!("Expected a non-negative integer, got '{token}'");
    }
    let value: u64 = token.parse()?;
    T::try_from(value).map_err(|_| anyhow::anyhow!("Integer {value} is out of range"))
}

fn boolean(raw_value: &str) -> Result<bool> {
    match raw_value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => bail!("Expected 'true' or 'false', got '{other}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_partial_fields() {
        let cfg = parse_config_str(
            r#"
concurrency = 8
language = "fr"
"#,
        )
        .expect("partial config should parse");
        assert_eq!(cfg.concurrency, Some(8));
        assert_eq!(cfg.language.as_deref(), Some("fr"));
        assert!(cfg.output_dir.is_none());
        assert!(cfg.check_local.is_none());
    }

    #[test]
    fn test_parse_config_all_fields() {
        let cfg = parse_config_str(
            r#"
output_dir = "/srv/manga"
language = "en"
concurrency = 12
per_group_concurrency = 4
max_retries = 5
rate_limit = 250
retention_days = 90
check_local = false
data_saver = true
api_base_url = "http://127.0.0.1:8080"
connect_timeout_secs = 15
read_timeout_secs = 60
"#,
        )
        .expect("full config should parse");
        assert_eq!(cfg.output_dir, Some(PathBuf::from("/srv/manga")));
        assert_eq!(cfg.per_group_concurrency, Some(4));
        assert_eq!(cfg.max_retries, Some(5));
        assert_eq!(cfg.rate_limit, Some(250));
        assert_eq!(cfg.retention_days, Some(90));
        assert_eq!(cfg.check_local, Some(false));
        assert_eq!(cfg.data_saver, Some(true));
        assert_eq!(cfg.api_base_url.as_deref(), Some("http://127.0.0.1:8080"));
        assert_eq!(cfg.connect_timeout_secs, Some(15));
        assert_eq!(cfg.read_timeout_secs, Some(60));
    }

    #[test]
    fn test_parse_config_rejects_invalid_concurrency() {
        let err = parse_config_str("concurrency = 0").expect_err("invalid concurrency expected");
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn test_parse_config_rejects_invalid_rate_limit() {
        let err = parse_config_str("rate_limit = 60001").expect_err("invalid rate_limit expected");
        assert!(err.to_string().contains("rate_limit"));
    }

    #[test]
    fn test_parse_config_rejects_numeric_values_with_trailing_tokens() {
        let err = parse_config_str("concurrency = 4 trailing")
            .expect_err("expected trailing token error");
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn test_parse_config_supports_inline_comments() {
        let cfg = parse_config_str(
            r##"
concurrency = 4 # workers
language = "en" # "#" inside strings is kept
"##,
        )
        .expect("config with comments should parse");
        assert_eq!(cfg.concurrency, Some(4));
        assert_eq!(cfg.language.as_deref(), Some("en"));
    }

    #[test]
    fn test_parse_config_rejects_invalid_boolean() {
        let err = parse_config_str("check_local = yes").expect_err("invalid boolean expected");
        assert!(err.to_string().contains("check_local"));
    }

    #[test]
    fn test_parse_config_rejects_unquoted_string() {
        let err = parse_config_str("language = en").expect_err("unquoted string expected");
        assert!(err.to_string().contains("language"));
    }

    #[test]
    fn test_parse_config_rejects_invalid_timeout_value() {
        let err =
            parse_config_str("connect_timeout_secs = 0").expect_err("invalid timeout expected");
        assert!(err.to_string().contains("connect_timeout_secs"));
    }

    #[test]
    fn test_parse_config_rejects_invalid_api_base_url() {
        let err = parse_config_str(r#"api_base_url = "not a url""#)
            .expect_err("invalid url expected");
        assert!(err.to_string().contains("api_base_url"));
    }

    #[test]
    fn test_parse_config_rejects_unknown_keys() {
        let err = parse_config_str("unknown_key = 123").expect_err("unknown key error expected");
        assert!(err.to_string().contains("Unknown configuration key"));
        assert!(err.to_string().contains("unknown_key"));
    }

    #[test]
    fn test_parse_config_rejects_missing_equals() {
        let err = parse_config_str("concurrency 4").expect_err("syntax error expected");
        assert!(err.to_string().contains("line 1"));
    }
}
