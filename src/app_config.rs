//! Optional config file with defaults for the `downloader` binary.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use downloader_engine::EngineConfig;

/// Values read from `config.toml`. Every field is optional.
#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    /// Directory for the registry document and temp files.
    pub state_dir: Option<PathBuf>,
    /// Scheduler sweep interval in milliseconds.
    pub tick_interval_ms: Option<u64>,
    /// Registry save interval in milliseconds.
    pub persist_interval_ms: Option<u64>,
    /// Minimum spacing between attempts on one record, in seconds.
    pub min_attempt_interval_secs: Option<u64>,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: Option<u64>,
    /// HTTP read timeout in seconds.
    pub read_timeout_secs: Option<u64>,
    /// Outbound event queue capacity.
    pub event_capacity: Option<usize>,
    /// Default verbosity mode.
    pub verbosity: Option<VerbositySetting>,
}

impl FileConfig {
    /// Validates config values against engine constraints.
    pub fn validate(&self) -> Result<()> {
        validate_range("tick_interval_ms", self.tick_interval_ms, 10..=60_000)?;
        validate_range("persist_interval_ms", self.persist_interval_ms, 100..=600_000)?;
        validate_range("min_attempt_interval_secs", self.min_attempt_interval_secs, 0..=3600)?;
        validate_range("connect_timeout_secs", self.connect_timeout_secs, 1..=3600)?;
        validate_range("read_timeout_secs", self.read_timeout_secs, 1..=3600)?;
        validate_range(
            "event_capacity",
            self.event_capacity.map(|v| v as u64),
            1..=10_000,
        )?;
        Ok(())
    }

    /// Applies the values that are set onto `config`.
    pub fn apply(&self, config: &mut EngineConfig) {
        if let Some(dir) = &self.state_dir {
            config.state_dir.clone_from(dir);
        }
        if let Some(ms) = self.tick_interval_ms {
            config.tick_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.persist_interval_ms {
            config.persist_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = self.min_attempt_interval_secs {
            config.min_attempt_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.connect_timeout_secs {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.read_timeout_secs {
            config.read_timeout = Duration::from_secs(secs);
        }
        if let Some(capacity) = self.event_capacity {
            config.event_capacity = capacity;
        }
    }
}

fn validate_range(
    field: &str,
    value: Option<u64>,
    range: std::ops::RangeInclusive<u64>,
) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !range.contains(&value) {
        bail!(
            "Invalid config value for `{field}`: {value}. Expected range: {}..={}",
            range.start(),
            range.end()
        );
    }
    Ok(())
}

/// Supported config verbosity labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbositySetting {
    Default,
    Verbose,
    Quiet,
    Debug,
}

impl VerbositySetting {
    /// Log filter this setting maps to.
    #[must_use]
    pub fn filter(self) -> &'static str {
        match self {
            Self::Default => "info",
            Self::Verbose => "debug",
            Self::Quiet => "error",
            Self::Debug => "trace",
        }
    }
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/downloader/config.toml`
/// 2. `$HOME/.config/downloader/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("downloader")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("downloader")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads config from the default path, or defaults when there is none.
pub fn load_default_file_config() -> Result<FileConfig> {
    match resolve_default_config_path() {
        Some(path) if path.exists() => load_file_config(&path),
        _ => Ok(FileConfig::default()),
    }
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
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let line_no = line_index + 1;

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let context = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "state_dir" => {
                cfg.state_dir = Some(PathBuf::from(
                    parse_string_literal(value).with_context(context)?,
                ));
            }
            "tick_interval_ms" => {
                cfg.tick_interval_ms = Some(parse_integer_u64(value).with_context(context)?);
            }
            "persist_interval_ms" => {
                cfg.persist_interval_ms = Some(parse_integer_u64(value).with_context(context)?);
            }
            "min_attempt_interval_secs" => {
                cfg.min_attempt_interval_secs =
                    Some(parse_integer_u64(value).with_context(context)?);
            }
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            "read_timeout_secs" => {
                cfg.read_timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            "event_capacity" => {
                let parsed = parse_integer_u64(value).with_context(context)?;
                let n = usize::try_from(parsed)
                    .map_err(|_| anyhow::anyhow!("event_capacity out of range for usize"))?;
                cfg.event_capacity = Some(n);
            }
            "verbosity" => {
                let parsed = parse_string_literal(value).with_context(context)?;
                cfg.verbosity = Some(parse_verbosity(&parsed).with_context(|| {
                    format!("Invalid `verbosity` value '{parsed}' on line {line_no}")
                })?);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
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

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_verbosity(value: &str) -> Result<VerbositySetting> {
    match value {
        "default" => Ok(VerbositySetting::Default),
        "verbose" => Ok(VerbositySetting::Verbose),
        "quiet" => Ok(VerbositySetting::Quiet),
        "debug" => Ok(VerbositySetting::Debug),
        _ => bail!("Expected one of: default, verbose, quiet, debug"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_partial_fields() {
        let cfg = parse_config_str(
            r#"
state_dir = "/var/lib/dl"
verbosity = "verbose"
"#,
        )
        .expect("partial config should parse");
        assert_eq!(cfg.state_dir, Some(PathBuf::from("/var/lib/dl")));
        assert_eq!(cfg.verbosity, Some(VerbositySetting::Verbose));
        assert!(cfg.tick_interval_ms.is_none());
    }

    #[test]
    fn test_parse_config_supports_inline_comments() {
        let cfg = parse_config_str(
            r#"
tick_interval_ms = 250 # sweep
state_dir = "/tmp/#state" # hash inside quotes is kept
"#,
        )
        .expect("config with comments should parse");
        assert_eq!(cfg.tick_interval_ms, Some(250));
        assert_eq!(cfg.state_dir, Some(PathBuf::from("/tmp/#state")));
    }

    #[test]
    fn test_parse_config_rejects_unknown_keys() {
        let err = parse_config_str("concurrency = 4").expect_err("unknown key error expected");
        assert!(err.to_string().contains("Unknown configuration key"));
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn test_parse_config_rejects_out_of_range_values() {
        let err = parse_config_str("tick_interval_ms = 0").expect_err("zero tick rejected");
        assert!(err.to_string().contains("tick_interval_ms"));

        let err = parse_config_str("event_capacity = 0").expect_err("zero capacity rejected");
        assert!(err.to_string().contains("event_capacity"));
    }

    #[test]
    fn test_parse_config_rejects_trailing_tokens() {
        let err = parse_config_str("read_timeout_secs = 30 seconds")
            .expect_err("expected trailing token error");
        assert!(format!("{err:#}").contains("read_timeout_secs"));
    }

    #[test]
    fn test_parse_config_rejects_unquoted_path() {
        let err = parse_config_str("state_dir = /tmp/x").expect_err("quotes required");
        assert!(format!("{err:#}").contains("state_dir"));
    }

    #[test]
    fn test_apply_overrides_only_set_fields() {
        let cfg = parse_config_str(
            r#"
min_attempt_interval_secs = 2
connect_timeout_secs = 10
"#,
        )
        .expect("config should parse");
        let mut engine = EngineConfig::new("/tmp/state");
        cfg.apply(&mut engine);
        assert_eq!(engine.min_attempt_interval, Duration::from_secs(2));
        assert_eq!(engine.connect_timeout, Duration::from_secs(10));
        assert_eq!(engine.tick_interval, Duration::from_millis(200));
        assert_eq!(engine.state_dir, PathBuf::from("/tmp/state"));
    }

    #[test]
    fn test_verbosity_filters() {
        assert_eq!(VerbositySetting::Default.filter(), "info");
        assert_eq!(VerbositySetting::Quiet.filter(), "error");
        assert_eq!(VerbositySetting::Verbose.filter(), "debug");
        assert_eq!(VerbositySetting::Debug.filter(), "trace");
    }
}
