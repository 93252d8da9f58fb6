use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use tracing_subscriber::filter::LevelFilter;

use super::diagnostics::{format_diagnostics, Diagnostic, Error, ValidationError};
use super::partial::{PartialConfig, PartialOpenEvseConfig};

pub const DEFAULT_API_PORT: u16 = 8565;
pub const DEFAULT_STORAGE_PATH: &str = ".openevsed";
pub const CONFIG_ENTRIES_FILE: &str = "config_entries.json";

#[derive(Debug, Default, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub integrations: IntegrationsConfig,
}

// Deserialize is needed for toml::Spanned<LogLevel> in the partial config
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: LogLevel,

    /// Per-target levels, e.g. `"openevsed::api" = "debug"`
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Render as an `EnvFilter` directive string.
    pub fn directives(&self) -> String {
        let mut directives = vec![LevelFilter::from(self.level).to_string().to_lowercase()];
        let mut targets: Vec<_> = self.overrides.iter().collect();
        targets.sort();
        for (target, level) in targets {
            directives.push(format!(
                "{}={}",
                target,
                LevelFilter::from(*level).to_string().to_lowercase()
            ));
        }
        directives.join(",")
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub listen: IpAddr,
    pub port: u16,
    pub enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_API_PORT,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding persisted state
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_STORAGE_PATH),
        }
    }
}

impl StorageConfig {
    pub fn config_entries_path(&self) -> PathBuf {
        self.path.join(CONFIG_ENTRIES_FILE)
    }
}

#[derive(Debug, Default, Clone)]
pub struct IntegrationsConfig {
    pub openevse: OpenEvseConfig,
}

#[derive(Debug, Clone)]
pub struct OpenEvseConfig {
    pub enabled: bool,
    /// Main coordinator poll period
    pub scan_interval: Duration,
    /// Upstream release check period
    pub firmware_interval: Duration,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
}

impl Default for OpenEvseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval: Duration::from_secs(60),
            firmware_interval: Duration::from_secs(86400),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from multiple TOML files with import resolution
    ///
    /// Supports multiple files (e.g. base + secrets), `imports` inside files,
    /// conflict detection across all sources, and validation with every error
    /// and warning reported together.
    ///
    /// Returns Ok((Config, diagnostics)) where diagnostics holds only warnings.
    pub fn from_files(
        paths: &[PathBuf],
    ) -> Result<(Self, Vec<Diagnostic>), Box<dyn std::error::Error>> {
        let configs = PartialConfig::load_with_imports(paths)?;
        let (partial, diagnostics) = PartialConfig::merge(configs);
        Self::from_partial(partial, diagnostics)
    }

    /// Convert a merged PartialConfig to a Config, validating all fields
    pub fn from_partial(
        partial: PartialConfig,
        mut diagnostics: Vec<Diagnostic>,
    ) -> Result<(Self, Vec<Diagnostic>), Box<dyn std::error::Error>> {
        let mut errors = Vec::new();

        let logging = partial
            .logging
            .map(|l| LoggingConfig {
                level: l.level.map(|s| *s.get_ref()).unwrap_or_default(),
                overrides: l
                    .overrides
                    .map(|hm| hm.into_iter().map(|(k, v)| (k, *v.get_ref())).collect())
                    .unwrap_or_default(),
            })
            .unwrap_or_default();

        let mut api = ApiConfig::default();
        if let Some(partial_api) = partial.api {
            if let Some(listen) = partial_api.listen {
                match listen.get_ref().parse::<IpAddr>() {
                    Ok(addr) => api.listen = addr,
                    Err(_) => errors.push(ValidationError::at(
                        "api.listen",
                        format!("'{}' is not an IP address", listen.get_ref()),
                        partial.origins.get("api.listen"),
                    )),
                }
            }
            if let Some(port) = partial_api.port {
                if *port.get_ref() == 0 {
                    errors.push(ValidationError::at(
                        "api.port",
                        "port must be non-zero",
                        partial.origins.get("api.port"),
                    ));
                } else {
                    api.port = *port.get_ref();
                }
            }
            if let Some(enabled) = partial_api.enabled {
                api.enabled = *enabled.get_ref();
            }
        }

        let storage = partial
            .storage
            .and_then(|s| s.path)
            .map(|p| StorageConfig {
                path: PathBuf::from(p.into_inner()),
            })
            .unwrap_or_default();

        let openevse = partial
            .integrations
            .and_then(|i| i.openevse)
            .map(|o| Self::validate_openevse(o, &partial.origins, &mut errors))
            .unwrap_or_default();

        diagnostics.extend(
            errors
                .into_iter()
                .map(|e| Diagnostic::Error(Error::Validation(e))),
        );

        if diagnostics.iter().any(|d| d.is_error()) {
            return Err(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format_diagnostics(&diagnostics),
            )));
        }

        let config = Config {
            logging,
            api,
            storage,
            integrations: IntegrationsConfig { openevse },
        };
        Ok((config, diagnostics))
    }

    fn validate_openevse(
        partial: PartialOpenEvseConfig,
        origins: &HashMap<String, super::diagnostics::MergeConflictLocation>,
        errors: &mut Vec<ValidationError>,
    ) -> OpenEvseConfig {
        let mut config = OpenEvseConfig::default();
        if let Some(enabled) = partial.enabled {
            config.enabled = *enabled.get_ref();
        }

        let mut seconds = |name: &str, value: Option<toml::Spanned<u64>>, target: &mut Duration| {
            let Some(value) = value else {
                return;
            };
            let path = format!("integrations.openevse.{}", name);
            if *value.get_ref() == 0 {
                errors.push(ValidationError::at(
                    &path,
                    format!("{} must be greater than zero", name),
                    origins.get(&path),
                ));
            } else {
                *target = Duration::from_secs(*value.get_ref());
            }
        };

        seconds("scan_interval", partial.scan_interval, &mut config.scan_interval);
        seconds(
            "firmware_interval",
            partial.firmware_interval,
            &mut config.firmware_interval,
        );
        seconds(
            "request_timeout",
            partial.request_timeout,
            &mut config.request_timeout,
        );

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "openevsed.toml", "[logging]\nlevel = \"info\"\n");

        let (config, diagnostics) = Config::from_files(&[path]).unwrap();
        assert!(diagnostics.is_empty());
        assert_eq!(config.api.listen, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.api.port, 8565);
        assert!(config.api.enabled);
        assert_eq!(
            config.storage.config_entries_path(),
            PathBuf::from(".openevsed/config_entries.json")
        );
        let openevse = &config.integrations.openevse;
        assert!(openevse.enabled);
        assert_eq!(openevse.scan_interval, Duration::from_secs(60));
        assert_eq!(openevse.firmware_interval, Duration::from_secs(86400));
        assert_eq!(openevse.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_merge_non_overlapping_configs() {
        let dir = tempfile::tempdir().unwrap();
        let base = write(
            dir.path(),
            "base.toml",
            r#"
[logging]
level = "info"

[api]
listen = "0.0.0.0"
"#,
        );
        let extra = write(
            dir.path(),
            "extra.toml",
            r#"
[logging.overrides]
"openevsed::api" = "debug"

[api]
port = 9000

[integrations.openevse]
scan_interval = 30
"#,
        );

        let (config, diagnostics) = Config::from_files(&[base, extra]).unwrap();
        assert_eq!(diagnostics.len(), 0);
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(
            config.logging.overrides.get("openevsed::api"),
            Some(&LogLevel::Debug)
        );
        assert_eq!(config.api.listen.to_string(), "0.0.0.0");
        assert_eq!(config.api.port, 9000);
        assert_eq!(
            config.integrations.openevse.scan_interval,
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_conflict_detection() {
        let dir = tempfile::tempdir().unwrap();
        let base = write(dir.path(), "base.toml", "[logging]\nlevel = \"info\"\n");
        let conflict = write(dir.path(), "conflict.toml", "[logging]\nlevel = \"debug\"\n");

        let err_msg = Config::from_files(&[base, conflict]).unwrap_err().to_string();
        assert!(err_msg.contains("Merge conflict"));
        assert!(err_msg.contains("logging.level"));
    }

    #[test]
    fn test_multiple_conflicts_reported() {
        let dir = tempfile::tempdir().unwrap();
        let base = write(
            dir.path(),
            "base.toml",
            r#"
[logging.overrides]
"target1" = "trace"

[storage]
path = "/var/lib/openevsed"

[integrations.openevse]
request_timeout = 5
"#,
        );
        let conflict = write(
            dir.path(),
            "conflict.toml",
            r#"
[logging.overrides]
"target1" = "error"

[storage]
path = "/tmp/openevsed"

[integrations.openevse]
request_timeout = 20
"#,
        );

        let err_msg = Config::from_files(&[base, conflict]).unwrap_err().to_string();
        assert!(err_msg.contains("logging.overrides.target1"));
        assert!(err_msg.contains("storage.path"));
        assert!(err_msg.contains("integrations.openevse.request_timeout"));
    }

    #[test]
    fn test_relative_import_paths() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "configs/secrets.toml",
            "[integrations.openevse]\nenabled = false\n",
        );
        let main = write(
            dir.path(),
            "main.toml",
            "imports = [\"configs/secrets.toml\"]\n\n[api]\nport = 8080\n",
        );

        let (config, _) = Config::from_files(&[main]).unwrap();
        assert!(!config.integrations.openevse.enabled);
        assert_eq!(config.api.port, 8080);
    }

    #[test]
    fn test_import_cycle_detection() {
        let dir = tempfile::tempdir().unwrap();
        let a = write(dir.path(), "a.toml", "imports = [\"b.toml\"]\n");
        write(dir.path(), "b.toml", "imports = [\"a.toml\"]\n");

        let err_msg = Config::from_files(&[a]).unwrap_err().to_string();
        assert!(err_msg.contains("Import cycle"));
    }

    #[test]
    fn test_validation_errors_collected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "bad.toml",
            r#"
[api]
listen = "localhost"
port = 0

[integrations.openevse]
scan_interval = 0
firmware_interval = 0
"#,
        );

        let err_msg = Config::from_files(&[path]).unwrap_err().to_string();
        assert!(err_msg.contains("api.listen"));
        assert!(err_msg.contains("'localhost' is not an IP address"));
        assert!(err_msg.contains("api.port"));
        assert!(err_msg.contains("integrations.openevse.scan_interval"));
        assert!(err_msg.contains("integrations.openevse.firmware_interval"));
    }

    #[test]
    fn test_empty_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "empty.toml", "");

        let (config, diagnostics) = Config::from_files(&[path]).unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].is_warning());
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_missing_file_error() {
        let missing_path = PathBuf::from("/nonexistent/openevsed.toml");

        let err_msg = Config::from_files(&[missing_path]).unwrap_err().to_string();
        assert!(err_msg.contains("Failed to read"));
        assert!(err_msg.contains("/nonexistent/openevsed.toml"));
    }

    #[test]
    fn test_log_directives() {
        let mut logging = LoggingConfig {
            level: LogLevel::Warn,
            overrides: HashMap::new(),
        };
        logging
            .overrides
            .insert("openevsed::engine".to_string(), LogLevel::Trace);
        logging
            .overrides
            .insert("openevse_http".to_string(), LogLevel::Debug);

        assert_eq!(
            logging.directives(),
            "warn,openevse_http=debug,openevsed::engine=trace"
        );
    }
}
