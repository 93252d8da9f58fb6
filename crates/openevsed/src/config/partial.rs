use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use toml::Spanned;

use super::diagnostics::{
    Diagnostic, Error, LoadError, MergeConflictLocation, MergeError, SourceInfo, Warning,
};
use super::LogLevel;

#[derive(Debug, Default, Deserialize)]
pub struct PartialConfig {
    #[serde(default)]
    pub imports: Vec<String>,

    pub logging: Option<PartialLoggingConfig>,
    pub api: Option<PartialApiConfig>,
    pub storage: Option<PartialStorageConfig>,
    pub integrations: Option<PartialIntegrationsConfig>,

    /// Source information for error reporting (not serialized)
    #[serde(skip)]
    pub source: Option<SourceInfo>,

    /// Where each merged field was defined, keyed by field path
    #[serde(skip)]
    pub origins: HashMap<String, MergeConflictLocation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialLoggingConfig {
    pub level: Option<Spanned<LogLevel>>,
    pub overrides: Option<HashMap<String, Spanned<LogLevel>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialApiConfig {
    pub listen: Option<Spanned<String>>,
    pub port: Option<Spanned<u16>>,
    pub enabled: Option<Spanned<bool>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialStorageConfig {
    pub path: Option<Spanned<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialIntegrationsConfig {
    pub openevse: Option<PartialOpenEvseConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PartialOpenEvseConfig {
    pub enabled: Option<Spanned<bool>>,
    pub scan_interval: Option<Spanned<u64>>,
    pub firmware_interval: Option<Spanned<u64>>,
    pub request_timeout: Option<Spanned<u64>>,
}

/// First-wins bookkeeping shared by every field during a merge.
struct Merger {
    locations: HashMap<String, MergeConflictLocation>,
    diagnostics: Vec<Diagnostic>,
}

impl Merger {
    fn field<T>(
        &mut self,
        slot: &mut Option<Spanned<T>>,
        incoming: Option<Spanned<T>>,
        field_path: &str,
        source: &SourceInfo,
    ) {
        let Some(value) = incoming else {
            return;
        };

        let conflict_loc = MergeConflictLocation {
            file_path: source.file_path.clone(),
            span: value.span(),
            content: source.content.clone(),
        };

        if let Some(prev_loc) = self.locations.get(field_path) {
            // Conflict: keep first value, record error
            self.diagnostics.push(Diagnostic::Error(Error::Merge(MergeError {
                field_path: field_path.to_string(),
                message: format!("'{}' defined in multiple config files", field_path),
                conflicts: vec![prev_loc.clone(), conflict_loc],
            })));
        } else {
            *slot = Some(value);
            self.locations.insert(field_path.to_string(), conflict_loc);
        }
    }
}

impl PartialConfig {
    /// Load a single config file without processing imports
    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|e| LoadError::Io {
            path: path.to_path_buf(),
            error: e,
        })?;

        let mut config: PartialConfig = toml::from_str(&content).map_err(|e| LoadError::Parse {
            path: path.to_path_buf(),
            error: e,
        })?;

        config.source = Some(SourceInfo {
            file_path: path.to_path_buf(),
            content,
        });

        Ok(config)
    }

    /// Load config files with import resolution
    ///
    /// Each config file is loaded, then its imports are recursively processed.
    /// Cycle detection prevents infinite loops.
    ///
    /// Returns a Vec of all loaded configs in order (imports first, then parent)
    pub fn load_with_imports(paths: &[PathBuf]) -> Result<Vec<Self>, LoadError> {
        let mut visited = HashSet::new();
        let mut all_configs = Vec::new();

        for path in paths {
            Self::load_recursive(path, &mut visited, &mut all_configs)?;
        }

        Ok(all_configs)
    }

    fn load_recursive(
        path: &Path,
        visited: &mut HashSet<PathBuf>,
        configs: &mut Vec<Self>,
    ) -> Result<(), LoadError> {
        let canonical_path = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf());

        if visited.contains(&canonical_path) {
            return Err(LoadError::ImportCycle {
                path: canonical_path.clone(),
                cycle: visited.iter().cloned().collect(),
            });
        }

        visited.insert(canonical_path.clone());

        let config = Self::from_file(path)?;

        // Imports first (depth-first)
        for import_path in &config.imports {
            let import_path_buf = PathBuf::from(import_path);

            // Relative imports resolve from the importing file's directory
            let resolved_path = if import_path_buf.is_absolute() {
                import_path_buf
            } else {
                let parent_dir = path.parent().unwrap_or_else(|| Path::new("."));
                parent_dir.join(import_path_buf)
            };

            Self::load_recursive(&resolved_path, visited, configs)?;
        }

        configs.push(config);

        // Allow the same file to be imported from sibling branches
        visited.remove(&canonical_path);

        Ok(())
    }

    /// Merge multiple partial configs together
    ///
    /// Uses first-wins semantics: the first occurrence of a field is kept.
    /// Conflicts are collected as errors but merging continues so that every
    /// conflict is reported at once.
    pub fn merge<I>(configs: I) -> (Self, Vec<Diagnostic>)
    where
        I: IntoIterator<Item = Self>,
    {
        let mut result = PartialConfig::default();
        let mut merger = Merger {
            locations: HashMap::new(),
            diagnostics: Vec::new(),
        };
        let mut imports = Vec::new();

        for config in configs {
            imports.extend(config.imports.clone());

            let source_info = config.source.as_ref().cloned().unwrap_or_else(|| SourceInfo {
                file_path: PathBuf::from("<unknown>"),
                content: String::new(),
            });

            let is_empty = config.logging.is_none()
                && config.api.is_none()
                && config.storage.is_none()
                && config.integrations.is_none()
                && config.imports.is_empty();

            if is_empty {
                merger.diagnostics.push(Diagnostic::Warning(Warning::EmptyConfig {
                    file_path: source_info.file_path.clone(),
                }));
            }

            if let Some(logging) = config.logging {
                let result_logging = result.logging.get_or_insert_with(Default::default);
                merger.field(
                    &mut result_logging.level,
                    logging.level,
                    "logging.level",
                    &source_info,
                );

                if let Some(overrides) = logging.overrides {
                    let result_overrides =
                        result_logging.overrides.get_or_insert_with(HashMap::new);
                    for (key, value) in overrides {
                        let mut slot = None;
                        merger.field(
                            &mut slot,
                            Some(value),
                            &format!("logging.overrides.{}", key),
                            &source_info,
                        );
                        if let Some(value) = slot {
                            result_overrides.insert(key, value);
                        }
                    }
                }
            }

            if let Some(api) = config.api {
                let result_api = result.api.get_or_insert_with(Default::default);
                merger.field(&mut result_api.listen, api.listen, "api.listen", &source_info);
                merger.field(&mut result_api.port, api.port, "api.port", &source_info);
                merger.field(&mut result_api.enabled, api.enabled, "api.enabled", &source_info);
            }

            if let Some(storage) = config.storage {
                let result_storage = result.storage.get_or_insert_with(Default::default);
                merger.field(&mut result_storage.path, storage.path, "storage.path", &source_info);
            }

            if let Some(integrations) = config.integrations {
                let result_integrations = result.integrations.get_or_insert_with(Default::default);
                if let Some(openevse) = integrations.openevse {
                    let target = result_integrations
                        .openevse
                        .get_or_insert_with(Default::default);
                    merger.field(
                        &mut target.enabled,
                        openevse.enabled,
                        "integrations.openevse.enabled",
                        &source_info,
                    );
                    merger.field(
                        &mut target.scan_interval,
                        openevse.scan_interval,
                        "integrations.openevse.scan_interval",
                        &source_info,
                    );
                    merger.field(
                        &mut target.firmware_interval,
                        openevse.firmware_interval,
                        "integrations.openevse.firmware_interval",
                        &source_info,
                    );
                    merger.field(
                        &mut target.request_timeout,
                        openevse.request_timeout,
                        "integrations.openevse.request_timeout",
                        &source_info,
                    );
                }
            }
        }

        result.imports = imports;
        result.origins = merger.locations;

        (result, merger.diagnostics)
    }
}
