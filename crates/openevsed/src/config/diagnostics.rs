use std::collections::HashSet;
use std::ops::Range;
use std::path::PathBuf;

use ariadne::{Color, Label, Report, ReportKind, Source};

/// Source information for where a diagnostic came from
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub file_path: PathBuf,
    pub content: String,
}

/// A diagnostic message that can be either a warning or an error
#[derive(Debug, Clone)]
pub enum Diagnostic {
    Warning(Warning),
    Error(Error),
}

#[derive(Debug, Clone)]
pub enum Warning {
    EmptyConfig { file_path: PathBuf },
}

#[derive(Debug, Clone)]
pub enum Error {
    Merge(MergeError),
    Validation(ValidationError),
}

/// The same field defined in more than one file
#[derive(Debug, Clone)]
pub struct MergeError {
    pub field_path: String,
    pub message: String,
    pub conflicts: Vec<MergeConflictLocation>,
}

#[derive(Debug, Clone)]
pub struct MergeConflictLocation {
    pub file_path: PathBuf,
    pub span: Range<usize>,
    pub content: String,
}

/// A value that parsed but is not acceptable
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field_path: String,
    pub message: String,
    pub span: Option<Range<usize>>,
    pub source: Option<SourceInfo>,
}

impl ValidationError {
    /// Build an error pointing at the place the field was defined, if known.
    pub(super) fn at(
        field_path: &str,
        message: impl Into<String>,
        origin: Option<&MergeConflictLocation>,
    ) -> Self {
        Self {
            field_path: field_path.to_string(),
            message: message.into(),
            span: origin.map(|o| o.span.clone()),
            source: origin.map(|o| SourceInfo {
                file_path: o.file_path.clone(),
                content: o.content.clone(),
            }),
        }
    }
}

/// Config loading failures that stop before any merging happens
#[derive(Debug)]
pub enum LoadError {
    Io { path: PathBuf, error: std::io::Error },
    Parse { path: PathBuf, error: toml::de::Error },
    ImportCycle { path: PathBuf, cycle: Vec<PathBuf> },
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Io { path, error } => {
                write!(f, "Failed to read '{}': {}", path.display(), error)
            }
            LoadError::Parse { path, error } => {
                write!(f, "Failed to parse '{}': {}", path.display(), error)
            }
            LoadError::ImportCycle { path, cycle } => {
                write!(
                    f,
                    "Import cycle detected at '{}': involves {} file(s)",
                    path.display(),
                    cycle.len()
                )
            }
        }
    }
}

impl std::error::Error for LoadError {}

impl Diagnostic {
    pub fn is_error(&self) -> bool {
        matches!(self, Diagnostic::Error(_))
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, Diagnostic::Warning(_))
    }
}

/// Format all diagnostics for display using Ariadne
pub fn format_diagnostics(diagnostics: &[Diagnostic]) -> String {
    let mut output = Vec::new();

    for diagnostic in diagnostics {
        match diagnostic {
            Diagnostic::Warning(Warning::EmptyConfig { file_path }) => {
                let warning_msg = format!(
                    "Warning: Config file '{}' is empty and has no effect\n",
                    file_path.display()
                );
                output.extend_from_slice(warning_msg.as_bytes());
            }
            Diagnostic::Error(Error::Merge(merge_error)) => {
                write_merge_error(merge_error, &mut output);
            }
            Diagnostic::Error(Error::Validation(validation_error)) => {
                write_validation_error(validation_error, &mut output);
            }
        }
    }

    String::from_utf8_lossy(&output).to_string()
}

fn write_merge_error(merge_error: &MergeError, output: &mut Vec<u8>) {
    let Some(first_conflict) = merge_error.conflicts.first() else {
        return;
    };

    let mut report = Report::build(
        ReportKind::Error,
        (
            first_conflict.file_path.to_string_lossy().to_string(),
            first_conflict.span.clone(),
        ),
    )
    .with_message(format!("Merge conflict in field '{}'", merge_error.field_path))
    .with_note(&merge_error.message);

    for (idx, conflict) in merge_error.conflicts.iter().enumerate() {
        let label_msg = if idx == 0 {
            "first definition here"
        } else {
            "conflicts with this definition"
        };

        report = report.with_label(
            Label::new((
                conflict.file_path.to_string_lossy().to_string(),
                conflict.span.clone(),
            ))
            .with_message(label_msg)
            .with_color(if idx == 0 { Color::Red } else { Color::Yellow }),
        );
    }

    let finished_report = report.finish();

    // One write per distinct source file
    let mut written_files = HashSet::new();
    for conflict in &merge_error.conflicts {
        let file_id = conflict.file_path.to_string_lossy().to_string();
        if written_files.insert(file_id.clone()) {
            let source = Source::from(&conflict.content);
            finished_report.write((file_id, source), &mut *output).ok();
        }
    }
}

fn write_validation_error(validation_error: &ValidationError, output: &mut Vec<u8>) {
    let (Some(span), Some(source)) = (&validation_error.span, &validation_error.source) else {
        let error_msg = format!(
            "Validation error in '{}': {}\n",
            validation_error.field_path, validation_error.message
        );
        output.extend_from_slice(error_msg.as_bytes());
        return;
    };

    let file_id = source.file_path.to_string_lossy().to_string();
    let report = Report::build(ReportKind::Error, (file_id.clone(), span.clone()))
        .with_message(format!(
            "Validation error in '{}'",
            validation_error.field_path
        ))
        .with_label(
            Label::new((file_id.clone(), span.clone()))
                .with_message(&validation_error.message)
                .with_color(Color::Red),
        )
        .finish();

    report
        .write((file_id, Source::from(&source.content)), &mut *output)
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_warning_text() {
        let diagnostics = vec![Diagnostic::Warning(Warning::EmptyConfig {
            file_path: PathBuf::from("/etc/openevsed/empty.toml"),
        })];

        insta::assert_snapshot!(
            format_diagnostics(&diagnostics),
            @"Warning: Config file '/etc/openevsed/empty.toml' is empty and has no effect"
        );
    }

    #[test]
    fn test_validation_without_source_is_plain() {
        let diagnostics = vec![Diagnostic::Error(Error::Validation(ValidationError::at(
            "api.port",
            "port must be non-zero",
            None,
        )))];

        insta::assert_snapshot!(
            format_diagnostics(&diagnostics),
            @"Validation error in 'api.port': port must be non-zero"
        );
    }

    #[test]
    fn test_validation_with_source_points_at_value() {
        let content = "[api]\nport = 0\n".to_string();
        let origin = MergeConflictLocation {
            file_path: PathBuf::from("openevsed.toml"),
            span: 13..14,
            content,
        };
        let diagnostics = vec![Diagnostic::Error(Error::Validation(ValidationError::at(
            "api.port",
            "port must be non-zero",
            Some(&origin),
        )))];

        let rendered = format_diagnostics(&diagnostics);
        assert!(rendered.contains("Validation error in 'api.port'"));
        assert!(rendered.contains("port must be non-zero"));
        assert!(rendered.contains("openevsed.toml"));
    }
}
