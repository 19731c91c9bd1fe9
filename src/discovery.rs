//! Finds annotated source programs below a directory.
//!
//! A source declares itself through comment lines of the form `<comment> KEY=VALUE`:
//!
//! ```text
//! // GAME=nbody
//! // LANG=c
//! // LANG=c++
//! // CFLAGS=-O2 -lm
//! ```
//!
//! `GAME` is mandatory, `LANG` may repeat, and every other key becomes a template
//! variable. Files without any directive are not sources. Files with malformed
//! directives are skipped with a warning.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use walkdir::WalkDir;

use crate::core::domain::SourceProgram;

static DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    // A bare `*` only counts as the continuation of an indented block comment.
    Regex::new(
        r"^(?:\s*(?://|/\*|\(\*|--|;+|#+|%+|!|')\s*|\s+\*\s+)([A-Za-z_][A-Za-z0-9_]*)=(.*)$",
    )
    .expect("directive pattern is valid")
});

const BLOCK_CLOSERS: [&str; 3] = ["*/", "*)", "-->"];

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("{0:?} is not a directory")]
    NotADirectory(PathBuf),
    #[error("{path:?}: no GAME directive")]
    MissingGame { path: PathBuf },
    #[error("{path:?}: conflicting GAME directives {first:?} and {second:?}")]
    ConflictingGame {
        path: PathBuf,
        first: String,
        second: String,
    },
    #[error("{path:?}: empty value for {key}")]
    EmptyValue { path: PathBuf, key: String },
}

/// Walks `root` in file name order and returns every valid source program.
#[tracing::instrument(skip_all, fields(root = %root.display()))]
pub fn discover(root: &Path) -> Result<Vec<SourceProgram>, DiscoveryError> {
    if !root.is_dir() {
        return Err(DiscoveryError::NotADirectory(root.to_path_buf()));
    }

    let mut sources = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!("Skipping unreadable entry: {}", err);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let Ok(text) = std::fs::read_to_string(entry.path()) else {
            tracing::debug!(path = %entry.path().display(), "Skipping non-text file");
            continue;
        };

        match parse_source(entry.path(), &text) {
            Ok(Some(source)) => sources.push(source),
            Ok(None) => {}
            Err(err) => tracing::warn!("Skipping source: {}", err),
        }
    }

    tracing::info!(count = sources.len(), "Sources discovered");
    Ok(sources)
}

/// Reads the directives of one file. `Ok(None)` means the file declares nothing.
pub fn parse_source(path: &Path, text: &str) -> Result<Option<SourceProgram>, DiscoveryError> {
    let mut game: Option<String> = None;
    let mut languages = BTreeSet::new();
    let mut vars = HashMap::new();
    let mut seen_directive = false;

    for (key, value) in text.lines().filter_map(directive) {
        seen_directive = true;
        if value.is_empty() {
            return Err(DiscoveryError::EmptyValue {
                path: path.to_path_buf(),
                key: key.to_string(),
            });
        }

        match key {
            "GAME" => match &game {
                Some(first) if first != value => {
                    return Err(DiscoveryError::ConflictingGame {
                        path: path.to_path_buf(),
                        first: first.clone(),
                        second: value.to_string(),
                    });
                }
                _ => game = Some(value.to_string()),
            },
            "LANG" => {
                languages.insert(value.to_string());
            }
            _ => {
                vars.insert(key.to_string(), value.to_string());
            }
        }
    }

    if !seen_directive {
        return Ok(None);
    }
    let Some(game) = game else {
        return Err(DiscoveryError::MissingGame {
            path: path.to_path_buf(),
        });
    };

    Ok(Some(SourceProgram {
        path: path.to_path_buf(),
        game,
        languages,
        vars,
    }))
}

fn directive(line: &str) -> Option<(&str, &str)> {
    let captures = DIRECTIVE.captures(line)?;
    let key = captures.get(1)?.as_str();
    let mut value = captures.get(2)?.as_str().trim();
    for closer in BLOCK_CLOSERS {
        value = value.strip_suffix(closer).unwrap_or(value).trim_end();
    }

    Some((key, value))
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|name| name.starts_with('.'))
}
