use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{
    domain::{Game, Implementation, Level, Registry},
    template::{self, TemplateError},
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config from {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config is invalid: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{entry}: {reason}")]
    Invalid { entry: String, reason: String },
    #[error("{entry}: bad {field} template: {source}")]
    Template {
        entry: String,
        field: &'static str,
        source: TemplateError,
    },
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Wall-clock limit for every executed command.
    pub timeout_secs: Option<f64>,
    /// Repetitions per level, capped at the built-in maximum.
    pub repetitions: Option<usize>,
}

impl Settings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs_f64)
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub settings: Settings,
    pub registry: Registry,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    settings: Settings,
    #[serde(default)]
    game: BTreeMap<String, GameEntry>,
    #[serde(default, rename = "impl")]
    implementations: BTreeMap<String, ImplEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct GameEntry {
    #[serde(default)]
    description: String,
    levels: Vec<LevelEntry>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LevelEntry {
    #[serde(default)]
    args: String,
    result: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ImplEntry {
    executable: String,
    language: String,
    #[serde(default)]
    version: String,
    build: Option<String>,
    run: String,
}

impl Config {
    #[tracing::instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config = text.parse()?;
        tracing::info!(
            games = config.registry.games.len(),
            implementations = config.registry.implementations.len(),
            "Config loaded"
        );
        Ok(config)
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let file: ConfigFile = toml::from_str(text)?;
        validate_settings(&file.settings)?;

        let mut games = BTreeMap::new();
        for (name, entry) in file.game {
            games.insert(name.clone(), game_from_entry(name, entry)?);
        }

        let mut implementations = BTreeMap::new();
        for (name, entry) in file.implementations {
            implementations.insert(name.clone(), implementation_from_entry(name, entry)?);
        }

        Ok(Self {
            settings: file.settings,
            registry: Registry {
                games,
                implementations,
            },
        })
    }
}

fn validate_settings(settings: &Settings) -> Result<(), ConfigError> {
    if let Some(timeout) = settings.timeout_secs {
        if !(timeout.is_finite() && timeout > 0.0) {
            return Err(ConfigError::Invalid {
                entry: "settings".to_string(),
                reason: format!("timeout_secs must be positive, got {timeout}"),
            });
        }
    }
    if settings.repetitions == Some(0) {
        return Err(ConfigError::Invalid {
            entry: "settings".to_string(),
            reason: "repetitions must be at least 1".to_string(),
        });
    }

    Ok(())
}

fn game_from_entry(name: String, entry: GameEntry) -> Result<Game, ConfigError> {
    if entry.levels.is_empty() {
        return Err(ConfigError::Invalid {
            entry: format!("game.{name}"),
            reason: "at least one level is required".to_string(),
        });
    }

    Ok(Game {
        name,
        description: entry.description,
        levels: entry
            .levels
            .into_iter()
            .map(|level| Level {
                args: level.args,
                result: level.result,
            })
            .collect(),
    })
}

fn implementation_from_entry(
    name: String,
    entry: ImplEntry,
) -> Result<Implementation, ConfigError> {
    let key = format!("impl.{name}");

    for (field, value) in [
        ("executable", &entry.executable),
        ("language", &entry.language),
        ("run", &entry.run),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::Invalid {
                entry: key,
                reason: format!("{field} must not be empty"),
            });
        }
    }

    // An empty build command means the same as no build command.
    let build = entry.build.filter(|build| !build.trim().is_empty());

    let templates = [
        ("version", Some(&entry.version)),
        ("build", build.as_ref()),
        ("run", Some(&entry.run)),
    ];
    for (field, value) in templates {
        if let Some(value) = value {
            template::validate(value).map_err(|source| ConfigError::Template {
                entry: key.clone(),
                field,
                source,
            })?;
        }
    }

    Ok(Implementation {
        name,
        executable: entry.executable,
        language: entry.language,
        version: entry.version,
        build,
        run: entry.run,
    })
}
