use crate::config::scanner::find_config_files;
use config::builder::DefaultState;
use config::{ConfigBuilder, Environment};
use std::env;
use std::path::PathBuf;

/// The environment variable that overrides the config directory.
pub const ENV_CONFIG_DIR: &str = "APP_CONFIG_DIR";

/// The environment variable that selects the active profile.
pub const ENV_PROFILE: &str = "APP_PROFILE";

/// Where [`AppConfig`](crate::AppConfig) is assembled from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblerChoices {
    dir: PathBuf,
    profile: Option<String>,
    env_prefix: Option<String>,
    env_separator: String,
}

impl AssemblerChoices {
    /// Reads the files of the given directory, with no active profile and no
    /// environment source.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            profile: None,
            env_prefix: None,
            env_separator: Self::default_env_separator(),
        }
    }

    /// Recreates these choices with the given active profile.
    pub fn with_profile(self, profile: impl Into<String>) -> Self {
        Self {
            profile: Some(profile.into()),
            ..self
        }
    }

    /// Recreates these choices with an environment source of the given
    /// prefix.
    pub fn with_env_prefix(self, env_prefix: impl Into<String>) -> Self {
        Self {
            env_prefix: Some(env_prefix.into()),
            ..self
        }
    }

    /// Recreates these choices with the given separator of nested keys in
    /// environment variable names.
    pub fn with_env_separator(self, env_separator: impl Into<String>) -> Self {
        Self {
            env_separator: env_separator.into(),
            ..self
        }
    }

    /// The directory holding the config files.
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// The active profile, if any.
    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    fn default_env_separator() -> String {
        "__".to_string()
    }
}

/// The `config/` directory next to the running crate (or the working
/// directory), unless `APP_CONFIG_DIR` points elsewhere. The profile comes
/// from `APP_PROFILE`, and environment variables are read with the `APP`
/// prefix: `APP_BROKER__HOST` sets `broker.host`.
impl Default for AssemblerChoices {
    fn default() -> Self {
        let dir = env::var(ENV_CONFIG_DIR)
            .ok()
            .map(|dir| dir.trim().to_string())
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config"));
        let dir = if dir.is_absolute() {
            dir
        } else {
            pivot_dir().join(dir)
        };

        let profile = env::var(ENV_PROFILE)
            .ok()
            .map(|profile| profile.trim().to_ascii_lowercase())
            .filter(|profile| !profile.is_empty());

        Self {
            dir,
            profile,
            env_prefix: Some("APP".to_string()),
            env_separator: Self::default_env_separator(),
        }
    }
}

/// The directory relative paths are resolved against: the crate directory
/// under Cargo, the working directory otherwise.
pub(crate) fn pivot_dir() -> PathBuf {
    env::var("CARGO_MANIFEST_DIR")
        .map(PathBuf::from)
        .or_else(|_| env::current_dir())
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Builds the layered [`ConfigBuilder`]: generic files, then profile files,
/// then the environment.
pub fn make_builder(choices: &AssemblerChoices) -> ConfigBuilder<DefaultState> {
    let mut builder = ConfigBuilder::<DefaultState>::default();

    for file in find_config_files(choices.dir(), choices.profile()) {
        builder = builder.add_source(config::File::from(file));
    }

    if let Some(prefix) = choices.env_prefix.as_deref() {
        builder = builder.add_source(
            Environment::with_prefix(prefix)
                .prefix_separator("_")
                .separator(&choices.env_separator),
        );
    }

    builder
}
