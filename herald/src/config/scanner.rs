use config::FileFormat;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};

/// A single file of the config directory, with the profile it is restricted
/// to, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    path: PathBuf,
    format: FileFormat,
    profile: Option<String>,
}

impl ConfigFile {
    /// Recognizes a config file by its name: `<stem>.<ext>` applies to every
    /// profile, `<stem>.<profile>.<ext>` only to the named one. Anything else,
    /// including unsupported extensions, yields `None`.
    pub fn try_at(path: PathBuf) -> Option<Self> {
        let name = path.file_name().and_then(std::ffi::OsStr::to_str)?;
        let chunks = name.split('.').collect::<Vec<_>>();

        let (profile, extension) = match *chunks.as_slice() {
            [stem, extension] if !stem.is_empty() => (None, extension),
            [stem, profile, extension] if !stem.is_empty() && !profile.is_empty() => {
                (Some(profile.to_ascii_lowercase()), extension)
            }
            _ => return None,
        };

        let format = format_of(extension)?;

        Some(Self {
            path,
            format,
            profile,
        })
    }

    /// The path to this file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The profile this file is restricted to, if any.
    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    /// Reports whether this file applies to the given profile.
    pub fn applies_to(&self, profile: Option<&str>) -> bool {
        match (self.profile(), profile) {
            (None, _) => true,
            (Some(own), Some(given)) => own.eq_ignore_ascii_case(given),
            (Some(_), None) => false,
        }
    }
}

/// Generic files come first, then profile-specific ones; each group is ordered
/// by path.
impl Ord for ConfigFile {
    fn cmp(&self, other: &Self) -> Ordering {
        self.profile
            .is_some()
            .cmp(&other.profile.is_some())
            .then_with(|| self.path.cmp(&other.path))
    }
}

impl PartialOrd for ConfigFile {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<ConfigFile> for config::File<config::FileSourceFile, FileFormat> {
    fn from(file: ConfigFile) -> Self {
        config::File::from(file.path).format(file.format)
    }
}

fn format_of(extension: &str) -> Option<FileFormat> {
    match extension.to_ascii_lowercase().as_str() {
        "toml" => Some(FileFormat::Toml),
        "yaml" | "yml" => Some(FileFormat::Yaml),
        "json" => Some(FileFormat::Json),
        _ => None,
    }
}

/// Lists the config files of the given directory that apply to the given
/// profile, in the order they should be layered. A missing or unreadable
/// directory yields no files.
pub fn find_config_files(dir: &Path, profile: Option<&str>) -> Vec<ConfigFile> {
    let mut files = std::fs::read_dir(dir)
        .into_iter()
        .flat_map(|read_dir| read_dir.filter_map(Result::ok))
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter_map(ConfigFile::try_at)
        .filter(|file| file.applies_to(profile))
        .collect::<Vec<_>>();

    files.sort();

    files
}
