use crate::config::assembler::pivot_dir;
use std::path::Path;
use std::sync::Once;

const FILE_DOT_ENV_LOCAL: &str = ".env.local";
const FILE_DOT_ENV_GLOBAL: &str = ".env";

/// Loads environment variables from `.env.local` and `.env`.
///
/// Variables that are already set are never overridden, and missing files are
/// ignored. Since `.env.local` is loaded first, it takes precedence over
/// `.env`.
pub struct DotEnv;

impl DotEnv {
    /// Loads the dot-env files of the crate (or working) directory, at most
    /// once per process.
    pub fn tap() {
        static INIT: Once = Once::new();

        INIT.call_once(|| Self::load_from(&pivot_dir()));
    }

    /// Loads the dot-env files of the given directory.
    pub fn load_from(dir: &Path) {
        let _ = dotenvy::from_path(dir.join(FILE_DOT_ENV_LOCAL));
        let _ = dotenvy::from_path(dir.join(FILE_DOT_ENV_GLOBAL));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use scopeguard::defer;
    use std::env::{remove_var, set_var, var};
    use std::fs;

    const HERALD_DOTENV_PRESET: &str = "HERALD_DOTENV_PRESET";
    const HERALD_DOTENV_BOTH: &str = "HERALD_DOTENV_BOTH";
    const HERALD_DOTENV_LOCAL: &str = "HERALD_DOTENV_LOCAL";
    const HERALD_DOTENV_GLOBAL: &str = "HERALD_DOTENV_GLOBAL";

    #[test]
    fn local_file_wins_and_environment_is_kept() {
        // Given
        let dir = std::env::temp_dir().join(format!("herald-dotenv-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        defer! {
            let _ = fs::remove_dir_all(&dir);
            unsafe {
                remove_var(HERALD_DOTENV_PRESET);
                remove_var(HERALD_DOTENV_BOTH);
                remove_var(HERALD_DOTENV_LOCAL);
                remove_var(HERALD_DOTENV_GLOBAL);
            }
        }

        unsafe { set_var(HERALD_DOTENV_PRESET, "env") };
        fs::write(
            dir.join(FILE_DOT_ENV_LOCAL),
            format!(
                "{}=local\n{}=local\n{}=local\n",
                HERALD_DOTENV_PRESET, HERALD_DOTENV_BOTH, HERALD_DOTENV_LOCAL,
            ),
        )
        .unwrap();
        fs::write(
            dir.join(FILE_DOT_ENV_GLOBAL),
            format!(
                "{}=global\n{}=global\n{}=global\n",
                HERALD_DOTENV_PRESET, HERALD_DOTENV_BOTH, HERALD_DOTENV_GLOBAL,
            ),
        )
        .unwrap();

        // When
        DotEnv::load_from(&dir);

        // Then
        assert_eq!(var(HERALD_DOTENV_PRESET).unwrap(), "env");
        assert_eq!(var(HERALD_DOTENV_BOTH).unwrap(), "local");
        assert_eq!(var(HERALD_DOTENV_LOCAL).unwrap(), "local");
        assert_eq!(var(HERALD_DOTENV_GLOBAL).unwrap(), "global");
    }
}
