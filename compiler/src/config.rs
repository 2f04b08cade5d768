// config.rs — Frontend settings
//
// Search path, source file extension, implicitly imported modules and the
// entry function name. Loaded from an optional JSON file and then
// overridden by command-line flags.
//
// Preconditions: none.
// Postconditions: `Settings::default()` is a complete, usable configuration.
// Failure modes: unreadable or malformed JSON → `CompileError`.
// Side effects: `Settings::load` reads one file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::diag::{CompileError, WalkResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directories searched in order when resolving imports.
    pub module_path: Vec<PathBuf>,
    /// Extension (without dot) appended to the last module path segment.
    pub file_extension: String,
    /// Modules loaded before the main module, e.g. the builtins library.
    pub implicit_imports: Vec<String>,
    /// Composite function that must exist after compilation.
    pub main_function: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            module_path: vec![PathBuf::from(".")],
            file_extension: "weft".to_string(),
            implicit_imports: vec!["builtins".to_string()],
            main_function: "main".to_string(),
        }
    }
}

impl Settings {
    /// Read settings from a JSON file. Missing keys take their defaults.
    pub fn load(path: &Path) -> WalkResult<Settings> {
        let text = std::fs::read_to_string(path).map_err(|source| CompileError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Settings::from_json(&text)
    }

    pub fn from_json(text: &str) -> WalkResult<Settings> {
        serde_json::from_str(text)
            .map_err(|e| CompileError::internal(format!("invalid settings file: {}", e)))
    }

    /// Prepend directories given on the command line so they win over
    /// configured ones.
    pub fn with_search_dirs(mut self, dirs: &[PathBuf]) -> Settings {
        let mut path = dirs.to_vec();
        path.append(&mut self.module_path);
        self.module_path = path;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = Settings::default();
        assert_eq!(s.file_extension, "weft");
        assert_eq!(s.implicit_imports, vec!["builtins".to_string()]);
        assert_eq!(s.main_function, "main");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let s = Settings::from_json(r#"{ "implicit_imports": [], "main_function": "entry" }"#)
            .unwrap();
        assert!(s.implicit_imports.is_empty());
        assert_eq!(s.main_function, "entry");
        assert_eq!(s.file_extension, "weft");
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(Settings::from_json("{ nope").is_err());
    }

    #[test]
    fn cli_dirs_come_first() {
        let s = Settings::default().with_search_dirs(&[PathBuf::from("/lib")]);
        assert_eq!(s.module_path, vec![PathBuf::from("/lib"), PathBuf::from(".")]);
    }
}
