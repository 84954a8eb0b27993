//! Recognised configuration variables
//!
//! The set of variables the runtime understands is closed: each
//! [`ConfigVariable`] carries its persisted name, its default value and a
//! setter on [`RuntimeSettings`]. Names match case-insensitively.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

use crate::engine::pool::PoolLimits;

/// Entry name marking an algorithm entry (case-insensitive)
pub const ALGORITHM_ENTRY_NAME: &str = "Algorithm";

pub fn is_algorithm_entry(name: &str) -> bool {
    name.eq_ignore_ascii_case(ALGORITHM_ENTRY_NAME)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Display, EnumString, EnumIter)]
#[strum(ascii_case_insensitive)]
pub enum ConfigVariable {
    #[strum(serialize = "Script_Dir")]
    ScriptDir,
    #[strum(serialize = "Resource_Dir")]
    ResourceDir,
    #[strum(serialize = "Work_Dir")]
    WorkDir,
    #[strum(serialize = "Engine_Command")]
    EngineCommand,
    #[strum(serialize = "Engine_Timeout")]
    EngineTimeout,
    #[strum(serialize = "Cache_Processes")]
    CacheProcesses,
    #[strum(serialize = "Session_Pool_Size")]
    SessionPoolSize,
    #[strum(serialize = "Max_Sessions")]
    MaxSessions,
    #[strum(serialize = "Save_Images")]
    SaveImages,
}

impl ConfigVariable {
    pub const fn default_value(self) -> &'static str {
        match self {
            Self::ScriptDir => "scripts",
            Self::ResourceDir => "resources",
            Self::WorkDir => "workspace",
            Self::EngineCommand => "Rscript",
            Self::EngineTimeout => "0",
            Self::CacheProcesses => "true",
            Self::SessionPoolSize => "0",
            Self::MaxSessions => "0",
            Self::SaveImages => "false",
        }
    }

    /// Look a persisted entry name up, `None` for unrecognised names
    pub fn from_name(name: &str) -> Option<Self> {
        Self::from_str(name.trim()).ok()
    }

    pub fn all() -> impl Iterator<Item = Self> {
        Self::iter()
    }
}

/// Effective runtime settings after applying configuration entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub script_dirs: Vec<PathBuf>,
    pub resource_dirs: Vec<PathBuf>,
    pub work_dir: PathBuf,
    pub engine_command: String,
    /// Seconds, 0 = unlimited
    pub engine_timeout: u64,
    pub cache_processes: bool,
    pub session_pool_size: usize,
    pub max_sessions: usize,
    pub save_images: bool,
    base_dir: PathBuf,
}

impl RuntimeSettings {
    /// Defaults with relative directories resolved against `base_dir`
    pub fn defaults(base_dir: &Path) -> Self {
        let mut settings = Self {
            script_dirs: Vec::new(),
            resource_dirs: Vec::new(),
            work_dir: PathBuf::new(),
            engine_command: String::new(),
            engine_timeout: 0,
            cache_processes: true,
            session_pool_size: 0,
            max_sessions: 0,
            save_images: false,
            base_dir: base_dir.to_path_buf(),
        };
        for var in ConfigVariable::all() {
            // Defaults are valid by construction
            let _ = settings.apply(var, var.default_value());
        }
        settings
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Apply one variable. On error the previous value stays in effect.
    pub fn apply(&mut self, var: ConfigVariable, value: &str) -> Result<(), String> {
        let value = value.trim();
        match var {
            ConfigVariable::ScriptDir => {
                let dirs = self.dir_list(value);
                if dirs.is_empty() {
                    return Err("at least one script directory is required".to_string());
                }
                self.script_dirs = dirs;
            }
            ConfigVariable::ResourceDir => self.resource_dirs = self.dir_list(value),
            ConfigVariable::WorkDir => {
                if value.is_empty() {
                    return Err("work directory must not be empty".to_string());
                }
                self.work_dir = self.resolve(value);
            }
            ConfigVariable::EngineCommand => {
                if value.is_empty() {
                    return Err("engine command must not be empty".to_string());
                }
                self.engine_command = value.to_string();
            }
            ConfigVariable::EngineTimeout => self.engine_timeout = parse_number(value)?,
            ConfigVariable::CacheProcesses => self.cache_processes = parse_bool(value)?,
            ConfigVariable::SessionPoolSize => self.session_pool_size = parse_number(value)?,
            ConfigVariable::MaxSessions => self.max_sessions = parse_number(value)?,
            ConfigVariable::SaveImages => self.save_images = parse_bool(value)?,
        }
        Ok(())
    }

    pub fn pool_limits(&self) -> PoolLimits {
        PoolLimits {
            max_idle: self.session_pool_size,
            max_active: self.max_sessions,
        }
    }

    /// Per round trip deadline, `None` when unlimited
    pub fn engine_timeout(&self) -> Option<Duration> {
        (self.engine_timeout > 0).then(|| Duration::from_secs(self.engine_timeout))
    }

    /// Where file outputs are copied before the workspace is dropped
    pub fn results_dir(&self) -> PathBuf {
        self.work_dir.join("results")
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    fn dir_list(&self, value: &str) -> Vec<PathBuf> {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| self.resolve(s))
            .collect()
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(format!("expected true or false, got '{}'", value)),
    }
}

fn parse_number<T: FromStr>(value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("expected a non-negative integer, got '{}'", value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_names_round_trip() {
        for var in ConfigVariable::all() {
            assert_eq!(ConfigVariable::from_name(&var.to_string()), Some(var));
        }
        assert_eq!(ConfigVariable::from_name("script_dir"), Some(ConfigVariable::ScriptDir));
        assert_eq!(ConfigVariable::from_name("SAVE_IMAGES"), Some(ConfigVariable::SaveImages));
        assert_eq!(ConfigVariable::from_name("Algorithm"), None);
        assert_eq!(ConfigVariable::all().count(), 9);
    }

    #[test]
    fn test_defaults_resolve_against_base() {
        let settings = RuntimeSettings::defaults(Path::new("/srv/wps"));
        assert_eq!(settings.script_dirs, vec![PathBuf::from("/srv/wps/scripts")]);
        assert_eq!(settings.resource_dirs, vec![PathBuf::from("/srv/wps/resources")]);
        assert_eq!(settings.work_dir, PathBuf::from("/srv/wps/workspace"));
        assert_eq!(settings.engine_command, "Rscript");
        assert!(settings.cache_processes);
        assert_eq!(settings.engine_timeout(), None);
        assert_eq!(settings.pool_limits(), PoolLimits::default());
    }

    #[test]
    fn test_apply_values() {
        let mut settings = RuntimeSettings::defaults(Path::new("/base"));
        settings.apply(ConfigVariable::ScriptDir, "a, /abs/b ,").unwrap();
        assert_eq!(
            settings.script_dirs,
            vec![PathBuf::from("/base/a"), PathBuf::from("/abs/b")]
        );
        settings.apply(ConfigVariable::CacheProcesses, "FALSE").unwrap();
        assert!(!settings.cache_processes);
        settings.apply(ConfigVariable::EngineTimeout, "30").unwrap();
        assert_eq!(settings.engine_timeout(), Some(Duration::from_secs(30)));
        settings.apply(ConfigVariable::MaxSessions, "4").unwrap();
        settings.apply(ConfigVariable::SessionPoolSize, "2").unwrap();
        assert_eq!(
            settings.pool_limits(),
            PoolLimits {
                max_idle: 2,
                max_active: 4
            }
        );
        settings.apply(ConfigVariable::ResourceDir, "").unwrap();
        assert!(settings.resource_dirs.is_empty());
    }

    #[test]
    fn test_invalid_values_keep_previous() {
        let mut settings = RuntimeSettings::defaults(Path::new("/base"));
        assert!(settings.apply(ConfigVariable::MaxSessions, "-1").is_err());
        assert!(settings.apply(ConfigVariable::SaveImages, "maybe").is_err());
        assert!(settings.apply(ConfigVariable::ScriptDir, " , ").is_err());
        assert!(settings.apply(ConfigVariable::EngineCommand, "").is_err());
        assert_eq!(settings, RuntimeSettings::defaults(Path::new("/base")));
    }

    #[test]
    fn test_algorithm_entry_name() {
        assert!(is_algorithm_entry("algorithm"));
        assert!(is_algorithm_entry("Algorithm"));
        assert!(!is_algorithm_entry("Script_Dir"));
    }
}
