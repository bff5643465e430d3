use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use syswatch_core::ModuleConfig;

const DEFAULT_CONFIG_FILE: &str = "/etc/syswatch/syswatch.ini";

/// Configuration of all the modules, one `INI` section per module.
///
/// ```ini
/// [file-system-monitor]
/// unlink_discarders=/tmp/.X11-unix/,/var/cache/
/// reported_errors=EACCES,EPERM
/// ```
#[derive(Debug, Clone, Default)]
pub struct SyswatchConfig {
    config_file: Option<PathBuf>,
    configs: HashMap<String, ModuleConfig>,
}

impl SyswatchConfig {
    /// Load the default file. A missing file means every module runs with
    /// its defaults.
    pub fn new() -> Result<Self> {
        let config_file = Path::new(DEFAULT_CONFIG_FILE);
        if !config_file.exists() {
            log::debug!("{DEFAULT_CONFIG_FILE} not found, using defaults");
            return Ok(Self::default());
        }
        Self::from_config_file(config_file.to_path_buf())
    }

    /// Load a custom file, which must exist.
    pub fn with_custom_file(config_file: impl AsRef<Path>) -> Result<Self> {
        let config_file = config_file.as_ref();
        if !config_file.exists() {
            bail!("Configuration file {} not found", config_file.display());
        }
        Self::from_config_file(config_file.to_path_buf())
    }

    fn from_config_file(config_file: PathBuf) -> Result<Self> {
        let conf = ini::Ini::load_from_file(&config_file)
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;
        Ok(Self {
            configs: parse_sections(&conf),
            config_file: Some(config_file),
        })
    }

    /// Parse configuration from a string, without a backing file.
    pub fn from_ini_str(content: &str) -> Result<Self> {
        let conf = ini::Ini::load_from_str(content).context("Error parsing configuration")?;
        Ok(Self {
            configs: parse_sections(&conf),
            config_file: None,
        })
    }

    /// Get module configuration. Missing sections get an empty one.
    pub fn get_module_config(&self, module: &str) -> ModuleConfig {
        self.configs.get(module).cloned().unwrap_or_default()
    }

    pub fn get_configs(&self) -> Vec<(String, ModuleConfig)> {
        self.configs
            .iter()
            .map(|(module, config)| (module.clone(), config.clone()))
            .collect()
    }

    /// Update module configuration, persisting it to the backing file if any.
    pub fn update_config(&mut self, module: &str, key: &str, value: &str) -> Result<()> {
        self.configs
            .entry(module.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());

        if let Some(config_file) = &self.config_file {
            let mut conf = ini::Ini::load_from_file(config_file)
                .with_context(|| format!("Error loading configuration from {config_file:?}"))?;
            conf.with_section(Some(module)).set(key, value);
            log::debug!("Changing configuration {module}.{key}={value}");
            conf.write_to_file(config_file)
                .with_context(|| format!("Error writing to {config_file:?}"))?;
        }
        Ok(())
    }
}

fn parse_sections(conf: &ini::Ini) -> HashMap<String, ModuleConfig> {
    let mut configs: HashMap<String, ModuleConfig> = HashMap::new();
    for (section, prop) in conf {
        if let Some(section) = section {
            let mod_config = configs.entry(section.to_string()).or_default();
            for (key, value) in prop.iter() {
                log::debug!("{section}.{key}={value}");
                mod_config.insert(key.to_string(), value.to_string());
            }
        }
    }
    configs
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const CONTENT: &str = "\
[file-system-monitor]
discarder_capacity=64
unlink_discarders=/tmp/a,/tmp/b
";

    #[test]
    fn sections_become_module_configs() {
        let config = SyswatchConfig::from_ini_str(CONTENT).unwrap();
        let module = config.get_module_config("file-system-monitor");
        assert_eq!(module.with_default("discarder_capacity", 0usize), Ok(64));
        assert_eq!(
            module.get_list::<String>("unlink_discarders").unwrap(),
            vec!["/tmp/a", "/tmp/b"]
        );
        assert_eq!(
            config
                .get_module_config("other")
                .with_default("discarder_capacity", 0usize),
            Ok(0)
        );
        assert_eq!(config.get_configs().len(), 1);
    }

    #[test]
    fn missing_custom_file() {
        assert!(SyswatchConfig::with_custom_file("/nonexistent/syswatch.ini").is_err());
    }

    #[test]
    fn update_is_persisted() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONTENT.as_bytes()).unwrap();

        let mut config = SyswatchConfig::with_custom_file(file.path()).unwrap();
        config
            .update_config("file-system-monitor", "prefix_size", "16")
            .unwrap();
        assert_eq!(
            config
                .get_module_config("file-system-monitor")
                .with_default("prefix_size", 32usize),
            Ok(16)
        );

        let reloaded = SyswatchConfig::with_custom_file(file.path()).unwrap();
        let module = reloaded.get_module_config("file-system-monitor");
        assert_eq!(module.with_default("prefix_size", 32usize), Ok(16));
        assert_eq!(module.with_default("discarder_capacity", 0usize), Ok(64));
    }
}
