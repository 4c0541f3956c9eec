use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::fs;
use anyhow::{Context, Result};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub dashboard: DashboardConfig,
    #[serde(default)]
    pub columns: ColumnConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf, // blobs live under root/, catalog at root/catalog.json
    pub users_file: PathBuf,
    pub session_cache: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("storage"),
            users_file: PathBuf::from("storage/users.json"),
            session_cache: PathBuf::from("storage/session.json"),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Each filter group re-derives from the full set and clears the other.
    #[default]
    Replace,
    /// Geographic and demographic groups stack.
    Compose,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DashboardConfig {
    pub rows_per_page: usize,
    pub filter_mode: FilterMode,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            rows_per_page: 15,
            filter_mode: FilterMode::Replace,
        }
    }
}

/// Column-name aliases, tried in order.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ColumnConfig {
    pub region: Vec<String>,
    pub comuna: Vec<String>,
    pub age_group: Vec<String>,
    pub male: Vec<String>,
    pub female: Vec<String>,
    pub census_population: Vec<String>,
}

fn aliases(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl Default for ColumnConfig {
    fn default() -> Self {
        Self {
            region: aliases(&["region", "Región", "REGION", "Region"]),
            comuna: aliases(&["comuna", "Comuna", "commune"]),
            age_group: aliases(&["grupos_edad", "grupo_edad", "Edad", "edad", "age_group"]),
            male: aliases(&["hombres", "Hombres", "male"]),
            female: aliases(&["mujeres", "Mujeres", "female"]),
            census_population: aliases(&[
                "poblacion_censo",
                "Población",
                "poblacion",
                "POBLACION",
                "census_population",
            ]),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub admin_emails: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AssistantConfig {
    pub endpoint_file: PathBuf,
    pub timeout_secs: u64,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            endpoint_file: PathBuf::from("ai/n8n-endpoint.json"),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            static_dir: None,
        }
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)
            .with_context(|| "Failed to parse TOML configuration")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.dashboard.rows_per_page, 15);
        assert_eq!(config.dashboard.filter_mode, FilterMode::Replace);
        assert_eq!(config.columns.male[0], "hombres");
        assert_eq!(config.server.port, 8080);
        assert!(config.auth.admin_emails.is_empty());
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [dashboard]
            filter_mode = "compose"

            [columns]
            male = ["varones"]

            [auth]
            admin_emails = ["admin@datacensus.cl"]

            [server]
            port = 9000
            static_dir = "public"
            "#,
        )
        .unwrap();
        assert_eq!(config.dashboard.filter_mode, FilterMode::Compose);
        assert_eq!(config.dashboard.rows_per_page, 15);
        assert_eq!(config.columns.male, vec!["varones".to_string()]);
        assert_eq!(config.columns.female[0], "mujeres");
        assert_eq!(config.auth.admin_emails, vec!["admin@datacensus.cl".to_string()]);
        assert_eq!(config.server.static_dir, Some(PathBuf::from("public")));
    }

    #[test]
    fn server_section_fills_missing_port() {
        let config = AppConfig::from_toml("[server]\nstatic_dir = \"public\"\n").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.static_dir, Some(PathBuf::from("public")));
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(AppConfig::from_toml("[dashboard\nrows_per_page = ").is_err());
    }
}
