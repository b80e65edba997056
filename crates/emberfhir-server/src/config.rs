use emberfhir_core::{FhirVersion, WireFormat};
use emberfhir_store::TenantSettings;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// Chat-webhook credential pool configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatConfig {
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

impl ChatConfig {
    pub fn is_configured(&self) -> bool {
        self.site.is_some() && self.identity.is_some() && self.key.is_some()
    }
}

/// One tenant as configured on the command line or in a config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantConfig {
    pub name: String,
    pub version: String,
    pub base_url: String,
    #[serde(default)]
    pub load_directory: Option<PathBuf>,
    #[serde(default)]
    pub max_resources: usize,
    #[serde(default)]
    pub smart_required: bool,
    #[serde(default)]
    pub protect_loaded: bool,
}

impl TenantConfig {
    pub fn to_settings(&self) -> Result<TenantSettings, String> {
        let version = FhirVersion::from_str(&self.version).map_err(|e| e.to_string())?;
        let mut settings = TenantSettings::new(&self.name, version, &self.base_url)
            .with_max_resources(self.max_resources)
            .with_smart_required(self.smart_required)
            .with_protect_loaded(self.protect_loaded);
        if let Some(dir) = &self.load_directory {
            settings = settings.with_load_directory(dir);
        }
        settings.formats = vec![WireFormat::Json, WireFormat::Xml];
        Ok(settings)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
    #[serde(default)]
    pub chat: ChatConfig,
}

fn default_listen() -> String {
    "0.0.0.0:5826".to_string()
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.addr()?;
        if self.tenants.is_empty() {
            return Err("at least one tenant must be configured".into());
        }
        let mut seen = std::collections::HashSet::new();
        for tenant in &self.tenants {
            if tenant.name.is_empty() {
                return Err("tenant name must not be empty".into());
            }
            if tenant.name.contains('/') || tenant.name.starts_with('_') {
                return Err(format!("tenant name '{}' is not usable in a path", tenant.name));
            }
            if !seen.insert(tenant.name.clone()) {
                return Err(format!("tenant '{}' is configured twice", tenant.name));
            }
            tenant.to_settings()?;
            if let Some(dir) = &tenant.load_directory
                && !dir.is_dir()
            {
                return Err(format!(
                    "tenant '{}' load directory {} is not a directory",
                    tenant.name,
                    dir.display()
                ));
            }
        }
        let partially_configured = [&self.chat.site, &self.chat.identity, &self.chat.key]
            .iter()
            .filter(|v| v.is_some())
            .count();
        if partially_configured > 0 && !self.chat.is_configured() {
            return Err("chat webhook needs site, identity and key together".into());
        }
        Ok(())
    }

    pub fn addr(&self) -> Result<SocketAddr, String> {
        self.listen
            .parse::<SocketAddr>()
            .map_err(|e| format!("listen address '{}' is invalid: {e}", self.listen))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(name: &str) -> TenantConfig {
        TenantConfig {
            name: name.to_string(),
            version: "R4".to_string(),
            base_url: format!("http://localhost:5826/{name}"),
            load_directory: None,
            max_resources: 0,
            smart_required: false,
            protect_loaded: false,
        }
    }

    #[test]
    fn valid_config_passes() {
        let config = AppConfig {
            listen: "127.0.0.1:5826".into(),
            tenants: vec![tenant("r4")],
            chat: ChatConfig::default(),
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.addr().unwrap().port(), 5826);
    }

    #[test]
    fn bad_listen_address_fails() {
        let config = AppConfig {
            listen: "nonsense".into(),
            tenants: vec![tenant("r4")],
            chat: ChatConfig::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_tenant_fails() {
        let config = AppConfig {
            listen: "127.0.0.1:5826".into(),
            tenants: vec![tenant("r4"), tenant("r4")],
            chat: ChatConfig::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_version_fails() {
        let mut bad = tenant("r4");
        bad.version = "R7".into();
        let config = AppConfig {
            listen: "127.0.0.1:5826".into(),
            tenants: vec![bad],
            chat: ChatConfig::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_chat_credentials_fail() {
        let config = AppConfig {
            listen: "127.0.0.1:5826".into(),
            tenants: vec![tenant("r4")],
            chat: ChatConfig {
                site: Some("https://chat.example.org".into()),
                identity: None,
                key: None,
            },
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn no_tenants_fails() {
        let config = AppConfig {
            listen: "127.0.0.1:5826".into(),
            tenants: Vec::new(),
            chat: ChatConfig::default(),
        };
        assert!(config.validate().is_err());
    }
}
