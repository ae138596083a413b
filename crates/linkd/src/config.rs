//! Declaration file: controller settings and the declared links.
//!
//! ```yaml
//! controller:
//!   name: linkd
//!   min_wake_interval_ms: 500
//! links:
//!   - name: wg0
//!     logical: true
//!     kind: wireguard
//!     up: true
//!     wireguard:
//!       private_key: ...
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::reconcile::DEFAULT_OWNER;
use crate::runtime::Backoff;
use crate::spec::LinkSpec;

/// Serialization format of a declaration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
}

impl Format {
    /// Pick the format from the file extension; anything but `.json` is YAML.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// Controller settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// Finalizer owner name.
    pub name: String,
    /// Minimum time between two reconcile cycles.
    pub min_wake_interval_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_OWNER.to_string(),
            min_wake_interval_ms: 500,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl ControllerSettings {
    pub fn min_wake_interval(&self) -> Duration {
        Duration::from_millis(self.min_wake_interval_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

/// Contents of a declaration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Declaration {
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
}

impl Declaration {
    /// Read, parse and validate a declaration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        let declaration = Self::parse(&text, Format::from_path(path))
            .map_err(|e| e.context(path.display().to_string()))?;
        declaration.validate()?;
        Ok(declaration)
    }

    pub fn parse(text: &str, format: Format) -> Result<Self> {
        match format {
            Format::Yaml => serde_yaml::from_str(text)
                .map_err(|e| Error::Config(format!("YAML parsing failed: {e}"))),
            Format::Json => serde_json::from_str(text)
                .map_err(|e| Error::Config(format!("JSON parsing failed: {e}"))),
        }
    }

    pub fn render(&self, format: Format) -> Result<String> {
        match format {
            Format::Yaml => serde_yaml::to_string(self)
                .map_err(|e| Error::Config(format!("YAML serialization failed: {e}"))),
            Format::Json => serde_json::to_string_pretty(self)
                .map_err(|e| Error::Config(format!("JSON serialization failed: {e}"))),
        }
    }

    /// Check names are unique and every link is well formed.
    pub fn validate(&self) -> Result<()> {
        if self.controller.name.is_empty() {
            return Err(Error::Config("controller name must not be empty".into()));
        }

        let mut names = HashSet::new();
        for link in &self.links {
            if !names.insert(link.name.as_str()) {
                return Err(Error::Config(format!("duplicate link {}", link.name)));
            }
            link.validate()
                .map_err(|e| e.context(format!("link {}", link.name)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::LinkKind;

    const YAML: &str = r#"
controller:
  name: edge
  min_wake_interval_ms: 250
links:
  - name: eth0
    up: true
    mtu: 9000
  - name: bond0
    logical: true
    kind: bond
    up: true
    bond_master:
      mode: active-backup
      miimon: 100
"#;

    #[test]
    fn parses_yaml() {
        let decl = Declaration::parse(YAML, Format::Yaml).unwrap();
        decl.validate().unwrap();

        assert_eq!(decl.controller.name, "edge");
        assert_eq!(decl.controller.min_wake_interval(), Duration::from_millis(250));
        assert_eq!(decl.controller.backoff_max_ms, 30_000);
        assert_eq!(decl.links.len(), 2);
        assert_eq!(decl.links[0].kind, LinkKind::Physical);
        assert!(!decl.links[0].logical);
        assert_eq!(decl.links[1].kind, LinkKind::Bond);
    }

    #[test]
    fn json_and_yaml_agree() {
        let decl = Declaration::parse(YAML, Format::Yaml).unwrap();
        let json = decl.render(Format::Json).unwrap();
        assert_eq!(Declaration::parse(&json, Format::Json).unwrap(), decl);
    }

    #[test]
    fn empty_file_is_empty_declaration() {
        let decl = Declaration::parse("{}", Format::Json).unwrap();
        assert!(decl.links.is_empty());
        assert_eq!(decl.controller, ControllerSettings::default());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let decl = Declaration {
            links: vec![
                LinkSpec::new("eth0", LinkKind::Physical),
                LinkSpec::new("eth0", LinkKind::Physical),
            ],
            ..Default::default()
        };
        assert!(matches!(decl.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn format_follows_extension() {
        assert_eq!(Format::from_path(Path::new("/etc/linkd.json")), Format::Json);
        assert_eq!(Format::from_path(Path::new("/etc/linkd.yaml")), Format::Yaml);
        assert_eq!(Format::from_path(Path::new("linkd")), Format::Yaml);
    }

    #[test]
    fn syntax_errors_are_config_errors() {
        assert!(matches!(
            Declaration::parse("links: [", Format::Yaml),
            Err(Error::Config(_))
        ));
    }
}
