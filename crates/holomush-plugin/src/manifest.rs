//! Plugin manifest parsing and validation.
//!
//! Every plugin bundle carries a `plugin.yaml` describing what the plugin is
//! and what it wants:
//!
//! ```yaml
//! name: echo
//! version: 1.0.0
//! type: script
//! events: [say]
//! capabilities:
//!   - events.emit.location
//! script-config:
//!   entry: main.lua
//! ```
//!
//! Parsing and semantic validation are one step — [`Manifest::parse`] never
//! hands back a manifest that later stages need to re-check. Validation runs
//! in a fixed order (name, version, constraints, runtime config, commands)
//! so operators always see the first relevant problem.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum accepted plugin name length.
const MAX_NAME_LEN: usize = 64;

/// Which runtime executes a plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    /// Sandboxed in-process script, one interpreter per event.
    Script,
    /// Supervised out-of-process binary speaking the wire protocol.
    Binary,
}

impl PluginType {
    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginType::Script => "script",
            PluginType::Binary => "binary",
        }
    }
}

impl std::fmt::Display for PluginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime configuration for script plugins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ScriptConfig {
    /// Entry file, relative to the plugin directory.
    pub entry: String,
}

/// Runtime configuration for binary plugins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BinaryConfig {
    /// Executable path, relative to the plugin directory.
    pub executable: String,
}

/// One command contributed by a plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CommandSpec {
    /// Command name as typed by players.
    pub name: String,
    /// Inline help text. Mutually exclusive with `help-file`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_text: Option<String>,
    /// Help file path relative to the plugin directory. Mutually exclusive
    /// with `help-text`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_file: Option<String>,
}

/// Validated description of one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Manifest {
    /// Plugin identifier: kebab-case, 1-64 chars, starts with a letter.
    pub name: String,
    /// Strict semver version of the plugin.
    pub version: String,
    /// Which runtime executes this plugin.
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    /// Optional semver constraint on the host version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    /// Other plugins this plugin needs, name → semver constraint.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    /// Event types the plugin subscribes to; empty means all types.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<String>,
    /// Capability patterns the plugin requests.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    /// Commands the plugin contributes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<CommandSpec>,
    /// Present iff `type: script`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_config: Option<ScriptConfig>,
    /// Present iff `type: binary`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_config: Option<BinaryConfig>,
}

/// Why a manifest was rejected.
#[derive(Debug, Clone, Error)]
pub enum ManifestError {
    /// The input was empty.
    #[error("manifest input is empty")]
    Empty,

    /// The input was not parseable YAML of the manifest shape.
    #[error("manifest is not valid YAML: {0}")]
    Parse(String),

    /// A field failed semantic validation.
    #[error("invalid manifest field '{field}': {reason}")]
    Field {
        /// Which field.
        field: &'static str,
        /// What was wrong.
        reason: String,
    },

    /// JSON Schema validation failed.
    #[error("manifest does not match schema: {0}")]
    Schema(String),
}

impl ManifestError {
    fn field(field: &'static str, reason: impl Into<String>) -> Self {
        ManifestError::Field {
            field,
            reason: reason.into(),
        }
    }
}

impl Manifest {
    /// Parses and validates a manifest from YAML bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(ManifestError::Empty);
        }
        let manifest: Manifest =
            serde_yaml::from_slice(bytes).map_err(|e| ManifestError::Parse(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Runs semantic validation in a fixed order.
    pub fn validate(&self) -> Result<(), ManifestError> {
        validate_name(&self.name)?;

        semver::Version::parse(&self.version).map_err(|e| {
            ManifestError::field("version", format!("not a strict semver version: {e}"))
        })?;

        if let Some(engine) = &self.engine {
            semver::VersionReq::parse(engine).map_err(|e| {
                ManifestError::field("engine", format!("not a semver constraint: {e}"))
            })?;
        }
        for (name, constraint) in &self.dependencies {
            semver::VersionReq::parse(constraint).map_err(|e| {
                ManifestError::field(
                    "dependencies",
                    format!("constraint for '{name}' is not a semver constraint: {e}"),
                )
            })?;
        }

        self.validate_runtime_config()?;

        for command in &self.commands {
            command.validate()?;
        }
        Ok(())
    }

    fn validate_runtime_config(&self) -> Result<(), ManifestError> {
        match self.plugin_type {
            PluginType::Script => {
                if self.binary_config.is_some() {
                    return Err(ManifestError::field(
                        "binary-config",
                        "not allowed for type 'script'",
                    ));
                }
                match &self.script_config {
                    None => Err(ManifestError::field(
                        "script-config",
                        "required for type 'script'",
                    )),
                    Some(cfg) if cfg.entry.is_empty() => {
                        Err(ManifestError::field("script-config", "entry must not be empty"))
                    }
                    Some(_) => Ok(()),
                }
            }
            PluginType::Binary => {
                if self.script_config.is_some() {
                    return Err(ManifestError::field(
                        "script-config",
                        "not allowed for type 'binary'",
                    ));
                }
                match &self.binary_config {
                    None => Err(ManifestError::field(
                        "binary-config",
                        "required for type 'binary'",
                    )),
                    Some(cfg) if cfg.executable.is_empty() => Err(ManifestError::field(
                        "binary-config",
                        "executable must not be empty",
                    )),
                    Some(_) => Ok(()),
                }
            }
        }
    }

    /// Checks this manifest's `engine` constraint against a host version.
    ///
    /// Manifests without an `engine` constraint accept any host.
    pub fn engine_accepts(&self, host_version: &semver::Version) -> bool {
        match &self.engine {
            None => true,
            Some(engine) => semver::VersionReq::parse(engine)
                .map(|req| req.matches(host_version))
                .unwrap_or(false),
        }
    }
}

impl CommandSpec {
    fn validate(&self) -> Result<(), ManifestError> {
        if self.name.is_empty() {
            return Err(ManifestError::field("commands", "command name must not be empty"));
        }
        if self.help_text.is_some() && self.help_file.is_some() {
            return Err(ManifestError::field(
                "commands",
                format!(
                    "command '{}' sets both help-text and help-file",
                    self.name
                ),
            ));
        }
        Ok(())
    }
}

/// Validates the plugin-name grammar: kebab-case, 1-64 chars, starts with a
/// lowercase letter, no consecutive or trailing hyphens.
fn validate_name(name: &str) -> Result<(), ManifestError> {
    if name.is_empty() {
        return Err(ManifestError::field("name", "must not be empty"));
    }
    let mut prev = '\0';
    for (i, c) in name.chars().enumerate() {
        let ok = match c {
            'a'..='z' => true,
            '0'..='9' | '-' => i > 0,
            _ => false,
        };
        if !ok {
            return Err(ManifestError::field(
                "name",
                format!("invalid character '{c}' at position {i}"),
            ));
        }
        if c == '-' && prev == '-' {
            return Err(ManifestError::field("name", "consecutive hyphens"));
        }
        prev = c;
    }
    if prev == '-' {
        return Err(ManifestError::field("name", "trailing hyphen"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ManifestError::field(
            "name",
            format!("longer than {MAX_NAME_LEN} characters"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT_MANIFEST: &str = "\
name: echo
version: 1.0.0
type: script
events: [say]
capabilities:
  - events.emit.location
script-config:
  entry: main.lua
";

    fn field_of(err: ManifestError) -> &'static str {
        match err {
            ManifestError::Field { field, .. } => field,
            other => panic!("expected field error, got {other}"),
        }
    }

    #[test]
    fn parses_a_script_manifest() {
        let m = Manifest::parse(SCRIPT_MANIFEST.as_bytes()).unwrap();
        assert_eq!(m.name, "echo");
        assert_eq!(m.plugin_type, PluginType::Script);
        assert_eq!(m.events, vec!["say"]);
        assert_eq!(m.script_config.as_ref().unwrap().entry, "main.lua");
    }

    #[test]
    fn parses_a_binary_manifest() {
        let yaml = "\
name: bridge
version: 2.1.0-alpha
type: binary
engine: '>=0.1.0'
dependencies:
  echo: '^1.0'
binary-config:
  executable: bin/bridge
";
        let m = Manifest::parse(yaml.as_bytes()).unwrap();
        assert_eq!(m.plugin_type, PluginType::Binary);
        assert_eq!(m.binary_config.as_ref().unwrap().executable, "bin/bridge");
    }

    #[test]
    fn rejects_empty_input() {
        assert!(matches!(Manifest::parse(b""), Err(ManifestError::Empty)));
        assert!(matches!(Manifest::parse(b"  \n\t"), Err(ManifestError::Empty)));
    }

    #[test]
    fn rejects_unknown_fields() {
        let yaml = format!("{SCRIPT_MANIFEST}sprocket: true\n");
        assert!(matches!(
            Manifest::parse(yaml.as_bytes()),
            Err(ManifestError::Parse(_))
        ));
    }

    #[test]
    fn validation_is_deterministic() {
        let a = Manifest::parse(SCRIPT_MANIFEST.as_bytes());
        let b = Manifest::parse(SCRIPT_MANIFEST.as_bytes());
        assert_eq!(a.unwrap(), b.unwrap());
    }

    // ─── Name grammar ────────────────────────────────────────────────────

    fn with_name(name: &str) -> Manifest {
        Manifest {
            name: name.into(),
            ..Manifest::parse(SCRIPT_MANIFEST.as_bytes()).unwrap()
        }
    }

    #[test]
    fn accepts_boundary_names() {
        let max = "a".repeat(64);
        for name in ["a", "a-b", "a1", max.as_str()] {
            assert!(with_name(name).validate().is_ok(), "expected '{name}' to pass");
        }
    }

    #[test]
    fn rejects_bad_names() {
        let too_long = "a".repeat(65);
        for name in [
            "",
            too_long.as_str(),
            "1abc",
            "abc-",
            "a--b",
            "Upper",
            "under_score",
            "-leading",
        ] {
            let err = with_name(name).validate().unwrap_err();
            assert_eq!(field_of(err), "name", "expected '{name}' to fail on name");
        }
    }

    // ─── Versions and constraints ────────────────────────────────────────

    fn with_version(version: &str) -> Manifest {
        Manifest {
            version: version.into(),
            ..Manifest::parse(SCRIPT_MANIFEST.as_bytes()).unwrap()
        }
    }

    #[test]
    fn accepts_strict_semver() {
        for v in ["1.0.0", "1.0.0-alpha", "1.0.0+build.5"] {
            assert!(with_version(v).validate().is_ok(), "expected '{v}' to pass");
        }
    }

    #[test]
    fn rejects_loose_versions() {
        for v in ["v1.0.0", "1", "1.0", "latest", ""] {
            let err = with_version(v).validate().unwrap_err();
            assert_eq!(field_of(err), "version", "expected '{v}' to fail on version");
        }
    }

    #[test]
    fn rejects_bad_engine_constraint() {
        let mut m = Manifest::parse(SCRIPT_MANIFEST.as_bytes()).unwrap();
        m.engine = Some("one point oh".into());
        assert_eq!(field_of(m.validate().unwrap_err()), "engine");
    }

    #[test]
    fn rejects_bad_dependency_constraint() {
        let mut m = Manifest::parse(SCRIPT_MANIFEST.as_bytes()).unwrap();
        m.dependencies.insert("other".into(), "whatever".into());
        assert_eq!(field_of(m.validate().unwrap_err()), "dependencies");
    }

    #[test]
    fn engine_constraint_gates_host_version() {
        let mut m = Manifest::parse(SCRIPT_MANIFEST.as_bytes()).unwrap();
        assert!(m.engine_accepts(&semver::Version::new(0, 1, 0)));
        m.engine = Some(">=1.2".into());
        assert!(m.engine_accepts(&semver::Version::new(1, 3, 0)));
        assert!(!m.engine_accepts(&semver::Version::new(1, 1, 9)));
    }

    // ─── Runtime config agreement ────────────────────────────────────────

    #[test]
    fn script_type_requires_script_config() {
        let mut m = Manifest::parse(SCRIPT_MANIFEST.as_bytes()).unwrap();
        m.script_config = None;
        assert_eq!(field_of(m.validate().unwrap_err()), "script-config");
    }

    #[test]
    fn script_type_rejects_binary_config() {
        let mut m = Manifest::parse(SCRIPT_MANIFEST.as_bytes()).unwrap();
        m.binary_config = Some(BinaryConfig {
            executable: "bin/x".into(),
        });
        assert_eq!(field_of(m.validate().unwrap_err()), "binary-config");
    }

    #[test]
    fn rejects_empty_entry() {
        let mut m = Manifest::parse(SCRIPT_MANIFEST.as_bytes()).unwrap();
        m.script_config = Some(ScriptConfig { entry: String::new() });
        assert_eq!(field_of(m.validate().unwrap_err()), "script-config");
    }

    // ─── Commands ────────────────────────────────────────────────────────

    #[test]
    fn command_help_is_exclusive() {
        let mut m = Manifest::parse(SCRIPT_MANIFEST.as_bytes()).unwrap();
        m.commands.push(CommandSpec {
            name: "wave".into(),
            help_text: Some("Waves.".into()),
            help_file: Some("help/wave.txt".into()),
        });
        assert_eq!(field_of(m.validate().unwrap_err()), "commands");
    }

    #[test]
    fn command_requires_a_name() {
        let mut m = Manifest::parse(SCRIPT_MANIFEST.as_bytes()).unwrap();
        m.commands.push(CommandSpec::default());
        assert_eq!(field_of(m.validate().unwrap_err()), "commands");
    }
}
