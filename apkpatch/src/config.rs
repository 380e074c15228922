//! The configuration surface injected into a template during export.

use crate::error::{Error, Result};
use crate::target::Target;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Everything an export rewrites into the template archive.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportConfig {
    /// Application identifier, e.g. `org.example.game`.
    pub package_name: String,
    pub version_code: u32,
    pub version_name: String,
    /// Display name written into the resource table. Defaults to the last
    /// segment of the package name.
    #[serde(default)]
    pub app_name: Option<String>,
    /// Locale-specific display names, keyed by locale tag with `_`
    /// separators (`fr`, `pt_BR`).
    #[serde(default)]
    pub app_name_locales: BTreeMap<String, String>,
    #[serde(default)]
    pub orientation: Orientation,
    #[serde(default)]
    pub screens: ScreenSupport,
    #[serde(default)]
    pub allow_backup: bool,
    /// Fully qualified permission names to ensure are declared.
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub features: Vec<FeatureConfig>,
    #[serde(default = "Target::default_enabled")]
    pub architectures: Vec<Target>,
    /// Arguments handed to the application at launch through the
    /// marshalled blob stored in the archive.
    #[serde(default)]
    pub launch_args: Vec<String>,
    /// Replacement payloads for existing template entries (splash and
    /// launcher images), keyed by exact archive path.
    #[serde(default)]
    pub overrides: BTreeMap<String, PathBuf>,
    /// Entries to add on top of the template, keyed by archive path.
    #[serde(default)]
    pub add_files: BTreeMap<String, PathBuf>,
}

impl ExportConfig {
    pub fn validate(&self) -> Result<()> {
        validate_package_name(&self.package_name)?;
        if self.version_code == 0 {
            return Err(Error::config("version code must be a positive integer"));
        }
        if self.architectures.is_empty() {
            return Err(Error::config("at least one architecture must be enabled"));
        }
        let mut seen = self.architectures.clone();
        seen.sort();
        seen.dedup();
        if seen.len() != self.architectures.len() {
            return Err(Error::config("duplicate architecture in configuration"));
        }
        Ok(())
    }

    pub fn app_name(&self) -> &str {
        match &self.app_name {
            Some(name) if !name.is_empty() => name,
            _ => self
                .package_name
                .rsplit('.')
                .next()
                .unwrap_or(&self.package_name),
        }
    }
}

/// A device feature declaration to inject into the manifest.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureConfig {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub version: Option<u32>,
}

/// The four screen-size classes advertised by `supports-screens`.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ScreenSupport {
    #[serde(default = "default_true")]
    pub small: bool,
    #[serde(default = "default_true")]
    pub normal: bool,
    #[serde(default = "default_true")]
    pub large: bool,
    #[serde(default = "default_true")]
    pub xlarge: bool,
}

impl Default for ScreenSupport {
    fn default() -> Self {
        Self {
            small: true,
            normal: true,
            large: true,
            xlarge: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Screen orientations with their `android:screenOrientation` values.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    #[default]
    Landscape,
    Portrait,
    ReverseLandscape,
    ReversePortrait,
    SensorLandscape,
    SensorPortrait,
    Sensor,
}

impl Orientation {
    pub fn android_value(self) -> u32 {
        match self {
            Self::Landscape => 0,
            Self::Portrait => 1,
            Self::ReverseLandscape => 8,
            Self::ReversePortrait => 9,
            Self::SensorLandscape => 11,
            Self::SensorPortrait => 12,
            Self::Sensor => 13,
        }
    }
}

/// Keystore parameters for the external signing tool.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SigningConfig {
    pub keystore: PathBuf,
    pub key_alias: String,
    pub password: String,
}

pub fn validate_package_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::config("package name is missing"));
    }
    let mut segments = 0;
    let mut first = true;
    for c in name.chars() {
        if first && c == '.' {
            return Err(Error::config("package segments must be of non-zero length"));
        }
        if c == '.' {
            segments += 1;
            first = true;
            continue;
        }
        if !(c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::config(format!(
                "the character `{c}` is not allowed in package names"
            )));
        }
        if first && c.is_ascii_digit() {
            return Err(Error::config(
                "a digit cannot be the first character in a package segment",
            ));
        }
        if first && c == '_' {
            return Err(Error::config(
                "`_` cannot be the first character in a package segment",
            ));
        }
        first = false;
    }
    if segments == 0 {
        return Err(Error::config(
            "the package must have at least one `.` separator",
        ));
    }
    if first {
        return Err(Error::config("package segments must be of non-zero length"));
    }
    Ok(())
}

/// Marshals the launch arguments into the blob the template application
/// reads at startup: a little-endian entry count followed by one
/// length-prefixed UTF-8 string per argument. No arguments produce an
/// empty blob.
pub fn encode_launch_args(args: &[String]) -> Vec<u8> {
    let args: Vec<&str> = args
        .iter()
        .map(|a| a.trim())
        .filter(|a| !a.is_empty())
        .collect();
    if args.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    out.extend_from_slice(&(args.len() as u32).to_le_bytes());
    for arg in args {
        out.extend_from_slice(&(arg.len() as u32).to_le_bytes());
        out.extend_from_slice(arg.as_bytes());
    }
    out
}
