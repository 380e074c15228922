//! Driver for the external `apksigner` tool. Signing runs strictly after
//! alignment; any later modification of the archive invalidates the
//! signature.

use crate::config::SigningConfig;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Command;

fn tool_name() -> &'static str {
    if cfg!(windows) {
        "apksigner.bat"
    } else {
        "apksigner"
    }
}

pub struct Apksigner {
    path: PathBuf,
}

impl Apksigner {
    /// Locates the tool: an explicit path, then the newest SDK
    /// build-tools release, then the `PATH`.
    pub fn locate(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            if path.is_file() {
                return Ok(Self { path: path.into() });
            }
            return Err(Error::NotFound("apksigner", path.into()));
        }
        if let Some(path) = Self::from_sdk() {
            return Ok(Self { path });
        }
        if let Ok(path) = which::which(tool_name()) {
            return Ok(Self { path });
        }
        Err(Error::NotFound("apksigner", tool_name().into()))
    }

    fn from_sdk() -> Option<PathBuf> {
        let home =
            std::env::var_os("ANDROID_HOME").or_else(|| std::env::var_os("ANDROID_SDK_ROOT"))?;
        let build_tools = Path::new(&home).join("build-tools");
        let mut versions: Vec<PathBuf> = std::fs::read_dir(build_tools)
            .ok()?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        versions.sort();
        versions
            .into_iter()
            .rev()
            .map(|dir| dir.join(tool_name()))
            .find(|tool| tool.is_file())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn run(&self, command: &mut Command) -> Result<()> {
        let output = command.output()?;
        tracing::debug!("{}", String::from_utf8_lossy(&output.stdout));
        if !output.status.success() {
            tracing::error!("{}", String::from_utf8_lossy(&output.stderr));
            return Err(Error::Subprocess {
                tool: "apksigner".into(),
                status: output.status.code().unwrap_or(-1),
            });
        }
        Ok(())
    }

    pub fn sign(&self, apk: &Path, signing: &SigningConfig) -> Result<()> {
        if !signing.keystore.is_file() {
            return Err(Error::NotFound("keystore", signing.keystore.clone()));
        }
        tracing::info!("signing {}", apk.display());
        // The command line carries the keystore password; it must not
        // show up in the logs.
        self.run(
            Command::new(&self.path)
                .arg("sign")
                .arg("--ks")
                .arg(&signing.keystore)
                .arg("--ks-pass")
                .arg(format!("pass:{}", signing.password))
                .arg("--ks-key-alias")
                .arg(&signing.key_alias)
                .arg(apk),
        )
    }

    pub fn verify(&self, apk: &Path) -> Result<()> {
        tracing::info!("verifying {}", apk.display());
        self.run(
            Command::new(&self.path)
                .arg("verify")
                .arg("--verbose")
                .arg(apk),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_must_exist() {
        let missing = Path::new("/nonexistent/apksigner");
        assert!(matches!(
            Apksigner::locate(Some(missing)),
            Err(Error::NotFound("apksigner", _))
        ));
    }
}
