use serde::Deserialize;

/// Android ABIs a template may carry shared libraries for.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Target {
    #[serde(rename = "armeabi-v7a")]
    ArmV7a,
    #[serde(rename = "arm64-v8a")]
    Arm64V8a,
    #[serde(rename = "x86")]
    X86,
    #[serde(rename = "x86_64")]
    X86_64,
}

impl Target {
    pub const ALL: [Target; 4] = [Self::ArmV7a, Self::Arm64V8a, Self::X86, Self::X86_64];

    /// Identifier used by the platform to refer to the ABI.
    pub fn android_abi(self) -> &'static str {
        match self {
            Self::ArmV7a => "armeabi-v7a",
            Self::Arm64V8a => "arm64-v8a",
            Self::X86 => "x86",
            Self::X86_64 => "x86_64",
        }
    }

    /// Archive directory prefix holding this ABI's shared libraries.
    pub fn lib_dir(self) -> String {
        format!("lib/{}/", self.android_abi())
    }

    pub fn default_enabled() -> Vec<Target> {
        vec![Self::ArmV7a, Self::Arm64V8a]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lib_dir_prefix() {
        assert_eq!(Target::Arm64V8a.lib_dir(), "lib/arm64-v8a/");
        assert_eq!(Target::X86_64.lib_dir(), "lib/x86_64/");
    }
}
