// ABOUTME: Language registry for the closed set of supported sandbox languages
// ABOUTME: Loads language profiles from config/languages.json once and serves constant-time lookups

use crate::error::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Global language registry, loaded from JSON at first use
pub static REGISTRY: LazyLock<LanguageRegistry> = LazyLock::new(|| {
    LanguageRegistry::new().unwrap_or_else(|e| {
        panic!(
            "FATAL: Failed to load language configuration. \
             Check config/languages.json: {}",
            e
        )
    })
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "python")]
    Python,
    #[serde(rename = "go")]
    Go,
    #[serde(rename = "nodejs")]
    NodeJs,
}

impl Language {
    /// Stable presentation order, used for enumerated-choice schemas
    pub const ALL: [Language; 3] = [Language::Python, Language::Go, Language::NodeJs];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Go => "go",
            Self::NodeJs => "nodejs",
        }
    }

    /// Wire ids of every supported language in presentation order
    pub fn ids() -> Vec<&'static str> {
        Self::ALL.iter().map(Language::as_str).collect()
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|lang| lang.as_str() == s)
            .ok_or_else(|| SandboxError::UnsupportedLanguage(s.to_string()))
    }
}

/// How inline code reaches the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InlineStyle {
    /// Code is passed as one argv element after `eval_flag`
    Argument,
    /// Code must be written to a source file and run by path
    File,
}

/// Shape of the manifest synthesized for inline dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestFormat {
    /// One package per line (requirements.txt)
    Lines,
    /// Minimal package.json with a dependencies object
    PackageJson,
    /// Minimal go.mod module declaration
    GoMod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSpec {
    pub file: String,
    pub install: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineSpec {
    pub style: InlineStyle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_flag: Option<String>,
    pub source_file: String,
    pub manifest_file: String,
    pub manifest_format: ManifestFormat,
    #[serde(default)]
    pub always_stage_manifest: bool,
    /// Install template; `{manifest}` expands to `manifest_file`
    pub install: String,
}

impl InlineSpec {
    pub fn install_command(&self) -> String {
        self.install.replace("{manifest}", &self.manifest_file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageProfile {
    pub id: Language,
    pub display_name: String,
    pub image: String,
    pub manifests: Vec<ManifestSpec>,
    pub run_command: Vec<String>,
    pub source_extensions: Vec<String>,
    #[serde(default)]
    pub extension_flags: HashMap<String, Vec<String>>,
    pub inline: InlineSpec,
}

impl LanguageProfile {
    /// Manifest filenames in probe order
    pub fn manifest_files(&self) -> impl Iterator<Item = &str> {
        self.manifests.iter().map(|m| m.file.as_str())
    }

    /// Install incantation for a specific manifest filename
    pub fn install_for(&self, manifest_file: &str) -> Option<&str> {
        self.manifests
            .iter()
            .find(|m| m.file == manifest_file)
            .map(|m| m.install.as_str())
    }

    /// Extra runtime flags for a source file extension (including the dot)
    pub fn flags_for_extension(&self, ext: &str) -> &[String] {
        self.extension_flags
            .get(ext)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_extension_flags(&self) -> bool {
        !self.extension_flags.is_empty()
    }

    pub fn accepts_extension(&self, ext: &str) -> bool {
        self.source_extensions.iter().any(|e| e == ext)
    }
}

#[derive(Debug, Deserialize)]
struct LanguagesConfig {
    #[allow(dead_code)]
    version: String,
    languages: Vec<LanguageProfile>,
}

#[derive(Debug)]
pub struct LanguageRegistry {
    profiles: HashMap<Language, LanguageProfile>,
}

impl LanguageRegistry {
    /// Create a new registry by loading the embedded language catalogue
    pub fn new() -> Result<Self> {
        let config_json = include_str!("../config/languages.json");
        Self::from_json(config_json)
    }

    pub(crate) fn from_json(json: &str) -> Result<Self> {
        let config: LanguagesConfig = serde_json::from_str(json)?;

        let profiles: HashMap<Language, LanguageProfile> = config
            .languages
            .into_iter()
            .map(|profile| (profile.id, profile))
            .collect();

        // Every member of the closed set must be configured
        for lang in Language::ALL {
            let profile = profiles.get(&lang).ok_or_else(|| {
                SandboxError::InvalidArgument(format!("no profile configured for {}", lang))
            })?;
            if profile.inline.style == InlineStyle::Argument && profile.inline.eval_flag.is_none()
            {
                return Err(SandboxError::InvalidArgument(format!(
                    "profile {} uses argument style without an eval flag",
                    lang
                )));
            }
            if profile.run_command.is_empty() {
                return Err(SandboxError::InvalidArgument(format!(
                    "profile {} has an empty run command",
                    lang
                )));
            }
        }

        Ok(Self { profiles })
    }

    /// Get the profile for a language
    pub fn profile(&self, language: Language) -> Result<&LanguageProfile> {
        self.profiles
            .get(&language)
            .ok_or_else(|| SandboxError::UnsupportedLanguage(language.to_string()))
    }

    /// Get a profile by wire id
    pub fn lookup(&self, language_id: &str) -> Result<&LanguageProfile> {
        self.profile(language_id.parse()?)
    }

    /// List profiles in presentation order
    pub fn list(&self) -> Vec<&LanguageProfile> {
        Language::ALL
            .iter()
            .filter_map(|lang| self.profiles.get(lang))
            .collect()
    }
}
