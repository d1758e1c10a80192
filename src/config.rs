use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

pub const DEFAULT_PROFILE: &str = "default";

const ACTIVE_PROFILE_FILE: &str = "active_profile.txt";
const PROFILES_DIR: &str = "profiles";
const PROFILE_EXT: &str = "toml";

/// Environment variables that override profile values, in application order.
const ENV_OVERRIDES: &[(&str, Field)] = &[
    ("API_BASE_URL", Field::ApiBaseUrl),
    ("API_MODEL", Field::Model),
    ("API_MAX_TOKENS", Field::MaxTokens),
    ("API_TEMPERATURE", Field::Temperature),
    ("SYSTEM_PROMPT", Field::SystemPrompt),
];

/// Credential variables, first match wins.
const API_KEY_VARS: &[&str] = &["OPENAI_API_KEY", "API_KEY"];

/// Effective configuration for one API call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    pub api_base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub stream: bool,
    pub system_prompt: String,
    /// Resolved from the environment on every load; never written to a profile.
    #[serde(skip)]
    pub api_key: String,
}

// Defaults
fn default_api_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_max_tokens() -> u32 {
    1000
}
fn default_temperature() -> f64 {
    0.7
}
fn default_system_prompt() -> String {
    "You are a helpful assistant.".into()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            stream: true,
            system_prompt: default_system_prompt(),
            api_key: String::new(),
        }
    }
}

impl Settings {
    /// Parse `value` for `field` and store it. Rejects values of the wrong type.
    pub fn set(&mut self, field: Field, value: &str) -> Result<()> {
        match field {
            Field::ApiBaseUrl => self.api_base_url = value.trim().to_string(),
            Field::Model => self.model = value.trim().to_string(),
            Field::MaxTokens => self.max_tokens = parse_u32(field, value)?,
            Field::Temperature => self.temperature = parse_f64(field, value)?,
            Field::Stream => self.stream = parse_bool(field, value)?,
            Field::SystemPrompt => self.system_prompt = value.to_string(),
        }
        Ok(())
    }

    pub fn get(&self, field: Field) -> String {
        match field {
            Field::ApiBaseUrl => self.api_base_url.clone(),
            Field::Model => self.model.clone(),
            Field::MaxTokens => self.max_tokens.to_string(),
            Field::Temperature => self.temperature.to_string(),
            Field::Stream => self.stream.to_string(),
            Field::SystemPrompt => self.system_prompt.clone(),
        }
    }

    /// Every persisted field as `(name, value)`, sorted by name. Excludes the API key.
    pub fn rows(&self) -> Vec<(&'static str, String)> {
        let mut rows: Vec<_> = Field::ALL
            .iter()
            .map(|f| (f.as_str(), self.get(*f)))
            .collect();
        rows.sort_by_key(|(name, _)| *name);
        rows
    }

    fn apply_profile(&mut self, profile: ProfileFile) {
        if let Some(v) = profile.api_base_url {
            self.api_base_url = v;
        }
        if let Some(v) = profile.model {
            self.model = v;
        }
        if let Some(v) = profile.max_tokens {
            self.max_tokens = v;
        }
        if let Some(v) = profile.temperature {
            self.temperature = v;
        }
        if let Some(v) = profile.stream {
            self.stream = v;
        }
        if let Some(v) = profile.system_prompt {
            self.system_prompt = v;
        }
    }

    fn apply_env(&mut self, env: &EnvSource) -> Result<()> {
        for (var, field) in ENV_OVERRIDES {
            if let Some(value) = env.get(var) {
                self.set(*field, &value).map_err(|e| match e {
                    Error::Config(msg) => Error::config(format!("{var}: {msg}")),
                    other => other,
                })?;
            }
        }
        Ok(())
    }
}

/// Partial overlay read from a profile file. Absent keys keep the default.
#[derive(Debug, Default, Deserialize)]
struct ProfileFile {
    api_base_url: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f64>,
    stream: Option<bool>,
    system_prompt: Option<String>,
}

/// The closed set of settings that can be edited at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    ApiBaseUrl,
    Model,
    MaxTokens,
    Temperature,
    Stream,
    SystemPrompt,
}

impl Field {
    pub const ALL: [Field; 6] = [
        Field::ApiBaseUrl,
        Field::Model,
        Field::MaxTokens,
        Field::Temperature,
        Field::Stream,
        Field::SystemPrompt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiBaseUrl => "api_base_url",
            Self::Model => "model",
            Self::MaxTokens => "max_tokens",
            Self::Temperature => "temperature",
            Self::Stream => "stream",
            Self::SystemPrompt => "system_prompt",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Field {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim();
        Field::ALL
            .into_iter()
            .find(|f| f.as_str() == name)
            .ok_or_else(|| {
                let known: Vec<&str> = Field::ALL.iter().map(|f| f.as_str()).collect();
                Error::config(format!(
                    "unknown setting '{name}' (expected one of: {})",
                    known.join(", ")
                ))
            })
    }
}

fn parse_u32(field: Field, value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{field} must be an integer, got '{value}'")))
}

fn parse_f64(field: Field, value: &str) -> Result<f64> {
    let parsed: f64 = value
        .trim()
        .parse()
        .map_err(|_| Error::config(format!("{field} must be a number, got '{value}'")))?;
    if !parsed.is_finite() {
        return Err(Error::config(format!("{field} must be finite, got '{value}'")));
    }
    Ok(parsed)
}

fn parse_bool(field: Field, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "y" | "1" | "on" => Ok(true),
        "false" | "no" | "n" | "0" | "off" => Ok(false),
        _ => Err(Error::config(format!(
            "{field} must be true or false, got '{value}'"
        ))),
    }
}

/// Split a `key=value` assignment into a typed field and its raw value.
pub fn parse_assignment(s: &str) -> Result<(Field, String)> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| Error::config(format!("expected key=value, got '{s}'")))?;
    let field: Field = key.parse()?;
    Ok((field, value.trim().to_string()))
}

/// Runtime overrides: the highest-priority layer, never persisted by resolution.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    entries: Vec<(Field, String)>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `key=value` strings, type-checking each value up front.
    pub fn from_assignments<I, S>(assignments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = Self::new();
        for a in assignments {
            let (field, value) = parse_assignment(a.as_ref())?;
            overrides.set(field, value)?;
        }
        Ok(overrides)
    }

    /// Add or replace the override for `field`.
    pub fn set(&mut self, field: Field, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        Settings::default().set(field, &value)?;
        self.remove(field);
        self.entries.push((field, value));
        Ok(())
    }

    pub fn remove(&mut self, field: Field) {
        self.entries.retain(|(f, _)| *f != field);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn apply(&self, settings: &mut Settings) -> Result<()> {
        for (field, value) in &self.entries {
            settings.set(*field, value)?;
        }
        Ok(())
    }
}

/// Where environment overrides come from.
#[derive(Debug, Clone, Default)]
pub enum EnvSource {
    /// Read the process environment on every lookup.
    #[default]
    Process,
    Fixed(HashMap<String, String>),
}

impl EnvSource {
    /// Look up `key`, treating empty values as unset.
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match self {
            Self::Process => std::env::var(key).ok(),
            Self::Fixed(vars) => vars.get(key).cloned(),
        };
        value.filter(|v| !v.is_empty())
    }

    fn api_key(&self) -> String {
        API_KEY_VARS
            .iter()
            .find_map(|var| self.get(var))
            .unwrap_or_default()
    }
}

/// Profile-backed configuration resolver.
///
/// Holds no cached settings: every call re-reads the profile directory, so
/// the only side effect of resolution is creating a missing profile file.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    dir: PathBuf,
    env: EnvSource,
}

/// Per-user config directory: `$MINI_CHAT_CONFIG_DIR`, else `~/.config/mini-chat`.
pub fn default_config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("MINI_CHAT_CONFIG_DIR").filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(".config").join("mini-chat")
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_env(dir, EnvSource::Process)
    }

    pub fn with_env(dir: impl Into<PathBuf>, env: EnvSource) -> Self {
        Self {
            dir: dir.into(),
            env,
        }
    }

    pub fn from_env() -> Self {
        Self::new(default_config_dir())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn profile_path(&self, name: &str) -> Result<PathBuf> {
        validate_profile_name(name)?;
        Ok(self
            .dir
            .join(PROFILES_DIR)
            .join(format!("{name}.{PROFILE_EXT}")))
    }

    pub fn profile_exists(&self, name: &str) -> bool {
        self.profile_path(name).is_ok_and(|p| p.is_file())
    }

    /// Name of the active profile. A missing or blank pointer means `default`.
    pub fn active_profile(&self) -> String {
        std::fs::read_to_string(self.dir.join(ACTIVE_PROFILE_FILE))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_PROFILE.into())
    }

    /// Point the active profile at `name`. The profile need not exist yet.
    pub fn set_active(&self, name: &str) -> Result<()> {
        validate_profile_name(name)?;
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.dir.join(ACTIVE_PROFILE_FILE), name)?;
        debug!(profile = name, "active profile set");
        Ok(())
    }

    /// Profiles with a backing file, plus `default`, sorted.
    pub fn list_profiles(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let dir = self.dir.join(PROFILES_DIR);
        if dir.is_dir() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(PROFILE_EXT) {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        if !names.iter().any(|n| n == DEFAULT_PROFILE) {
            names.push(DEFAULT_PROFILE.into());
        }
        names.sort();
        Ok(names)
    }

    pub fn resolve_active(&self) -> Result<Settings> {
        self.resolve(&self.active_profile())
    }

    /// Defaults, then the profile file, then the environment.
    pub fn resolve(&self, name: &str) -> Result<Settings> {
        self.resolve_with(name, &Overrides::default())
    }

    /// [`resolve`](Self::resolve) plus the runtime override layer on top.
    pub fn resolve_with(&self, name: &str, overrides: &Overrides) -> Result<Settings> {
        let mut settings = self.load_layer(name)?;
        settings.apply_env(&self.env)?;
        overrides.apply(&mut settings)?;
        settings.api_key = self.env.api_key();
        Ok(settings)
    }

    /// Overwrite the profile file with every field except the API key.
    pub fn persist(&self, settings: &Settings, name: &str) -> Result<()> {
        let path = self.profile_path(name)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(settings)
            .map_err(|e| Error::config(format!("Failed to serialize profile {name}: {e}")))?;
        std::fs::write(&path, content)?;
        debug!(profile = name, path = %path.display(), "profile saved");
        Ok(())
    }

    /// Read-modify-write a single field of a profile.
    ///
    /// Only the profile layer is written. The returned settings carry the
    /// new value even when an environment variable covers the same field.
    pub fn update_field(&self, field: Field, value: &str, name: &str) -> Result<Settings> {
        let mut layer = self.load_layer(name)?;
        layer.set(field, value)?;
        self.persist(&layer, name)?;
        debug!(profile = name, %field, "profile field updated");
        let mut settings = self.resolve(name)?;
        settings.set(field, value)?;
        Ok(settings)
    }

    /// Copy `source` to `target`. Fails if `source` was never created.
    pub fn clone_profile(&self, source: &str, target: &str) -> Result<Settings> {
        if source != DEFAULT_PROFILE && !self.profile_exists(source) {
            return Err(Error::ProfileNotFound(source.into()));
        }
        let layer = self.load_layer(source)?;
        self.persist(&layer, target)?;
        self.resolve(target)
    }

    /// Remove a profile. `default` is protected and never removed.
    pub fn delete(&self, name: &str) -> Result<bool> {
        if name == DEFAULT_PROFILE {
            warn!("Cannot delete the default profile");
            return Ok(false);
        }
        let path = self.profile_path(name)?;
        if !path.is_file() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        debug!(profile = name, "profile deleted");
        if self.active_profile() == name {
            self.set_active(DEFAULT_PROFILE)?;
        }
        Ok(true)
    }

    /// Overwrite a profile with the compiled defaults.
    pub fn reset(&self, name: &str) -> Result<Settings> {
        self.persist(&Settings::default(), name)?;
        self.resolve(name)
    }

    /// Defaults overlaid with the profile file, creating the file if missing.
    fn load_layer(&self, name: &str) -> Result<Settings> {
        let path = self.profile_path(name)?;
        let mut settings = Settings::default();

        if !path.exists() {
            debug!(profile = name, "profile does not exist, creating with defaults");
            self.persist(&settings, name)?;
            return Ok(settings);
        }

        let overlay = std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|content| {
                toml::from_str::<ProfileFile>(&content).map_err(|e| e.to_string())
            })
            .unwrap_or_else(|e| {
                warn!(profile = name, "Failed to load profile, using defaults: {e}");
                ProfileFile::default()
            });
        settings.apply_profile(overlay);
        Ok(settings)
    }
}

fn validate_profile_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control);
    if invalid {
        return Err(Error::config(format!("invalid profile name '{name}'")));
    }
    Ok(())
}
