//! Destination config loader.
//!
//! Reads the destinations YAML file once at startup and validates every entry
//! before the proxy binds its listener. The resulting [`DestinationTable`] is
//! immutable for the lifetime of the process.

use crate::error::{CoreError, Result};
use serde::Deserialize;
use std::{collections::HashMap, fmt, path::Path, str::FromStr, sync::Arc};

/// Default cap on the number of characters handed to the AI classifier.
pub const DEFAULT_AI_MAX_CHARS: usize = 4000;

/// Shell metacharacters that are never allowed in a stdio command line.
/// Commands are tokenized with word splitting only; a shell is never invoked.
const FORBIDDEN_COMMAND_CHARS: [char; 11] =
    [';', '&', '|', '$', '<', '>', '(', ')', '`', '\n', '\r'];

/// Transport flavor of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    /// Upstream SSE server (GET event stream + POST message endpoint pair).
    Sse,
    /// Upstream Streamable HTTP server (single endpoint keyed by session header).
    StreamableHttp,
    /// Locally spawned subprocess speaking newline-delimited JSON-RPC.
    Stdio,
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DestinationKind::Sse => "sse",
            DestinationKind::StreamableHttp => "streamable_http",
            DestinationKind::Stdio => "stdio",
        };
        f.write_str(s)
    }
}

/// Enforcement mode for a detection engine.
///
/// Variant order defines severity for strictest-mode-wins arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum DetectionMode {
    #[default]
    Off,
    Monitor,
    Redact,
    Block,
}

impl FromStr for DetectionMode {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "off" => Ok(DetectionMode::Off),
            "monitor" => Ok(DetectionMode::Monitor),
            "redact" => Ok(DetectionMode::Redact),
            "block" => Ok(DetectionMode::Block),
            _ => Err(()),
        }
    }
}

impl fmt::Display for DetectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DetectionMode::Off => "off",
            DetectionMode::Monitor => "monitor",
            DetectionMode::Redact => "redact",
            DetectionMode::Block => "block",
        };
        f.write_str(s)
    }
}

/// Per-destination detection engine configuration.
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub regex_mode: DetectionMode,
    pub ai_mode: DetectionMode,
    /// Per-destination threshold override; the global default applies when unset.
    pub ai_threshold: Option<f64>,
    /// Bodies longer than this skip the AI pass entirely.
    pub ai_max_chars: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            regex_mode: DetectionMode::Off,
            ai_mode: DetectionMode::Off,
            ai_threshold: None,
            ai_max_chars: DEFAULT_AI_MAX_CHARS,
        }
    }
}

/// One validated destination entry. Immutable after load.
#[derive(Debug, Clone)]
pub struct DestinationConfig {
    pub name: String,
    pub kind: DestinationKind,
    /// Upstream base URL. Present for `sse` and `streamable_http` kinds.
    pub url: Option<String>,
    /// Subprocess command line. Present for the `stdio` kind.
    pub command: Option<String>,
    /// Non-secret environment entries for the subprocess.
    pub env: HashMap<String, String>,
    pub detection: DetectionConfig,
    /// Expose the legacy `/sse` + `/message` pair for a stdio destination.
    pub legacy_sse: bool,
}

impl DestinationConfig {
    /// Convenience constructor for an SSE destination with default detection.
    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Sse,
            url: Some(url.into()),
            command: None,
            env: HashMap::new(),
            detection: DetectionConfig::default(),
            legacy_sse: false,
        }
    }

    /// Convenience constructor for a stdio destination with default detection.
    pub fn stdio(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Stdio,
            url: None,
            command: Some(command.into()),
            env: HashMap::new(),
            detection: DetectionConfig::default(),
            legacy_sse: false,
        }
    }

    /// Convenience constructor for a Streamable HTTP destination.
    pub fn streamable_http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::StreamableHttp,
            ..Self::sse(name, url)
        }
    }
}

/// Raw YAML shape before validation. An entry may also be a bare string URL,
/// shorthand for an `sse` destination.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Url(String),
    Full(RawDestination),
}

#[derive(Debug, Default, Deserialize)]
struct RawDestination {
    #[serde(rename = "type")]
    kind: Option<String>,
    url: Option<String>,
    command: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    regex_mode: Option<String>,
    ai_mode: Option<String>,
    ai_threshold: Option<f64>,
    ai_max_chars: Option<usize>,
    #[serde(default)]
    legacy_sse: bool,
}

#[derive(Debug, Deserialize)]
struct RawConfigFile {
    #[serde(default)]
    destinations: Option<HashMap<String, RawEntry>>,
}

/// Immutable table of validated destinations.
#[derive(Debug, Default)]
pub struct DestinationTable {
    destinations: HashMap<String, Arc<DestinationConfig>>,
}

impl DestinationTable {
    /// Load and validate the destinations file. Every error is fatal: the
    /// proxy must not come up with a partially valid destination set.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CoreError::Config(format!(
                "Destinations config not found: {}. Create it or set the \
                 DESTINATIONS_CONFIG env var.",
                path.display()
            )));
        }

        let text = std::fs::read_to_string(path)?;
        if text.trim().is_empty() {
            // Empty file is valid: no destinations configured yet.
            return Ok(Self::default());
        }

        let raw: RawConfigFile = serde_yaml::from_str(&text)?;
        let Some(entries) = raw.destinations else {
            return Ok(Self::default());
        };

        let mut destinations = HashMap::with_capacity(entries.len());
        for (name, entry) in entries {
            let dest = validate_entry(&name, entry)?;
            destinations.insert(name, Arc::new(dest));
        }
        Ok(Self { destinations })
    }

    /// Build a table directly from validated entries. Used by tests and by
    /// callers that assemble configuration programmatically.
    pub fn from_destinations(destinations: impl IntoIterator<Item = DestinationConfig>) -> Self {
        Self {
            destinations: destinations
                .into_iter()
                .map(|d| (d.name.clone(), Arc::new(d)))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<DestinationConfig>> {
        self.destinations.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.destinations.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    /// All stdio-kind destinations, for fail-fast command validation.
    pub fn stdio_destinations(&self) -> impl Iterator<Item = &Arc<DestinationConfig>> {
        self.destinations
            .values()
            .filter(|d| d.kind == DestinationKind::Stdio)
    }
}

fn parse_mode(name: &str, field: &str, value: Option<&str>) -> Result<DetectionMode> {
    match value {
        None => Ok(DetectionMode::Off),
        Some(v) => v.parse().map_err(|_| {
            CoreError::Config(format!(
                "destination '{name}': invalid {field} '{v}' (expected off, monitor, redact, or block)"
            ))
        }),
    }
}

fn validate_entry(name: &str, entry: RawEntry) -> Result<DestinationConfig> {
    let raw = match entry {
        RawEntry::Url(url) => RawDestination {
            url: Some(url),
            ..RawDestination::default()
        },
        RawEntry::Full(raw) => raw,
    };

    let kind = match raw.kind.as_deref() {
        None | Some("sse") => DestinationKind::Sse,
        Some("streamable_http") => DestinationKind::StreamableHttp,
        Some("stdio") => DestinationKind::Stdio,
        Some(other) => {
            return Err(CoreError::Config(format!(
                "destination '{name}': unknown type '{other}' (expected sse, streamable_http, or stdio)"
            )));
        }
    };

    let detection = DetectionConfig {
        regex_mode: parse_mode(name, "regex_mode", raw.regex_mode.as_deref())?,
        ai_mode: parse_mode(name, "ai_mode", raw.ai_mode.as_deref())?,
        ai_threshold: raw.ai_threshold,
        ai_max_chars: raw.ai_max_chars.unwrap_or(DEFAULT_AI_MAX_CHARS),
    };

    let (url, command) = match kind {
        DestinationKind::Sse | DestinationKind::StreamableHttp => {
            let url = raw
                .url
                .as_deref()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .ok_or_else(|| {
                    CoreError::Config(format!(
                        "destination '{name}': type '{kind}' requires a non-empty 'url'"
                    ))
                })?;
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(CoreError::Config(format!(
                    "destination '{name}': url must use http or https"
                )));
            }
            (Some(url.trim_end_matches('/').to_string()), None)
        }
        DestinationKind::Stdio => {
            let command = raw
                .command
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .ok_or_else(|| {
                    CoreError::Config(format!(
                        "stdio destination '{name}' has no command configured"
                    ))
                })?;
            if let Some(bad) = command.chars().find(|c| FORBIDDEN_COMMAND_CHARS.contains(c)) {
                return Err(CoreError::Config(format!(
                    "destination '{name}': command contains forbidden shell metacharacter {bad:?}"
                )));
            }
            if shlex::split(command).filter(|argv| !argv.is_empty()).is_none() {
                return Err(CoreError::Config(format!(
                    "destination '{name}': command cannot be parsed"
                )));
            }
            (None, Some(command.to_string()))
        }
    };

    Ok(DestinationConfig {
        name: name.to_string(),
        kind,
        url,
        command,
        env: raw.env,
        detection,
        legacy_sse: raw.legacy_sse,
    })
}
