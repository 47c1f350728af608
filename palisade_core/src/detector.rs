//! Prompt-injection detection.
//!
//! Two engines scan each proxied body:
//!
//! *   **Regex**: deterministic patterns loaded from flat files in a patterns
//!     directory, hot-reloadable via [`PatternStore::reload`].
//! *   **AI**: an opaque [`Classifier`] capability scored against a
//!     threshold. Inference runs on the blocking pool behind a semaphore so
//!     the event loop is never stalled.
//!
//! Each destination configures both engines independently with the modes
//! `off`, `monitor`, `redact`, `block`; when both engines trigger, the
//! strictest mode wins.

use crate::audit::DetectionFields;
use crate::config::{DetectionConfig, DetectionMode};
use crate::error::Result;
use regex::{Regex, RegexBuilder};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};
use tokio::sync::Semaphore;
use tracing::{info, warn};

/// Substituted for matched content when a `redact` mode fires.
pub const REDACTION_PLACEHOLDER: &str = "**REDACTED**";

/// Default score threshold above which the AI engine triggers.
pub const DEFAULT_AI_THRESHOLD: f64 = 0.85;

/// Action selected for a scanned body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionAction {
    Pass,
    Monitor,
    Redact,
    Block,
}

impl DetectionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionAction::Pass => "pass",
            DetectionAction::Monitor => "monitor",
            DetectionAction::Redact => "redact",
            DetectionAction::Block => "block",
        }
    }

    fn from_mode(mode: DetectionMode) -> Self {
        match mode {
            DetectionMode::Off => DetectionAction::Pass,
            DetectionMode::Monitor => DetectionAction::Monitor,
            DetectionMode::Redact => DetectionAction::Redact,
            DetectionMode::Block => DetectionAction::Block,
        }
    }
}

/// Which engine produced the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionEngine {
    Regex,
    Ai,
}

impl DetectionEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionEngine::Regex => "regex",
            DetectionEngine::Ai => "ai",
        }
    }
}

/// Result of scanning a body through the detection engines.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub action: DetectionAction,
    pub engine: Option<DetectionEngine>,
    /// Matched pattern source or classifier score.
    pub detail: Option<String>,
    /// The (possibly redacted) body to forward.
    pub body: String,
}

impl DetectionResult {
    fn pass(body: &str) -> Self {
        Self {
            action: DetectionAction::Pass,
            engine: None,
            detail: None,
            body: body.to_string(),
        }
    }

    /// Audit-record fields for a non-pass result, `None` otherwise.
    pub fn audit_fields(&self) -> Option<DetectionFields> {
        if self.action == DetectionAction::Pass {
            return None;
        }
        Some(DetectionFields {
            action: self.action.as_str(),
            engine: self.engine.as_ref().map(DetectionEngine::as_str).unwrap_or(""),
            detail: self.detail.clone(),
        })
    }
}

/// Opaque semantic classifier. The real implementation loads a model and runs
/// inference; the proxy core only depends on this capability.
pub trait Classifier: Send + Sync {
    fn classify(&self, text: &str) -> Result<Classification>;
}

/// A single classification outcome. An `INJECTION` label means `score` is the
/// injection confidence; any other label means the injection confidence is
/// `1 - score`.
#[derive(Debug, Clone)]
pub struct Classification {
    pub label: String,
    pub score: f64,
}

/// Replaceable ordered list of compiled case-insensitive regexes, loaded from
/// a directory of line-oriented files and swapped atomically under a lock.
pub struct PatternStore {
    dir: PathBuf,
    patterns: RwLock<Arc<Vec<Regex>>>,
}

impl PatternStore {
    /// Create an empty store bound to a patterns directory. Call
    /// [`reload`](Self::reload) to populate it.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            patterns: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// (Re)load patterns from the directory, replacing the active list
    /// atomically. Returns the number of successfully compiled patterns.
    ///
    /// Files are visited in filename order; only `*.txt` and `*.conf` are
    /// read. Blank lines and `#` comments are skipped. Invalid regexes are
    /// logged and skipped, never fatal. A missing directory logs a warning
    /// and installs an empty list.
    pub fn reload(&self) -> usize {
        let compiled = load_patterns_from(&self.dir);
        let count = compiled.len();
        *self.patterns.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(compiled);
        count
    }

    /// Snapshot of the active pattern list. Matching happens outside the
    /// lock, so a concurrent reload never blocks a scan.
    pub fn snapshot(&self) -> Arc<Vec<Regex>> {
        self.patterns
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn load_patterns_from(dir: &Path) -> Vec<Regex> {
    if !dir.is_dir() {
        warn!(
            dir = %dir.display(),
            "patterns directory does not exist, regex engine has 0 patterns"
        );
        return Vec::new();
    }

    let mut files: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "cannot read patterns directory");
            return Vec::new();
        }
    };
    files.sort();

    let mut compiled = Vec::new();
    for path in files {
        let is_pattern_file = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("txt") | Some("conf")
        );
        if !is_pattern_file {
            continue;
        }
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                warn!(file = %path.display(), error = %err, "cannot read pattern file");
                continue;
            }
        };
        for (lineno, line) in text.lines().enumerate() {
            let stripped = line.trim();
            if stripped.is_empty() || stripped.starts_with('#') {
                continue;
            }
            match RegexBuilder::new(stripped).case_insensitive(true).build() {
                Ok(regex) => compiled.push(regex),
                Err(err) => {
                    warn!(
                        file = %path.display(),
                        line = lineno + 1,
                        pattern = stripped,
                        error = %err,
                        "invalid regex skipped"
                    );
                }
            }
        }
    }

    info!(count = compiled.len(), dir = %dir.display(), "loaded regex patterns");
    compiled
}

/// The two-engine scanner.
pub struct Detector {
    patterns: Arc<PatternStore>,
    classifier: Option<Arc<dyn Classifier>>,
    ai_permits: Arc<Semaphore>,
    default_threshold: f64,
}

/// Construction options for [`Detector`].
pub struct DetectorOptions {
    pub classifier: Option<Arc<dyn Classifier>>,
    /// Global threshold used when a destination has no override.
    pub default_threshold: f64,
    /// Maximum concurrent classifier invocations.
    pub max_workers: usize,
}

impl Default for DetectorOptions {
    fn default() -> Self {
        Self {
            classifier: None,
            default_threshold: DEFAULT_AI_THRESHOLD,
            max_workers: 1,
        }
    }
}

impl Detector {
    pub fn new(patterns: Arc<PatternStore>, options: DetectorOptions) -> Self {
        if options.classifier.is_none() {
            warn!("AI engine unavailable: no classifier configured");
        }
        Self {
            patterns,
            classifier: options.classifier,
            ai_permits: Arc::new(Semaphore::new(options.max_workers.max(1))),
            default_threshold: options.default_threshold,
        }
    }

    pub fn pattern_store(&self) -> &Arc<PatternStore> {
        &self.patterns
    }

    /// Scan `body` through the regex and AI engines per the destination's
    /// detection config. When both engines trigger, the stricter mode wins.
    pub async fn scan(
        &self,
        body: &str,
        config: &DetectionConfig,
        is_response: bool,
    ) -> DetectionResult {
        if body.is_empty() {
            return DetectionResult::pass(body);
        }
        if config.regex_mode == DetectionMode::Off && config.ai_mode == DetectionMode::Off {
            return DetectionResult::pass(body);
        }

        let mut best_mode = DetectionMode::Off;
        let mut best_engine = None;
        let mut best_detail = None;
        let mut result_body = body.to_string();

        if config.regex_mode != DetectionMode::Off {
            let patterns = self.patterns.snapshot();
            // Stop at the first matching pattern.
            if let Some(pattern) = patterns.iter().find(|p| p.is_match(body)) {
                best_mode = config.regex_mode;
                best_engine = Some(DetectionEngine::Regex);
                best_detail = Some(pattern.as_str().to_string());
                if config.regex_mode == DetectionMode::Redact {
                    result_body = pattern.replace_all(body, REDACTION_PLACEHOLDER).into_owned();
                }
            }
        }

        if config.ai_mode != DetectionMode::Off && best_mode != DetectionMode::Block {
            if let Some(classifier) = self.classifier.clone() {
                if body.chars().count() > config.ai_max_chars {
                    warn!(
                        limit = config.ai_max_chars,
                        length = body.chars().count(),
                        is_response,
                        "AI scan skipped: body exceeds ai_max_chars"
                    );
                } else {
                    let score = self.injection_score(classifier, body).await;
                    let threshold = config.ai_threshold.unwrap_or(self.default_threshold);
                    if score >= threshold && config.ai_mode > best_mode {
                        best_mode = config.ai_mode;
                        best_engine = Some(DetectionEngine::Ai);
                        best_detail = Some(format!("score={score:.3}"));
                        if config.ai_mode == DetectionMode::Redact {
                            // Unlike the regex engine, the AI engine has no
                            // match span: the entire body is replaced.
                            result_body = REDACTION_PLACEHOLDER.to_string();
                        }
                    }
                }
            }
        }

        match best_mode {
            DetectionMode::Off => DetectionResult::pass(body),
            DetectionMode::Block => DetectionResult {
                action: DetectionAction::Block,
                engine: best_engine,
                detail: best_detail,
                // Blocked bodies are never forwarded; return them unchanged.
                body: body.to_string(),
            },
            mode => DetectionResult {
                action: DetectionAction::from_mode(mode),
                engine: best_engine,
                detail: best_detail,
                body: result_body,
            },
        }
    }

    /// Offload one classification to the blocking pool. A failing call scores
    /// 0 so a single bad inference never takes the proxy down.
    async fn injection_score(&self, classifier: Arc<dyn Classifier>, body: &str) -> f64 {
        let permit = match self.ai_permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return 0.0,
        };
        let text = body.to_string();
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            match classifier.classify(&text) {
                Ok(result) => {
                    if result.label.to_uppercase().contains("INJECTION") {
                        result.score
                    } else {
                        1.0 - result.score
                    }
                }
                Err(err) => {
                    warn!(error = %err, "AI inference error");
                    0.0
                }
            }
        });
        match handle.await {
            Ok(score) => score,
            Err(err) => {
                warn!(error = %err, "AI inference task failed");
                0.0
            }
        }
    }
}
