use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PromptPattern {
    pub name: String,
    pub pattern: Regex,
    pub description: String,
    pub confidence: f32,
}

/// User-supplied prompt pattern before compilation.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomPromptPattern {
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_custom_confidence")]
    pub confidence: f32,
}

fn default_custom_confidence() -> f32 {
    0.9
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptMatch {
    pub name: String,
    pub confidence: f32,
}

// Most specific first.
const BUILTIN_PATTERNS: &[(&str, &str, &str, f32)] = &[
    (
        "standard",
        r"^[\w.-]+@[\w.-]+:[^\n]*[$#]\s*$",
        "user@host:path$ prompt",
        0.95,
    ),
    ("powershell", r"^PS [^\n>]*>\s*$", "PowerShell prompt", 0.9),
    (
        "bracketed",
        r"^\[[^\]\n]+\]\s*[$#%>]\s*$",
        "[user@host dir]$ prompt",
        0.85,
    ),
    ("arrow", r"^.*[➜❯]\s*[^\n]*$", "zsh/starship arrow prompt", 0.7),
    ("generic", r"[>$#]\s*$", "line ending in >, $ or #", 0.5),
];

/// Heuristic prompt detection for terminals without execution events.
#[derive(Debug, Clone)]
pub struct PromptDetector {
    patterns: Vec<PromptPattern>,
}

impl Default for PromptDetector {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl PromptDetector {
    /// Custom patterns are checked before the built-ins. A custom pattern that
    /// fails to compile is skipped.
    pub fn new(custom: Vec<CustomPromptPattern>) -> Self {
        let mut patterns = Vec::with_capacity(custom.len() + BUILTIN_PATTERNS.len());
        for c in custom {
            match Regex::new(&c.pattern) {
                Ok(pattern) => patterns.push(PromptPattern {
                    name: c.name,
                    pattern,
                    description: c.description,
                    confidence: c.confidence,
                }),
                Err(e) => {
                    warn!(name = %c.name, pattern = %c.pattern, error = %e, "Skipping invalid custom prompt pattern")
                }
            }
        }
        for (name, pattern, description, confidence) in BUILTIN_PATTERNS {
            match Regex::new(pattern) {
                Ok(pattern) => patterns.push(PromptPattern {
                    name: name.to_string(),
                    pattern,
                    description: description.to_string(),
                    confidence: *confidence,
                }),
                Err(e) => warn!(name = %name, error = %e, "Built-in prompt pattern failed to compile"),
            }
        }
        Self { patterns }
    }

    /// Builds custom patterns from bare regex strings, named `custom_<n>`.
    pub fn from_pattern_strings(raw: &[String]) -> Self {
        let custom = raw
            .iter()
            .enumerate()
            .map(|(index, pattern)| CustomPromptPattern {
                name: format!("custom_{}", index + 1),
                pattern: pattern.clone(),
                description: "configured prompt pattern".to_string(),
                confidence: default_custom_confidence(),
            })
            .collect();
        Self::new(custom)
    }

    pub fn patterns(&self) -> &[PromptPattern] {
        &self.patterns
    }

    /// Tests the last non-empty line of `output`.
    pub fn detect(&self, output: &str) -> Option<PromptMatch> {
        let last_line = output
            .lines()
            .rev()
            .map(|line| line.trim_end_matches('\r'))
            .find(|line| !line.trim().is_empty())?;

        self.patterns
            .iter()
            .find(|p| p.pattern.is_match(last_line))
            .map(|p| PromptMatch {
                name: p.name.clone(),
                confidence: p.confidence,
            })
    }

    /// Polls `poll` every `interval` until a prompt shows up or `timeout`
    /// elapses.
    pub async fn wait_for_prompt<F>(&self, mut poll: F, timeout: Duration, interval: Duration) -> bool
    where
        F: FnMut() -> String,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(found) = self.detect(&poll()) {
                debug!(pattern = %found.name, confidence = found.confidence, "Prompt detected");
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn standard_prompt_beats_generic() {
        let detector = PromptDetector::default();
        let found = detector.detect("build ok\nalice@devbox:~/proj$ ").unwrap();
        assert_eq!(found.name, "standard");
        assert!(found.confidence > 0.9);
    }

    #[test]
    fn generic_prompt_matches_last_resort() {
        let detector = PromptDetector::default();
        let found = detector.detect("output\n> ").unwrap();
        assert_eq!(found.name, "generic");
    }

    #[test]
    fn powershell_prompt_is_recognized() {
        let detector = PromptDetector::default();
        assert_eq!(detector.detect("PS C:\\Users\\dev> ").unwrap().name, "powershell");
    }

    #[test]
    fn plain_output_is_not_a_prompt() {
        let detector = PromptDetector::default();
        assert_eq!(detector.detect("compiling crate\nstill working"), None);
        assert_eq!(detector.detect(""), None);
    }

    #[test]
    fn custom_patterns_take_priority() {
        let detector = PromptDetector::new(vec![CustomPromptPattern {
            name: "mine".to_string(),
            pattern: r"ready>\s*$".to_string(),
            description: String::new(),
            confidence: 0.99,
        }]);
        assert_eq!(detector.detect("ready> ").unwrap().name, "mine");
    }

    #[test]
    fn invalid_custom_pattern_is_skipped() {
        let detector = PromptDetector::new(vec![CustomPromptPattern {
            name: "broken".to_string(),
            pattern: "(unclosed".to_string(),
            description: String::new(),
            confidence: 0.99,
        }]);
        assert_eq!(detector.patterns().len(), BUILTIN_PATTERNS.len());
        assert_eq!(detector.detect("$ ").unwrap().name, "generic");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_prompt_sees_late_prompt() {
        let detector = PromptDetector::default();
        let buffer = Arc::new(Mutex::new(String::from("running...")));
        let writer = buffer.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(350)).await;
            writer.lock().unwrap().push_str("\nuser@host:~$ ");
        });
        let reader = buffer.clone();
        let seen = detector
            .wait_for_prompt(
                move || reader.lock().unwrap().clone(),
                Duration::from_secs(2),
                Duration::from_millis(100),
            )
            .await;
        assert!(seen);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_prompt_times_out() {
        let detector = PromptDetector::default();
        let seen = detector
            .wait_for_prompt(
                || "still compiling".to_string(),
                Duration::from_millis(500),
                Duration::from_millis(100),
            )
            .await;
        assert!(!seen);
    }
}
