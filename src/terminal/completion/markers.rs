use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionMarkerConfig {
    pub enabled: bool,
    pub start_marker: String,
    pub end_marker: String,
    pub include_exit_code: bool,
    pub include_timestamp: bool,
    pub use_nonce: bool,
}

impl Default for CompletionMarkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            start_marker: "__AGENT_SHELL_START__".to_string(),
            end_marker: "__AGENT_SHELL_END__".to_string(),
            include_exit_code: true,
            include_timestamp: false,
            use_nonce: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarkerExtraction {
    pub content: String,
    pub exit_code: Option<i32>,
}

fn exit_code_regex() -> &'static Regex {
    static EXIT_CODE: OnceLock<Regex> = OnceLock::new();
    EXIT_CODE.get_or_init(|| Regex::new(r"^\s*EXIT_CODE=(-?\d+)").expect("static regex is valid"))
}

/// Wraps commands in start/end markers and recognizes them in output.
///
/// With `use_nonce`, each [`CompletionMarkers::wrap_command`] call rotates the
/// nonce, so markers left in the buffer by an earlier command never match.
#[derive(Debug, Clone)]
pub struct CompletionMarkers {
    config: CompletionMarkerConfig,
    nonce: Option<String>,
}

impl CompletionMarkers {
    pub fn new(config: CompletionMarkerConfig) -> Self {
        Self { config, nonce: None }
    }

    pub fn config(&self) -> &CompletionMarkerConfig {
        &self.config
    }

    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }

    pub fn start_token(&self) -> String {
        self.token(&self.config.start_marker)
    }

    pub fn end_token(&self) -> String {
        self.token(&self.config.end_marker)
    }

    fn token(&self, marker: &str) -> String {
        match (&self.nonce, self.config.use_nonce) {
            (Some(nonce), true) => format!("{}{}", marker, nonce),
            _ => marker.to_string(),
        }
    }

    /// Builds the POSIX shell line that prints the start marker, runs
    /// `command`, then prints the end marker with its exit status.
    pub fn wrap_command(&mut self, command: &str) -> String {
        if !self.config.enabled {
            return command.to_string();
        }
        if self.config.use_nonce {
            self.nonce = Some(Uuid::new_v4().simple().to_string()[..12].to_string());
        }

        let start_token = self.start_token();
        let end_token = self.end_token();
        let (start_head, start_tail) = split_token(&start_token);
        let (end_head, end_tail) = split_token(&end_token);

        let mut end_format = String::from("%s%s");
        let mut end_args = format!("'{}' '{}'", end_head, end_tail);
        if self.config.include_exit_code {
            end_format.push_str(" EXIT_CODE=%s");
            end_args.push_str(" \"$__agent_shell_ec\"");
        }
        if self.config.include_timestamp {
            end_format.push_str(" TIMESTAMP=%s");
            end_args.push_str(" \"$(date +%s)\"");
        }

        // Tokens are printed in two halves so the echoed command line never
        // contains a complete marker.
        format!(
            "printf '%s%s\\n' '{}' '{}'; {}\n__agent_shell_ec=$?; printf '{}\\n' {}",
            start_head, start_tail, command, end_format, end_args
        )
    }

    pub fn has_start_marker(&self, output: &str) -> bool {
        output.contains(&self.start_token())
    }

    pub fn has_end_marker(&self, output: &str) -> bool {
        output.contains(&self.end_token())
    }

    /// Returns the text between the current invocation's markers, or `None`
    /// when either marker is missing or they appear out of order.
    pub fn extract_content_between_markers(&self, output: &str) -> Option<MarkerExtraction> {
        let start_token = self.start_token();
        let end_token = self.end_token();
        let start = output.find(&start_token)?;
        let end = output.find(&end_token)?;
        if start >= end {
            return None;
        }
        let content_start = start + start_token.len();
        if content_start > end {
            return None;
        }
        let content = output[content_start..end].trim().to_string();

        let trailer = &output[end + end_token.len()..];
        let exit_code = exit_code_regex()
            .captures(trailer)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<i32>().ok());

        Some(MarkerExtraction { content, exit_code })
    }
}

fn split_token(token: &str) -> (&str, &str) {
    let mut mid = token.len() / 2;
    while !token.is_char_boundary(mid) {
        mid -= 1;
    }
    token.split_at(mid)
}
