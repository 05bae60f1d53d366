//! Top-level splitting of shell command lines on control operators.
//!
//! Only the operators that chain whole commands are recognized (`&&`, `||`,
//! `;`, `|`). Subshells, here-docs and function definitions are not parsed.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandOperator {
    #[serde(rename = "&&")]
    And,
    #[serde(rename = "||")]
    Or,
    #[serde(rename = ";")]
    Sequence,
    #[serde(rename = "|")]
    Pipe,
}

impl CommandOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandOperator::And => "&&",
            CommandOperator::Or => "||",
            CommandOperator::Sequence => ";",
            CommandOperator::Pipe => "|",
        }
    }
}

impl fmt::Display for CommandOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a segment runs, given the exit code of the segment before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionCondition {
    Always,
    OnSuccess,
    OnFailure,
}

impl ExecutionCondition {
    fn after(preceding: Option<CommandOperator>) -> Self {
        match preceding {
            Some(CommandOperator::And) => ExecutionCondition::OnSuccess,
            Some(CommandOperator::Or) => ExecutionCondition::OnFailure,
            Some(CommandOperator::Sequence) | Some(CommandOperator::Pipe) | None => {
                ExecutionCondition::Always
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSegment {
    pub command: String,
    /// Operator that follows this segment, if any.
    pub operator: Option<CommandOperator>,
    pub condition: ExecutionCondition,
}

impl CommandSegment {
    pub fn should_execute(&self, prev_exit_code: i32) -> bool {
        match self.condition {
            ExecutionCondition::Always => true,
            ExecutionCondition::OnSuccess => prev_exit_code == 0,
            ExecutionCondition::OnFailure => prev_exit_code != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedCommand {
    pub original: String,
    pub is_compound: bool,
    pub segments: Vec<CommandSegment>,
}

/// Splits `command` on unquoted, unescaped control operators.
///
/// Parsing never fails. An unterminated quote swallows the rest of the input,
/// so the whole trimmed command comes back as one non-compound segment.
pub fn parse(command: &str) -> ParsedCommand {
    let chars: Vec<char> = command.chars().collect();
    let mut pieces: Vec<(String, Option<CommandOperator>)> = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if escaped {
            current.push(c);
            escaped = false;
            i += 1;
            continue;
        }

        match c {
            '\\' if !in_single => {
                escaped = true;
                current.push(c);
                i += 1;
                continue;
            }
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
                i += 1;
                continue;
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
                i += 1;
                continue;
            }
            _ => {}
        }

        if in_single || in_double {
            current.push(c);
            i += 1;
            continue;
        }

        let next = chars.get(i + 1).copied();
        let operator = match (c, next) {
            ('&', Some('&')) => Some((CommandOperator::And, 2)),
            ('|', Some('|')) => Some((CommandOperator::Or, 2)),
            (';', _) => Some((CommandOperator::Sequence, 1)),
            ('|', _) => Some((CommandOperator::Pipe, 1)),
            _ => None,
        };

        match operator {
            Some((op, width)) => {
                let text = current.trim();
                if !text.is_empty() {
                    pieces.push((text.to_string(), Some(op)));
                }
                current.clear();
                i += width;
            }
            None => {
                current.push(c);
                i += 1;
            }
        }
    }

    let trimmed = command.trim();
    if in_single || in_double {
        return single_segment(command, trimmed);
    }

    let tail = current.trim();
    if !tail.is_empty() {
        pieces.push((tail.to_string(), None));
    }

    let mut segments = Vec::with_capacity(pieces.len());
    let mut preceding: Option<CommandOperator> = None;
    for (index, (text, operator)) in pieces.into_iter().enumerate() {
        let condition = if index == 0 {
            ExecutionCondition::Always
        } else {
            ExecutionCondition::after(preceding)
        };
        segments.push(CommandSegment {
            command: text,
            operator,
            condition,
        });
        preceding = operator;
    }

    let trailing_operator = segments.last().map_or(false, |s| s.operator.is_some());
    let is_compound = segments.len() > 1 || (segments.len() == 1 && trailing_operator);

    ParsedCommand {
        original: command.to_string(),
        is_compound,
        segments,
    }
}

fn single_segment(original: &str, trimmed: &str) -> ParsedCommand {
    let segments = if trimmed.is_empty() {
        Vec::new()
    } else {
        vec![CommandSegment {
            command: trimmed.to_string(),
            operator: None,
            condition: ExecutionCondition::Always,
        }]
    };
    ParsedCommand {
        original: original.to_string(),
        is_compound: false,
        segments,
    }
}

/// True when `command` contains a bare `&` (background job), i.e. one that is
/// not part of `&&`. Quoting is not considered.
pub fn has_background_operator(command: &str) -> bool {
    count_operators(command).background > 0
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OperatorCounts {
    pub and: usize,
    pub or: usize,
    pub sequence: usize,
    pub pipe: usize,
    pub background: usize,
}

impl OperatorCounts {
    pub fn total(&self) -> usize {
        self.and + self.or + self.sequence + self.pipe + self.background
    }
}

/// Raw occurrence counts over the whole text, quotes included.
pub fn count_operators(command: &str) -> OperatorCounts {
    let bytes = command.as_bytes();
    let mut counts = OperatorCounts::default();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'&' | b'|' => {
                let c = bytes[i];
                let mut run = 1;
                while i + run < bytes.len() && bytes[i + run] == c {
                    run += 1;
                }
                let (pairs, single) = (run / 2, run % 2);
                if c == b'&' {
                    counts.and += pairs;
                    // A lone `&` only counts when it is not glued to another `&`.
                    if run == 1 {
                        counts.background += single;
                    }
                } else {
                    counts.or += pairs;
                    if run == 1 {
                        counts.pipe += single;
                    }
                }
                i += run;
            }
            b';' => {
                counts.sequence += 1;
                i += 1;
            }
            _ => i += 1,
        }
    }
    counts
}

/// Best-effort number of sub-invocations a shell will report for `command`.
///
/// Counts operators textually, so quoted operators and subshells skew the
/// estimate in either direction. Callers pair it with a bounded wait.
pub fn estimate_process_count(command: &str) -> usize {
    1 + count_operators(command).total()
}
