//! Shaping of raw terminal output before it is handed back to a caller.

pub const DEFAULT_OUTPUT_LINE_LIMIT: usize = 500;
pub const DEFAULT_OUTPUT_CHARACTER_LIMIT: usize = 50_000;

/// Compresses raw terminal output.
///
/// Progress-bar redraws (`\r` and backspace sequences) are collapsed first
/// when `compress_progress_bar` is set, then runs of identical lines are
/// run-length encoded, then the result is cut down to `line_limit` lines and
/// `character_limit` characters (falling back to
/// [`DEFAULT_OUTPUT_CHARACTER_LIMIT`]).
pub fn compress_output(
    input: &str,
    line_limit: usize,
    character_limit: Option<usize>,
    compress_progress_bar: bool,
) -> String {
    let character_limit = character_limit.unwrap_or(DEFAULT_OUTPUT_CHARACTER_LIMIT);
    let mut text = if compress_progress_bar {
        process_backspaces(&process_carriage_returns(input))
    } else {
        input.to_string()
    };
    text = apply_run_length_encoding(&text);
    truncate_output(&text, Some(line_limit), Some(character_limit))
}

/// Keeps only the text after the last bare `\r` of each line, the way a
/// terminal would display an overwritten progress line.
pub fn process_carriage_returns(input: &str) -> String {
    if !input.contains('\r') {
        return input.to_string();
    }
    let normalized = input.replace("\r\n", "\n");
    normalized
        .split('\n')
        .map(|line| match line.rfind('\r') {
            Some(index) => &line[index + 1..],
            None => line,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Applies backspace characters by deleting the preceding character.
pub fn process_backspaces(input: &str) -> String {
    if !input.contains('\u{8}') {
        return input.to_string();
    }
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        if c == '\u{8}' {
            result.pop();
        } else {
            result.push(c);
        }
    }
    result
}

/// Collapses consecutive identical lines into the first occurrence plus a
/// marker stating how many repeats were dropped.
pub fn apply_run_length_encoding(input: &str) -> String {
    let lines: Vec<&str> = input.split('\n').collect();
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let mut repeats = 0;
        while i + repeats + 1 < lines.len() && lines[i + repeats + 1] == line {
            repeats += 1;
        }
        out.push(line.to_string());
        // A single repeat costs less than the marker line.
        if repeats > 1 && !line.is_empty() {
            out.push(format!("<previous line repeated {} additional times>", repeats));
        } else {
            for _ in 0..repeats {
                out.push(line.to_string());
            }
        }
        i += repeats + 1;
    }
    out.join("\n")
}

/// Truncates to a character budget first, then to a line budget. Both keep
/// the first 20% and the last 80% of the budget around an omission marker.
pub fn truncate_output(input: &str, line_limit: Option<usize>, character_limit: Option<usize>) -> String {
    if let Some(limit) = character_limit {
        let total_chars = input.chars().count();
        if limit > 0 && total_chars > limit {
            let before = limit / 5;
            let after = limit - before;
            let head: String = input.chars().take(before).collect();
            let tail: String = input.chars().skip(total_chars - after).collect();
            return format!(
                "{}\n[...{} characters omitted...]\n{}",
                head,
                total_chars - limit,
                tail
            );
        }
    }

    let Some(limit) = line_limit else {
        return input.to_string();
    };
    let lines: Vec<&str> = input.split('\n').collect();
    if limit == 0 || lines.len() <= limit {
        return input.to_string();
    }
    let before = limit / 5;
    let after = limit - before;
    let head = lines[..before].join("\n");
    let tail = lines[lines.len() - after..].join("\n");
    format!(
        "{}\n[...{} lines omitted...]\n\n{}",
        head,
        lines.len() - limit,
        tail
    )
}
