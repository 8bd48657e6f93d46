//! Bounding captured command output before it is written to a log.
//!
//! Jobs can print without limit (a runaway `find /`, a chatty backup). The
//! head of the output usually says what started and the tail says how it
//! ended, so the middle is what gets dropped.

/// Decode raw process output and clip it to `max_chars` characters.
pub fn capture_text(raw: &[u8], max_chars: usize) -> String {
    clip_middle(&String::from_utf8_lossy(raw), max_chars)
}

/// Clip `text` to at most roughly `max_chars` characters by omitting its middle.
///
/// Text within budget is returned unchanged. Otherwise the first and last
/// `max_chars / 2` characters are kept around a marker:
///
/// ```text
/// <head>
///
/// ... [N chars omitted] ...
///
/// <tail>
/// ```
///
/// Splitting is by `char`, never inside a UTF-8 sequence.
pub fn clip_middle(text: &str, max_chars: usize) -> String {
    // byte length bounds char count from above
    if text.len() <= max_chars {
        return text.to_owned();
    }
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_owned();
    }

    let half = max_chars / 2;
    let head_end = text
        .char_indices()
        .nth(half)
        .map_or(text.len(), |(idx, _)| idx);
    let tail_start = text
        .char_indices()
        .nth(total - half)
        .map_or(text.len(), |(idx, _)| idx);
    let omitted = total - 2 * half;

    format!(
        "{}\n\n... [{omitted} chars omitted] ...\n\n{}",
        &text[..head_end],
        &text[tail_start..]
    )
}
