//! Output truncation for captured process streams.

/// Truncate `output` to at most `max_chars` bytes of content, keeping the
/// beginning and appending a marker.
///
/// If the output is within the limit, it is returned unchanged. The cut point
/// is moved back to the nearest UTF-8 character boundary so multi-byte
/// characters are never split.
pub fn truncate_output(output: &str, max_chars: usize) -> String {
    if output.len() <= max_chars {
        return output.to_string();
    }

    let mut end = max_chars;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{}\n[WARNING: Output truncated. {} characters removed from end]",
        &output[..end],
        output.len() - end
    )
}
