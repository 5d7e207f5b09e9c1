/// Split an album title into an event name and year.
///
/// The event name runs up to and including the first `20xx` year in the
/// title. Titles without one map to the trimmed title and year 0.
pub fn parse_group_label(title: &str) -> (String, i32) {
    let bytes = title.as_bytes();
    for start in 0..bytes.len().saturating_sub(3) {
        let window = &bytes[start..start + 4];
        if window[0] == b'2' && window[1] == b'0' && window[2..].iter().all(u8::is_ascii_digit) {
            // ASCII digits, so both ends fall on char boundaries
            let year = title[start..start + 4].parse().unwrap_or(0);
            return (title[..start + 4].trim().to_string(), year);
        }
    }
    (title.trim().to_string(), 0)
}

/// Turn an album title into a directory name.
///
/// Alphanumerics (any script), `-`, `_` and spaces survive; the result is
/// trimmed, spaces become underscores and letters are lowercased.
pub fn sanitize_dirname(title: &str) -> String {
    let kept: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | ' '))
        .collect();
    kept.trim().replace(' ', "_").to_lowercase()
}
