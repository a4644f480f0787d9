//! File system utilities

/// Longest folder name produced by [`sanitize_filename`], in characters
pub const MAX_FILENAME_CHARS: usize = 200;

/// Sanitize filename for filesystem
pub fn sanitize_filename(filename: &str) -> String {
    let sanitized: String = filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .take(MAX_FILENAME_CHARS)
        .collect();

    // Windows rejects names ending in a dot or space
    let trimmed = sanitized.trim_end_matches(['.', ' ']);
    match trimmed {
        "" if !sanitized.is_empty() => "_".to_string(),
        "." | ".." => "_".to_string(),
        _ => trimmed.to_string(),
    }
}
