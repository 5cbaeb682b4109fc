//! Name splitting for the " (n)" collision counter scheme.

/// Splits a file name into the stem used for counting and its extension.
///
/// The extension starts at the last dot ("photo.tar.gz" keeps ".gz"); a name
/// whose only dot is leading (".bashrc") has no extension. An existing
/// counter suffix on the stem ("photo (2)") is dropped so retries increment
/// from the base name.
pub(crate) fn split_name(name: &str) -> (&str, &str) {
    let (stem, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };
    (strip_counter(stem), ext)
}

/// Drops a trailing " (n)" counter from a stem, if present.
fn strip_counter(stem: &str) -> &str {
    if let Some(open) = stem.rfind(" (") {
        let inner = &stem[open + 2..];
        if let Some(digits) = inner.strip_suffix(')') {
            if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
                return &stem[..open];
            }
        }
    }
    stem
}
