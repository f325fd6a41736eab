//! Best-effort content types from file extensions.

use std::path::Path;

/// Get the content type for a file based on its extension.
///
/// Text types carry `charset=utf-8`; anything unknown is
/// `application/octet-stream`.
pub fn content_type(path: &Path) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if mime.type_() == mime_guess::mime::TEXT && mime.get_param("charset").is_none() {
        format!("{}; charset=utf-8", mime.essence_str())
    } else {
        mime.to_string()
    }
}
