/// Normalize a user-supplied Odoo base URL: add an `http://` scheme when the
/// operator configured a bare host:port, same as an unscoped URL typed into
/// a browser's address bar would be.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}
