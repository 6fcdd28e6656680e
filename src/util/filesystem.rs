/// Turns free-form names into a single path component that is safe to use
/// inside prefix, log and lock file names.
pub trait SanitizePath {
    fn sanitize_path(&self) -> String;
}

impl SanitizePath for str {
    fn sanitize_path(&self) -> String {
        let mut out = String::with_capacity(self.len());
        let mut pending_sep = false;
        for c in self.trim().chars() {
            if c.is_whitespace() || c == '/' || c == '\\' || c == '\0' {
                pending_sep = true;
                continue;
            }
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c);
        }
        // "." and ".." would escape the parent directory
        out.trim_start_matches('.').to_string()
    }
}

impl SanitizePath for String {
    fn sanitize_path(&self) -> String {
        self.as_str().sanitize_path()
    }
}
