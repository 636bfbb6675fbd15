use crate::error::{Error, Result};

const MAX_PATH_LEN: usize = 1024;
const MAX_SEGMENT_LEN: usize = 255;

/// Normalises a project file path to `dir/sub/file` form.
///
/// Leading and trailing slashes are dropped. Empty, `.` and `..` segments,
/// backslashes and control characters are rejected so that a path can never
/// leave its project directory.
pub fn normalize_object_path(path: &str) -> Result<String> {
    let path = path.trim().trim_matches('/');

    if path.is_empty() {
        return Err(Error::BadRequest("Path cannot be empty".to_string()));
    }

    if path.len() > MAX_PATH_LEN {
        return Err(Error::BadRequest(format!(
            "Path cannot exceed {MAX_PATH_LEN} characters"
        )));
    }

    for segment in path.split('/') {
        validate_segment(segment)?;
    }

    Ok(path.to_string())
}

/// Like [`normalize_object_path`], but an empty prefix selects everything.
pub fn normalize_prefix(prefix: Option<&str>) -> Result<String> {
    match prefix.map(str::trim) {
        None => Ok(String::new()),
        Some(p) if p.trim_matches('/').is_empty() => Ok(String::new()),
        Some(p) => normalize_object_path(p),
    }
}

fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(Error::BadRequest(
            "Path segment cannot be empty".to_string(),
        ));
    }

    if segment == "." || segment == ".." {
        return Err(Error::BadRequest(
            "Path segment cannot be '.' or '..'".to_string(),
        ));
    }

    if segment.len() > MAX_SEGMENT_LEN {
        return Err(Error::BadRequest(format!(
            "Path segment cannot exceed {MAX_SEGMENT_LEN} characters"
        )));
    }

    if segment.chars().any(|c| c == '\\' || c.is_control()) {
        return Err(Error::BadRequest(
            "Path segment contains invalid characters".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_basic() {
        assert_eq!(normalize_object_path("main.rs").unwrap(), "main.rs");
        assert_eq!(normalize_object_path("/src/main.rs").unwrap(), "src/main.rs");
        assert_eq!(normalize_object_path("src/lib/").unwrap(), "src/lib");
    }

    #[test]
    fn test_rejects_traversal() {
        assert!(normalize_object_path("../etc/passwd").is_err());
        assert!(normalize_object_path("src/../../x").is_err());
        assert!(normalize_object_path("./x").is_err());
    }

    #[test]
    fn test_rejects_empty_segments_and_control_chars() {
        assert!(normalize_object_path("").is_err());
        assert!(normalize_object_path("/").is_err());
        assert!(normalize_object_path("src//main.rs").is_err());
        assert!(normalize_object_path("src/ma\0in.rs").is_err());
        assert!(normalize_object_path("src\\main.rs").is_err());
    }

    #[test]
    fn test_rejects_oversized_segments() {
        let long = "a".repeat(256);
        assert!(normalize_object_path(&long).is_err());
        assert!(normalize_object_path(&"a".repeat(255)).is_ok());
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(None).unwrap(), "");
        assert_eq!(normalize_prefix(Some("/")).unwrap(), "");
        assert_eq!(normalize_prefix(Some("src/")).unwrap(), "src");
        assert!(normalize_prefix(Some("../")).is_err());
    }
}
