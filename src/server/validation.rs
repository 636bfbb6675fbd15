use crate::server::response::ApiError;
use crate::types::Role;

const MAX_PROJECT_NAME_LEN: usize = 100;
const MAX_DESCRIPTION_LEN: usize = 1000;

fn is_valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' || c == ' '
}

pub fn validate_project_name(name: &str) -> Result<(), ApiError> {
    if name.trim().is_empty() {
        return Err(ApiError::bad_request("Project name cannot be empty"));
    }
    if name.len() > MAX_PROJECT_NAME_LEN {
        return Err(ApiError::bad_request(format!(
            "Project name cannot exceed {MAX_PROJECT_NAME_LEN} characters"
        )));
    }
    if !name.chars().all(is_valid_name_char) {
        return Err(ApiError::bad_request(
            "Project name can only contain alphanumeric characters, spaces, hyphens, underscores, and periods",
        ));
    }
    if name != name.trim() {
        return Err(ApiError::bad_request(
            "Project name cannot start or end with whitespace",
        ));
    }
    Ok(())
}

pub fn validate_description(description: Option<&str>) -> Result<(), ApiError> {
    match description {
        Some(d) if d.len() > MAX_DESCRIPTION_LEN => Err(ApiError::bad_request(format!(
            "Description cannot exceed {MAX_DESCRIPTION_LEN} characters"
        ))),
        _ => Ok(()),
    }
}

pub fn parse_role(role: &str) -> Result<Role, ApiError> {
    Role::parse(role).ok_or_else(|| ApiError::bad_request(format!("Invalid role: {role}")))
}

/// Minimal shape check; the address is confirmed by the identity provider.
pub fn validate_email(email: &str) -> Result<(), ApiError> {
    let valid = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'))
        && !email.chars().any(char::is_whitespace);
    if !valid {
        return Err(ApiError::bad_request(format!("Invalid email: {email}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_names() {
        assert!(validate_project_name("default").is_ok());
        assert!(validate_project_name("My App v2.1").is_ok());
        assert!(validate_project_name("").is_err());
        assert!(validate_project_name("   ").is_err());
        assert!(validate_project_name(" padded").is_err());
        assert!(validate_project_name("a/b").is_err());
        assert!(validate_project_name(&"x".repeat(101)).is_err());
    }

    #[test]
    fn test_parse_role_is_case_insensitive() {
        assert_eq!(parse_role("mod").unwrap(), Role::Mod);
        assert_eq!(parse_role("ADMIN").unwrap(), Role::Admin);
        assert!(parse_role("owner").is_err());
    }

    #[test]
    fn test_validate_email() {
        assert!(validate_email("ada@example.com").is_ok());
        assert!(validate_email("ada@localhost").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("a da@example.com").is_err());
    }
}
