mod helpers;
mod middleware;
mod token;

pub use helpers::{TokenValidationError, extract_bearer_token, validate_token};
pub use middleware::{AuthError, RequireAdmin, RequireUser};
pub use token::{TokenGenerator, parse_token};
