mod admin;
mod auth;
mod billing;
pub mod dto;
pub mod response;
mod router;
mod user;
pub mod validation;

pub use admin::{admin_router, jobs_router};
pub use auth::auth_router;
pub use billing::billing_router;
pub use router::{AppState, create_router};
pub use user::user_router;
