mod server;

pub use server::{CONFIG_FILE_NAME, OAuthClientConfig, ServerConfig};
