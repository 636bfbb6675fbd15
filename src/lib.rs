//! # Workbench
//!
//! Backend for a multi-tenant collaborative IDE: users, workspaces, seats,
//! projects, file storage quotas and the subscription lifecycle.
//!
//! ## Library Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use workbench::config::ServerConfig;
//! use workbench::server::{AppState, create_router};
//! use workbench::store::{SqliteStore, Store};
//!
//! let config = ServerConfig::default();
//! let store = SqliteStore::new(config.db_path()).unwrap();
//! store.initialize().unwrap();
//!
//! let state = Arc::new(AppState::new(Arc::new(store), &config).unwrap());
//! let router = create_router(state);
//! // Serve with axum...
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): builds the `workbench` binary. Disable with `default-features = false`.

pub mod auth;
pub mod billing;
pub mod config;
pub mod error;
pub mod jobs;
pub mod oauth;
pub mod server;
pub mod storage;
pub mod store;
pub mod types;
