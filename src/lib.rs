pub mod auth;
pub mod billing;
pub mod cache;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod routes;

pub use routes::{api_routes, router, AppState};
