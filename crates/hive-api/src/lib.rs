pub mod admin;
pub mod app;
pub mod auth;
pub mod error;
pub mod handlers;
pub mod proto;
pub mod state;

pub use app::{admin_app, public_app};
pub use state::AppState;
