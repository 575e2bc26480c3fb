// crates/server/src/routes/mod.rs
//! API route modules, assembled under `/api` by `create_app`.

pub mod health;
pub mod search;
pub mod sessions;
pub mod workspaces;
