//! HTTP surface of the order management service.
//!
//! `main.rs` is intentionally thin; route handlers live in `routes.rs`,
//! shared state in `state.rs`, response shapes in `api_types.rs`, and the
//! in-memory quote store in `quotes.rs`.

pub mod api_types;
pub mod quotes;
pub mod routes;
pub mod state;
