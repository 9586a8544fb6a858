//! HTTP surface exposing the manager's ranked proxy list.

pub mod handlers;
pub mod models;
pub mod server;

pub use server::ApiServer;
