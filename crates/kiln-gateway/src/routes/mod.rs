//! Request handlers, one module per resource.

pub mod chat;
pub mod health;
pub mod media;
pub mod models;
pub mod tasks;
