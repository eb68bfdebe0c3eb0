//! Data models shared across the session layer

mod user;

pub use user::*;
