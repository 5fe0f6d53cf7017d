//! Credential gate shared by the SSE endpoints and the admin API.

pub mod jwt;

pub use jwt::{AuthedUser, JwtGate};
