//! Config loading and the `VerifyToken` boundary (C1, §4.1).

pub mod config;
pub mod verify;

pub use config::{Config, CorsOrigins, RateLimitWindow};
pub use verify::{InvalidToken, JwtVerifier, StaticVerifier, VerifyToken};
