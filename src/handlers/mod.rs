// handlers/mod.rs - route handlers
//
// Public: /health
// Protected (tenant credential required): /api/*

pub mod audit;
pub mod health;
pub mod whoami;

pub use audit::violations_get;
pub use health::health_get;
pub use whoami::whoami_get;
