pub mod auth;
pub mod response;

pub use auth::tenant_auth_middleware;
pub use response::{ApiResponse, ApiResult};
