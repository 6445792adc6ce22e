pub mod auth;
pub mod rate_limit;
pub mod request_context;
