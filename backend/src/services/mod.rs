pub mod audit_sink;
pub mod authz_engine;
pub mod policy_service;
pub mod token_service;
pub mod user_service;
