pub mod authn;
pub mod authz;
pub mod gateway;
pub mod policies;
pub mod sessions;
pub mod users;
