//! Palisade: an IAM control plane split across three cooperating services.
//!
//! The library carries everything the `gateway`, `authn-service`, and
//! `authz-service` binaries share: models, stores, the authentication core,
//! the authorization engine, the gateway forwarding core, and middleware.

pub mod config;
pub mod db;
pub mod docs;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod repositories;
pub mod services;
pub mod state;
pub mod types;
pub mod utils;
