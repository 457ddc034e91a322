#![forbid(unsafe_code)]

pub mod auth;
pub mod error;
pub mod health;
pub mod registry;
pub mod rpc;
pub mod service;
pub mod session;
pub mod store;

#[cfg(test)]
mod registry_tests;

#[cfg(test)]
mod rpc_tests;
