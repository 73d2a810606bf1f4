#[macro_use]
extern crate tracing;

pub mod auth;
pub mod blob;
pub mod cache;
pub mod carve;
pub(crate) mod client;
pub mod error;
pub mod inflate;
pub mod introspect;
pub mod manifest;
pub mod models;
pub mod overlay;
pub mod peek;
pub mod reference;
pub mod tar;

pub use client::RegistryClient;

pub type Result<T> = std::result::Result<T, error::Error>;
