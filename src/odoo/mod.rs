pub mod client;
pub mod config;
pub mod types;

pub use client::OdooClient;
pub use types::{OdooError, OdooErrorBody, OdooResult};
