//! Common utilities and types

pub mod auth;
pub mod error;
pub mod http;
pub mod net;

pub use auth::{Credential, Credentials};
pub use error::{Error, Result};
pub use net::Endpoint;
