pub mod common;
pub mod config;
pub mod download;
pub mod error;
pub mod profile;
pub mod proxy;
pub mod request;
pub mod tunnel;

pub use error::{Error, Result};
