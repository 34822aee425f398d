pub mod client;
pub mod config;
pub mod models;
pub mod token;

pub use client::{Marketplace, WbClient, WbError};
pub use token::{ApiToken, TokenScope};
