//! Remote playlist service: status polling and manifest retrieval.

pub mod client;
pub mod error;
pub mod types;

pub use client::{http_client, ManifestClient};
pub use error::ManifestError;
pub use types::{AdEntry, AssetRef, Manifest};
