pub mod entities;
pub mod error;
pub mod fingerprint;
pub mod lifecycle;
pub mod request;
pub mod types;
