//! Escape-time fractal rendering behind a fingerprint-deduplicated job ledger.
//!
//! Requests are canonicalised into a [`domain::fingerprint::Fingerprint`], recorded once in the
//! job ledger, and rendered asynchronously by workers pulling from an at-least-once work queue.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
