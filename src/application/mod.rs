//! Application services: submission, status resolution, gallery views and the worker.

pub mod clock;
pub mod context;
pub mod error;
pub mod gallery;
pub mod identity;
pub mod jobs;
pub mod ledger;
pub mod ports;
pub mod render;
pub mod repos;
pub mod status;
pub mod submit;
