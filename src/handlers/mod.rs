//! HTTP handlers for the frontend's room endpoints.

pub mod rooms;

pub use rooms::*;
