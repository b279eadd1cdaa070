//! s3proxy - transparent re-signing reverse proxy for S3-compatible object storage
//!
//! This library provides the core functionality for the s3proxy server.

pub mod config;
pub mod credentials;
pub mod errors;
pub mod http_client;
pub mod proxy;
pub mod sigv4;
