//! # Job Client
//!
//! A small client for running ephemeral, isolated workloads as Kubernetes
//! `batch/v1` Jobs. It speaks the API server's REST interface directly and
//! covers exactly the lifecycle a one-shot code execution needs:
//!
//! - create a Job from a [`JobManifest`] with CPU/memory requests and limits
//! - poll its [`JobStatus`]
//! - read the combined log stream of the pod it spawned
//! - delete the Job together with its pods
//!
//! ## Example
//!
//! ```rust,no_run
//! use job_client::{ClusterConfig, JobClient, JobManifest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClusterConfig::new("https://127.0.0.1:6443", "default")
//!         .with_token("service-account-token");
//!     let client = JobClient::new(config)?;
//!
//!     let manifest = JobManifest::new("python:3.12-alpine", vec![
//!         "python".to_string(),
//!         "-c".to_string(),
//!         "print(1 + 1)".to_string(),
//!     ]);
//!     let name = client.create_job(&manifest).await?;
//!
//!     let status = client.job_status(&name).await?;
//!     println!("{}: active={} succeeded={}", name, status.active, status.succeeded);
//!
//!     client.delete_job(&name).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Authentication
//!
//! Inside a cluster, [`ClusterConfig::in_cluster`] reads the mounted service
//! account token and CA bundle. Outside a cluster the API URL, bearer token and
//! CA certificate are supplied explicitly.

mod client;
mod config;
mod error;
mod types;

pub use client::JobClient;
pub use config::ClusterConfig;
pub use error::Error;
pub use types::*;

/// Result type for job client operations
pub type Result<T> = std::result::Result<T, Error>;
