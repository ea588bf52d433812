//! # rolesync Testkit
//!
//! Testing utilities for rolesync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Test host**: an in-memory host applying actions, answering state and
//!   audit queries, and scripting key rotation, stale encryption keys,
//!   relocation and rejections
//! - **Recording collaborators**: a notes service and a signing context
//!   that remember what they were asked to do
//! - **Golden vectors**: exact wire bytes for fixed input
//! - **Generators**: Proptest strategies for property-based testing
//!
//! ## Test Host
//!
//! ```rust
//! use rolesync_testkit::fixtures::{identifier, Harness, TestHost};
//!
//! # async fn example() {
//! let host = TestHost::new(identifier("alice@example.net"));
//! let harness = Harness::new();
//! harness.add_host(&host).await;
//! let exchange = harness.exchange();
//! # }
//! ```
//!
//! ## Golden Vectors
//!
//! ```rust
//! use rolesync_testkit::vectors::verify_all_vectors;
//!
//! assert!(verify_all_vectors().is_empty());
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{Call, Harness, RecordingService, RecordingSigning, TestHost};
pub use vectors::{all_vectors, verify_all_vectors, GoldenVector};
