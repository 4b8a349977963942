//! Shared test utilities for Concierge crates
//!
//! This crate provides:
//! - **Mocks**: an in-memory datastore implementing the storage connection traits
//! - **Fixtures**: Pre-built guests, staff and service requests
//! - **Builders**: a data layer wired to the in-memory datastore
//! - **Assertions**: tenant, ordering, error and pagination checks
//!
//! # Example
//!
//! ```ignore
//! use concierge_tests::{fixtures::Hotel, TestLayerBuilder};
//!
//! #[tokio::test]
//! async fn test_open_requests() {
//!     let test = TestLayerBuilder::new().build().await.unwrap();
//!     Hotel::build("hotel-alpha", 3).seed(&test.store);
//!
//!     let rows = test
//!         .repository::<ServiceRequest>()
//!         .query()
//!         .tenant_scope(TenantScope::tenant("hotel-alpha"))
//!         .execute()
//!         .await
//!         .unwrap();
//!     assertions::assert_tenant_scoped(&rows, "hotel-alpha");
//! }
//! ```

pub mod assertions;
pub mod builders;
pub mod fixtures;
pub mod mocks;

// Re-export commonly used items
pub use builders::{TestLayer, TestLayerBuilder};
pub use fixtures::{guest, service_request, staff, tenant, Hotel};
pub use mocks::{Fault, MemoryDatastore};
