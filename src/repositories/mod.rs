//! # Repository Layer
//!
//! SeaORM access to tenants and integrations with tenant-aware lookups.

pub mod integration;
pub mod tenant;

pub use integration::IntegrationRepository;
pub use tenant::TenantRepository;
