#[cfg(any(test, feature = "test-util"))]
pub mod memory_repository;
pub mod models;
pub mod pg_repository;
pub mod repositories;
