pub mod file_store;
pub mod models;
pub mod repositories;
