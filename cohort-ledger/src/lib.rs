pub mod api;
pub mod config;
pub mod dataset;
pub mod db;
pub mod errors;
pub mod keystore;
pub mod models;
pub mod query;
pub mod state;
pub mod synthetic;

#[cfg(test)]
pub(crate) mod testing;
