//! Tag-invalidated query cache and typed client for a CRM REST API.

pub mod cache;
pub mod config;
pub mod crm;
pub mod logging;

#[cfg(test)]
mod testing;
