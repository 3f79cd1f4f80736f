//! CRM backend: endpoint table, typed models, HTTP transport.

mod api;
mod endpoints;
mod http;
pub mod types;

pub use api::CrmApi;
pub use endpoints::{registry, tag_types, DocumentKind};
pub use http::HttpTransport;
