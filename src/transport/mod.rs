//! Transport layer for the SQL query gateway.
//!
//! - `routes`: router, handlers and the client address extractor
//! - `http`: listener, graceful shutdown and pool teardown

pub mod http;
pub mod routes;

pub use http::HttpTransport;
pub use routes::{AppState, ClientAddr, DIRECT_PATH, POOLED_PATH, build_router};
