// kiln-net/src/lib.rs
pub mod http;
pub mod validation;

pub use http::{build_http_client, write_stream, HttpFetcher, SourceFetcher};
pub use validation::{archive_file_name, validate_url};
