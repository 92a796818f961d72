//! Stream Splunk search exports into a bounded, pull-based row cursor.
//!
//! ```rust,ignore
//! let connection = Arc::new(Connection::connect(ServiceConfig::new("https://localhost:8089")).await?);
//! let request = SearchRequest::new("search index=main error")?
//!     .earliest("-24h")
//!     .fields(["host", "source"]);
//! let mut cursor = SearchQuery::new(connection, request).cursor();
//! while let Some(row) = cursor.next_row().await {
//!     println!("{:?}", row.values());
//! }
//! ```

pub mod auth;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod parser;
pub mod request;
pub mod session;

pub use config::ServiceConfig;
pub use connection::Connection;
pub use error::{Result, SearchError};
pub use parser::{parse_results, ParseSummary, RowSink, Schema};
pub use request::SearchRequest;
pub use session::{QueryCursor, ResultRow, SearchQuery, SearchReport, SessionState};
