//! Postgres wire protocol core.
//!
//! This crate implements the frontend half of the PostgreSQL v3 protocol:
//! message framing over a fixed ring buffer, the extended-query
//! Parse/Bind/Describe/Execute/Sync flow, and a batched, pipelined row
//! cursor which streams query results back to the caller.
//!
//! # Examples
//!
//! ```no_run
//! use postrow::Connection;
//!
//! # async fn app() -> postrow::Result<()> {
//! let mut conn = Connection::connect("postgres://postgres@localhost/postgres").await?;
//!
//! let mut rows = conn.query("SELECT generate_series(1,7)", &[]).await?;
//!
//! while rows.next().await {
//!     let (n,) = rows.scan::<(i32,)>()?;
//!     println!("{n}");
//! }
//! rows.close().await;
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod ext;
pub mod net;

// Protocol
pub mod postgres;

// Framing
pub mod ring;
pub mod rmsgs;
mod stream;

// Encoding
pub mod value;
pub mod encode;
pub mod types;

// Component
pub mod statement;
pub mod sql;
pub mod logger;

// Connection
pub mod connection;

// Operation
pub mod query;
pub mod rows;

mod error;

pub use self::connection::{CancelToken, Config, Connection};
pub use self::encode::{Encode, Encoded};
pub use self::error::{Error, ErrorKind, Result};
pub use self::logger::LogLevel;
pub use self::postgres::{FieldDescription, Oid, PgFormat};
pub use self::query::{QueryOptions, Row};
pub use self::rows::{FromRow, Rows};
pub use self::sql::SqlExt;
pub use self::types::{Decode, TypeRegistry, Value};
