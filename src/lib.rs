/*!
 * @file lib.rs
 * @brief docpipe library entry point
 *
 * An embeddable, MongoDB-compatible document aggregation pipeline engine.
 * Callers supply documents and a `[{ "$stage": ... }, ...]` pipeline;
 * storage, filter-matching, and query planning are external concerns
 * reached only through the `collection` module's traits.
 */

pub mod accumulator;
pub mod bson_order;
pub mod collection;
pub mod config;
pub mod datetime;
pub mod driver;
pub mod error;
pub mod expr;
pub mod logger;
pub mod operators;
pub mod partition;
pub mod sorter;
pub mod stages;
pub mod value;
pub mod window;

pub use collection::{CollectionHandle, CollectionProvider, FilterMatcher};
pub use config::EngineConfig;
pub use driver::{aggregate, Cursor, ExecutionContext};
pub use error::{DocPipeError, Result};
pub use logger::{init_logger, init_tracing_logger, LogLevel};
pub use stages::{Pipeline, Stage};
