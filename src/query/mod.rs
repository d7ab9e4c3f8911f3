//! Query execution
//!
//! [`QueryExecutor`] runs one statement on a checked-out connection and
//! hands back a [`ResultSet`] that pulls rows from the warehouse portal in
//! fixed-size batches until the row cap or the end of the result.

pub mod executor;
pub mod result;

pub use executor::{ExecutorConfig, QueryExecutor, QueryRequest};
pub use result::{QueryOutput, ResultSet};
