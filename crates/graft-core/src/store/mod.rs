//! Contracts for the underlying store driver.
//!
//! The driver itself lives outside this workspace; everything here talks to
//! it through [`Connection`] and [`Transaction`].

mod value;

pub use value::{
    escape_string, format_datetime, parse_datetime, unescape_string, Row, Value, DATETIME_FORMAT,
};

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Result;

/// Kind of a store transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    Read,
    Write,
    Schema,
}

impl TransactionKind {
    /// Transaction kind a statement must run in: schema statements need a
    /// schema transaction, everything else runs as a write.
    pub fn for_statement(statement: &str) -> Self {
        let first = statement
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('#'))
            .and_then(|l| l.split_whitespace().next())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match first.as_str() {
            "define" | "undefine" | "redefine" => TransactionKind::Schema,
            _ => TransactionKind::Write,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Read => write!(f, "read"),
            TransactionKind::Write => write!(f, "write"),
            TransactionKind::Schema => write!(f, "schema"),
        }
    }
}

/// An open store transaction.
pub trait Transaction: Send {
    /// Execute one statement and return its rows.
    fn query<'a>(&'a mut self, statement: &'a str) -> BoxFuture<'a, Result<Vec<Row>>>;

    fn commit(&mut self) -> BoxFuture<'_, Result<()>>;

    fn rollback(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Release the transaction. Safe to call more than once.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// A connection to the store.
pub trait Connection: Send + Sync + 'static {
    fn transaction<'a>(
        &'a self,
        database: &'a str,
        kind: TransactionKind,
    ) -> BoxFuture<'a, Result<Box<dyn Transaction>>>;

    /// Schema of a database as TypeQL `define` text.
    fn schema<'a>(&'a self, database: &'a str) -> BoxFuture<'a, Result<String>>;

    fn create_database<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>>;

    fn delete_database<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>>;

    fn contains_database<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>>;

    fn all_databases(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    fn close(&self);

    /// Liveness check used by the pool before handing a connection out.
    fn is_open(&self) -> bool;
}

macro_rules! forward_connection {
    ($wrapper:ty) => {
        impl<C: Connection + ?Sized> Connection for $wrapper {
            fn transaction<'a>(
                &'a self,
                database: &'a str,
                kind: TransactionKind,
            ) -> BoxFuture<'a, Result<Box<dyn Transaction>>> {
                (**self).transaction(database, kind)
            }

            fn schema<'a>(&'a self, database: &'a str) -> BoxFuture<'a, Result<String>> {
                (**self).schema(database)
            }

            fn create_database<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
                (**self).create_database(name)
            }

            fn delete_database<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
                (**self).delete_database(name)
            }

            fn contains_database<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>> {
                (**self).contains_database(name)
            }

            fn all_databases(&self) -> BoxFuture<'_, Result<Vec<String>>> {
                (**self).all_databases()
            }

            fn close(&self) {
                (**self).close()
            }

            fn is_open(&self) -> bool {
                (**self).is_open()
            }
        }
    };
}

forward_connection!(Box<C>);
forward_connection!(Arc<C>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_routing() {
        assert_eq!(
            TransactionKind::for_statement("define attribute a, value string;"),
            TransactionKind::Schema
        );
        assert_eq!(
            TransactionKind::for_statement("  UNDEFINE person;"),
            TransactionKind::Schema
        );
        assert_eq!(
            TransactionKind::for_statement("# comment\nredefine person owns a;"),
            TransactionKind::Schema
        );
        assert_eq!(
            TransactionKind::for_statement("insert $p isa person;"),
            TransactionKind::Write
        );
        assert_eq!(
            TransactionKind::for_statement("match $p isa person; delete $p;"),
            TransactionKind::Write
        );
        assert_eq!(TransactionKind::for_statement(""), TransactionKind::Write);
    }
}
