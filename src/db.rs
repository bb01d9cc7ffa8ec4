//! Database plumbing shared by the ledger and cube tables.

use rusqlite::{Connection, Error, Row};

/// An alias for the integer row IDs used by the database.
pub type DatabaseID = i64;

/// A trait for mapping a `rusqlite::Row` from the database to a concrete
/// rust type.
pub trait MapRow {
    /// The type the row is mapped to.
    type ReturnType;

    /// Convert a row into a concrete type.
    ///
    /// **Note:** This function expects that the row object contains all the
    /// table columns in the order they were defined.
    ///
    /// # Errors
    /// Returns an error if a row item cannot be converted into the
    /// corresponding rust type, or if an invalid column index was used.
    fn map_row(row: &Row) -> Result<Self::ReturnType, Error> {
        Self::map_row_with_offset(row, 0)
    }

    /// Convert a row into a concrete type, reading from column `offset`
    /// onwards.
    ///
    /// The offset is useful when tables have been joined and two different
    /// types are constructed from the one query.
    ///
    /// # Errors
    /// Returns an error if a row item cannot be converted into the
    /// corresponding rust type, or if an invalid column index was used.
    fn map_row_with_offset(row: &Row, offset: usize) -> Result<Self::ReturnType, Error>;
}

/// Create the ledger and cube tables if they do not already exist, and turn
/// on foreign key enforcement.
///
/// Safe to call on every start-up.
///
/// # Errors
/// Returns an error if a table could not be created.
pub fn initialize(connection: &Connection) -> Result<(), Error> {
    connection.execute("PRAGMA foreign_keys = ON", ())?;

    crate::ledger::create_ledger_tables(connection)?;
    crate::cube::store::create_cube_table(connection)?;

    Ok(())
}

#[cfg(test)]
mod initialize_tests {
    use rusqlite::Connection;

    use super::initialize;

    #[test]
    fn initialize_succeeds_on_empty_database() {
        let connection = Connection::open_in_memory().unwrap();

        assert!(initialize(&connection).is_ok());
    }

    #[test]
    fn initialize_is_idempotent() {
        let connection = Connection::open_in_memory().unwrap();

        initialize(&connection).unwrap();

        assert!(initialize(&connection).is_ok());
    }
}
