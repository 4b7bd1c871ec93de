use crate::error::BridgeError;
use crate::libsql::{Connection, Migration, merge_migrations, run_migrations};

/// Build an in-memory database with the given migration sets applied, for
/// repository unit tests.
pub async fn setup_in_memory_database(
    migrations: Vec<Vec<Migration>>,
) -> Result<(libsql::Database, Connection), BridgeError> {
    let db = libsql::Builder::new_local(":memory:")
        .build()
        .await
        .map_err(BridgeError::from)?;
    let conn = Connection(db.connect()?);

    // Enable foreign key constraints
    conn.execute("PRAGMA foreign_keys = ON", ()).await?;

    let merged = merge_migrations(migrations)?;
    run_migrations(&conn, merged).await?;

    Ok((db, conn))
}
