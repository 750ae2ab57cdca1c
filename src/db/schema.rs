// src/db/schema.rs

//! Database schema definitions and migrations for Equo
//!
//! The same schema backs the installed-packages database and every
//! repository database, so the resolver can query both through one
//! contract. A migration system evolves the schema over time.

use crate::error::Result;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

/// Set the schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        debug!("Schema is up to date");
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    info!(
        "Schema migration complete. Now at version {}",
        SCHEMA_VERSION
    );
    Ok(())
}

/// Apply a specific migration version
fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn),
        3 => migrate_v3(conn),
        _ => panic!("Unknown migration version: {}", version),
    }
}

/// Initial schema - Version 1
///
/// Creates the package metadata tables:
/// - packages: One row per package (category, name, version, tag, revision, slot)
/// - package_dependencies: Declared dependencies and conflicts as specifiers
/// - package_needed: Linked libraries (ABI surface)
/// - package_content: Content manifest
/// - package_messages: Messages shown after install
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE packages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            category TEXT NOT NULL,
            name TEXT NOT NULL,
            version TEXT NOT NULL,
            tag TEXT NOT NULL DEFAULT '',
            revision INTEGER NOT NULL DEFAULT 0,
            slot TEXT NOT NULL DEFAULT '0',
            branch TEXT NOT NULL DEFAULT '',
            masked INTEGER NOT NULL DEFAULT 0,
            system_package INTEGER NOT NULL DEFAULT 0,
            download_url TEXT NOT NULL DEFAULT '',
            checksum TEXT NOT NULL DEFAULT '',
            size INTEGER NOT NULL DEFAULT 0,
            trigger_script TEXT,
            origin_repository TEXT,
            installed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX idx_packages_key ON packages(category, name);
        CREATE INDEX idx_packages_name ON packages(name);
        CREATE INDEX idx_packages_slot ON packages(slot);

        -- Dependencies and conflicts, stored as specifiers
        CREATE TABLE package_dependencies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            specifier TEXT NOT NULL,
            dep_key TEXT NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('dependency', 'conflict')),
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_package_dependencies_package ON package_dependencies(package_id);
        CREATE INDEX idx_package_dependencies_key ON package_dependencies(dep_key);

        -- Linked libraries
        CREATE TABLE package_needed (
            package_id INTEGER NOT NULL,
            library TEXT NOT NULL,
            PRIMARY KEY (package_id, library),
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_package_needed_library ON package_needed(library);

        -- Content manifest
        CREATE TABLE package_content (
            package_id INTEGER NOT NULL,
            path TEXT NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('file', 'dir', 'symlink')),
            PRIMARY KEY (package_id, path),
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_package_content_path ON package_content(path);

        CREATE TABLE package_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            package_id INTEGER NOT NULL,
            message TEXT NOT NULL,
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );
        ",
    )?;

    info!("Schema version 1 created successfully");
    Ok(())
}

/// Schema Version 2: Add repository management support
///
/// The registry lives in the system database; repository databases leave
/// it empty.
fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 2");

    conn.execute_batch(
        "
        CREATE TABLE repositories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            url TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            priority INTEGER NOT NULL DEFAULT 0,
            metadata_expire INTEGER NOT NULL DEFAULT 3600,
            last_sync TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX idx_repositories_enabled ON repositories(enabled);
        CREATE INDEX idx_repositories_priority ON repositories(priority);
        ",
    )?;

    info!("Schema version 2 applied successfully");
    Ok(())
}

/// Schema Version 3: Database fingerprint tracking
///
/// `db_state` holds a generation token chosen at creation time and a
/// revision counter bumped by triggers on every package metadata write.
/// Together they identify the database contents for cache invalidation.
fn migrate_v3(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 3");

    let generation = format!(
        "{}-{}",
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        std::process::id()
    );

    conn.execute_batch(
        "
        CREATE TABLE db_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            generation TEXT NOT NULL,
            revision INTEGER NOT NULL DEFAULT 0
        );
        ",
    )?;
    conn.execute(
        "INSERT INTO db_state (id, generation, revision) VALUES (1, ?1, 0)",
        [&generation],
    )?;

    let mut statements = String::new();
    for table in [
        "packages",
        "package_dependencies",
        "package_needed",
        "package_content",
    ] {
        for event in ["INSERT", "UPDATE", "DELETE"] {
            statements.push_str(&format!(
                "CREATE TRIGGER trg_{table}_{event} AFTER {event} ON {table}
                 BEGIN
                     UPDATE db_state SET revision = revision + 1 WHERE id = 1;
                 END;\n",
                table = table,
                event = event.to_lowercase(),
            ));
        }
    }
    conn.execute_batch(&statements)?;

    info!("Schema version 3 applied successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        (temp_file, conn)
    }

    #[test]
    fn test_schema_version_tracking() {
        let (_temp, conn) = create_test_db();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, 0);

        set_schema_version(&conn, 1).unwrap();
        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_migrate_creates_all_tables() {
        let (_temp, conn) = create_test_db();

        migrate(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "packages",
            "package_dependencies",
            "package_needed",
            "package_content",
            "package_messages",
            "repositories",
            "db_state",
            "schema_version",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {}", table);
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let (_temp, conn) = create_test_db();

        migrate(&conn).unwrap();
        let version1 = get_schema_version(&conn).unwrap();

        migrate(&conn).unwrap();
        let version2 = get_schema_version(&conn).unwrap();

        assert_eq!(version1, version2);
        assert_eq!(version1, SCHEMA_VERSION);
    }

    #[test]
    fn test_writes_bump_db_revision() {
        let (_temp, conn) = create_test_db();
        migrate(&conn).unwrap();

        let revision = |conn: &Connection| -> i64 {
            conn.query_row("SELECT revision FROM db_state WHERE id = 1", [], |row| row.get(0))
                .unwrap()
        };

        let before = revision(&conn);
        conn.execute(
            "INSERT INTO packages (category, name, version) VALUES ('app-misc', 'foo', '1.0')",
            [],
        )
        .unwrap();
        let after_insert = revision(&conn);
        assert!(after_insert > before);

        conn.execute("DELETE FROM packages", []).unwrap();
        assert!(revision(&conn) > after_insert);
    }

    #[test]
    fn test_foreign_key_constraints() {
        let (_temp, conn) = create_test_db();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        migrate(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO package_content (package_id, path, kind) VALUES (?1, ?2, ?3)",
            ["999", "/usr/bin/test", "file"],
        );
        assert!(result.is_err());
    }
}
