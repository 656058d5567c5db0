//! Versioned schema migrations.
//!
//! The applied version lives in `schema_migrations` as `MAX(version)`.
//! Opening a store runs every pending migration inside a single
//! transaction, so a store is always at exactly one known version.

use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Schema version this build reads and writes.
pub const CURRENT_SCHEMA_VERSION: i64 = 6;

enum Step {
    /// Fixed DDL, executed as-is.
    Sql(&'static str),
    /// Add a column unless `pragma_table_info` already lists it.
    AddColumn {
        table: &'static str,
        column: &'static str,
        decl: &'static str,
    },
}

struct Migration {
    version: i64,
    description: &'static str,
    steps: &'static [Step],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "genesis",
        steps: &[
            Step::Sql(
                r#"
                CREATE TABLE IF NOT EXISTS nodes (
                    id TEXT PRIMARY KEY,
                    type TEXT,
                    title TEXT,
                    domain TEXT,
                    layer TEXT,
                    embedding BLOB
                )
                "#,
            ),
            Step::Sql(
                r#"
                CREATE TABLE IF NOT EXISTS edges (
                    source TEXT NOT NULL,
                    target TEXT NOT NULL,
                    type TEXT NOT NULL,
                    PRIMARY KEY (source, target, type)
                )
                "#,
            ),
            Step::Sql("CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source)"),
            Step::Sql("CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target)"),
        ],
    },
    Migration {
        version: 2,
        description: "content hash",
        steps: &[Step::AddColumn {
            table: "nodes",
            column: "hash",
            decl: "TEXT",
        }],
    },
    Migration {
        version: 3,
        description: "node metadata",
        steps: &[Step::AddColumn {
            table: "nodes",
            column: "meta",
            decl: "TEXT",
        }],
    },
    Migration {
        version: 4,
        description: "edge provenance",
        steps: &[
            Step::AddColumn {
                table: "edges",
                column: "confidence",
                decl: "REAL DEFAULT 1.0",
            },
            Step::AddColumn {
                table: "edges",
                column: "veracity",
                decl: "REAL DEFAULT 1.0",
            },
            Step::AddColumn {
                table: "edges",
                column: "context_source",
                decl: "TEXT",
            },
        ],
    },
    Migration {
        version: 5,
        description: "dates and summaries",
        steps: &[
            Step::AddColumn {
                table: "nodes",
                column: "date",
                decl: "TEXT",
            },
            Step::AddColumn {
                table: "nodes",
                column: "summary",
                decl: "TEXT",
            },
            Step::Sql("CREATE INDEX IF NOT EXISTS idx_nodes_type ON nodes(type)"),
            Step::Sql("CREATE INDEX IF NOT EXISTS idx_nodes_domain ON nodes(domain)"),
        ],
    },
    Migration {
        version: 6,
        description: "store metadata",
        steps: &[Step::Sql(
            r#"
            CREATE TABLE IF NOT EXISTS store_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )],
    },
];

/// Bring the store at `pool` up to [`CURRENT_SCHEMA_VERSION`].
///
/// Up to date is a no-op. A store newer than this build fails with
/// [`Error::SchemaTooNew`]; any failing step rolls back every pending
/// migration and fails with [`Error::SchemaMigration`].
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current = current_version(pool).await?;
    debug!(
        current_version = current,
        target_version = CURRENT_SCHEMA_VERSION,
        "Checking migrations"
    );

    if current > CURRENT_SCHEMA_VERSION {
        return Err(Error::SchemaTooNew {
            found: current,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }
    if current == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    info!(
        from = current,
        to = CURRENT_SCHEMA_VERSION,
        pending = pending.len(),
        "Applying schema migrations"
    );

    let mut tx = pool.begin().await?;

    for migration in &pending {
        apply(&mut tx, migration)
            .await
            .map_err(|e| migration_error(migration, e))?;
    }

    let applied_at = chrono::Utc::now().to_rfc3339();
    for migration in &pending {
        sqlx::query(
            "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?, ?, ?)",
        )
        .bind(migration.version)
        .bind(migration.description)
        .bind(&applied_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| migration_error(migration, e))?;
    }

    if let Err(e) = tx.commit().await {
        // Nothing was committed; blame the newest pending step.
        return Err(match pending.last() {
            Some(last) => migration_error(last, e),
            None => Error::Database(e),
        });
    }

    info!(version = CURRENT_SCHEMA_VERSION, "Schema migrations applied");
    Ok(())
}

/// `MAX(version)` from `schema_migrations`, or 0 for an empty store.
pub async fn current_version(pool: &SqlitePool) -> Result<i64> {
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    Ok(version.unwrap_or(0))
}

async fn apply(tx: &mut Transaction<'_, Sqlite>, migration: &Migration) -> sqlx::Result<()> {
    debug!(
        version = migration.version,
        description = migration.description,
        "Applying migration"
    );

    for step in migration.steps {
        match step {
            Step::Sql(sql) => {
                sqlx::query(sql).execute(&mut **tx).await?;
            }
            Step::AddColumn {
                table,
                column,
                decl,
            } => {
                let exists: bool = sqlx::query_scalar(&format!(
                    "SELECT COUNT(*) > 0 FROM pragma_table_info('{}') WHERE name = ?",
                    table
                ))
                .bind(column)
                .fetch_one(&mut **tx)
                .await?;

                if !exists {
                    sqlx::query(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, decl))
                        .execute(&mut **tx)
                        .await?;
                }
            }
        }
    }
    Ok(())
}

fn migration_error(migration: &Migration, cause: sqlx::Error) -> Error {
    Error::SchemaMigration {
        version: migration.version,
        description: migration.description,
        cause: cause.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use tempfile::TempDir;

    async fn column_names(pool: &SqlitePool, table: &str) -> Vec<String> {
        sqlx::query_scalar(&format!("SELECT name FROM pragma_table_info('{}')", table))
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_store_reaches_current_version() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("s.db")).await.unwrap();

        run_migrations(&pool).await.unwrap();
        assert_eq!(current_version(&pool).await.unwrap(), CURRENT_SCHEMA_VERSION);

        let node_cols = column_names(&pool, "nodes").await;
        for col in ["hash", "meta", "date", "summary", "embedding"] {
            assert!(node_cols.iter().any(|c| c == col), "missing nodes.{}", col);
        }
        let edge_cols = column_names(&pool, "edges").await;
        for col in ["confidence", "veracity", "context_source"] {
            assert!(edge_cols.iter().any(|c| c == col), "missing edges.{}", col);
        }
    }

    #[tokio::test]
    async fn test_rerun_is_noop() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("s.db")).await.unwrap();

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_partially_applied_column_is_tolerated() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("s.db")).await.unwrap();

        // A v1 store where someone already added `hash` by hand.
        sqlx::query("CREATE TABLE nodes (id TEXT PRIMARY KEY, type TEXT, title TEXT, domain TEXT, layer TEXT, embedding BLOB, hash TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE schema_migrations (version INTEGER PRIMARY KEY, description TEXT NOT NULL, applied_at TEXT NOT NULL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO schema_migrations VALUES (1, 'genesis', 'then')")
            .execute(&pool)
            .await
            .unwrap();

        run_migrations(&pool).await.unwrap();
        assert_eq!(current_version(&pool).await.unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_newer_store_is_refused() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("s.db")).await.unwrap();
        run_migrations(&pool).await.unwrap();

        sqlx::query("INSERT INTO schema_migrations VALUES (99, 'future', 'later')")
            .execute(&pool)
            .await
            .unwrap();

        let err = run_migrations(&pool).await.unwrap_err();
        assert!(matches!(
            err,
            Error::SchemaTooNew {
                found: 99,
                supported: CURRENT_SCHEMA_VERSION
            }
        ));
    }

    #[tokio::test]
    async fn test_failed_step_rolls_back_everything() {
        let tmp = TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("s.db")).await.unwrap();

        // `nodes` as a view makes the v2 ALTER TABLE fail.
        sqlx::query("CREATE VIEW nodes AS SELECT 1 AS id")
            .execute(&pool)
            .await
            .unwrap();

        let err = run_migrations(&pool).await.unwrap_err();
        assert!(matches!(err, Error::SchemaMigration { .. }));
        assert_eq!(current_version(&pool).await.unwrap(), 0);

        let edges_exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'edges'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert!(!edges_exists);
    }
}
