use anyhow::{Context, Result};
use sqlx::{Sqlite, SqlitePool, Transaction};

/// Embedded SQL migration with version, direction, and content.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

static INCOMING_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: include_str!("sql/incoming/001_init.up.sql"),
    down_sql: include_str!("sql/incoming/001_init.down.sql"),
}];

static LONGTERM_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: include_str!("sql/longterm/001_init.up.sql"),
    down_sql: include_str!("sql/longterm/001_init.down.sql"),
}];

/// Which database a migrator manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    Incoming,
    LongTerm,
}

impl Schema {
    fn migrations(self) -> &'static [Migration] {
        match self {
            Self::Incoming => INCOMING_MIGRATIONS,
            Self::LongTerm => LONGTERM_MIGRATIONS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::LongTerm => "longterm",
        }
    }
}

/// Manages schema migrations.
///
/// Uses a golang-migrate style `schema_migrations` table holding a single
/// `(version, dirty)` row.
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns the current migration version and dirty flag.
    fn status(&self) -> impl std::future::Future<Output = Result<(u32, bool)>> + Send;
}

/// SQLite migration runner for one of the two databases.
pub struct SqliteMigrator {
    pool: SqlitePool,
    schema: Schema,
}

impl SqliteMigrator {
    pub fn new(pool: SqlitePool, schema: Schema) -> Self {
        Self { pool, schema }
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER NOT NULL,
                dirty INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("creating schema_migrations table")?;

        Ok(())
    }

    async fn current_version(&self) -> Result<(u32, bool)> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT version, dirty FROM schema_migrations LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .context("querying migration version")?;

        match row {
            Some((version, dirty)) => Ok((
                u32::try_from(version).context("migration version out of range")?,
                dirty != 0,
            )),
            None => Ok((0, false)),
        }
    }

    /// Replaces the tracked version. Version 0 clears the table.
    async fn set_version(tx: &mut Transaction<'_, Sqlite>, version: u32, dirty: bool) -> Result<()> {
        sqlx::query("DELETE FROM schema_migrations")
            .execute(&mut **tx)
            .await
            .context("clearing schema_migrations")?;

        if version > 0 {
            sqlx::query("INSERT INTO schema_migrations (version, dirty) VALUES (?, ?)")
                .bind(i64::from(version))
                .bind(i64::from(dirty))
                .execute(&mut **tx)
                .await
                .context("inserting migration version")?;
        }

        Ok(())
    }

    async fn mark_dirty(&self, version: u32) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::set_version(&mut tx, version, true).await?;
        tx.commit().await.context("marking migration dirty")?;
        Ok(())
    }

    /// Runs `sql` and records `version` as clean in one transaction.
    async fn apply(&self, sql: &str, version: u32) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for statement in split_statements(sql) {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .with_context(|| {
                    let preview: String = statement.chars().take(80).collect();
                    format!("executing migration statement: {preview}...")
                })?;
        }

        Self::set_version(&mut tx, version, false).await?;
        tx.commit().await.context("committing migration")?;

        Ok(())
    }
}

impl Migrator for SqliteMigrator {
    async fn up(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, dirty) = self.current_version().await?;
        let schema = self.schema.as_str();

        if dirty {
            anyhow::bail!(
                "{schema} migration version {current_version} is dirty, manual intervention required"
            );
        }

        tracing::info!(schema, current_version, "running migrations");

        let mut applied = 0u32;

        for migration in self.schema.migrations() {
            if migration.version <= current_version {
                continue;
            }

            tracing::info!(schema, version = migration.version, "applying migration");

            // Left dirty if the apply transaction fails.
            self.mark_dirty(migration.version).await?;

            self.apply(migration.up_sql, migration.version)
                .await
                .with_context(|| format!("applying {schema} migration version {}", migration.version))?;

            applied += 1;
        }

        if applied == 0 {
            tracing::info!(schema, "no pending migrations");
        } else {
            let (final_version, _) = self.current_version().await?;
            tracing::info!(schema, version = final_version, applied, "migrations completed");
        }

        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, _) = self.current_version().await?;
        let schema = self.schema.as_str();

        if current_version == 0 {
            tracing::info!(schema, "no migrations to roll back");
            return Ok(());
        }

        let migration = self
            .schema
            .migrations()
            .iter()
            .find(|m| m.version == current_version)
            .with_context(|| format!("{schema} migration version {current_version} not found"))?;

        tracing::info!(schema, version = current_version, "rolling back migration");

        self.mark_dirty(current_version).await?;

        let prev_version = self
            .schema
            .migrations()
            .iter()
            .filter(|m| m.version < current_version)
            .map(|m| m.version)
            .max()
            .unwrap_or(0);

        self.apply(migration.down_sql, prev_version)
            .await
            .with_context(|| format!("rolling back {schema} migration version {current_version}"))?;

        tracing::info!(schema, version = prev_version, "rollback completed");

        Ok(())
    }

    async fn status(&self) -> Result<(u32, bool)> {
        self.ensure_migrations_table().await?;
        self.current_version().await
    }
}

/// Splits SQL text into individual statements by semicolons.
///
/// Handles empty lines, comments, and whitespace-only segments.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}
