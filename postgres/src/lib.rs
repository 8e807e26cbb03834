//! `PostgreSQL` store for Terminbuchung.
//!
//! Implements the [`Store`] and [`Transaction`] ports from `terminbuchung-core` on top of
//! a sqlx connection pool:
//!
//! - One database transaction per [`Transaction`]
//! - Optimistic versioning on slots, appointments and dossiers
//! - `FOR UPDATE SKIP LOCKED` appointment allocation, so concurrent bookers never
//!   block on or receive the same row
//! - Unique constraints on appointment references, surfaced as
//!   [`StoreError::UniqueViolation`]
//!
//! # Example
//!
//! ```ignore
//! use terminbuchung_postgres::PostgresStore;
//! use std::time::Duration;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresStore::connect("postgres://localhost/terminbuchung", 20, 2, Duration::from_secs(10)).await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use terminbuchung_core::error::{Entity, StoreError};
use terminbuchung_core::store::{Store, StoreResult, Transaction};

mod rows;
mod transaction;

pub use transaction::PostgresTransaction;

/// `PostgreSQL`-backed [`Store`].
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect a new pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the database cannot be reached within
    /// `acquire_timeout`.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        min_connections: u32,
        acquire_timeout: Duration,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await
            .map_err(db_error)?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the bundled schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    /// Underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn begin(&self) -> StoreResult<Box<dyn Transaction>> {
        let tx = self.pool.begin().await.map_err(db_error)?;
        Ok(Box::new(PostgresTransaction::new(tx)))
    }
}

/// Map a sqlx error, recognising unique violations on the appointment references.
pub(crate) fn db_error(error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &error {
        if db.is_unique_violation() {
            let constraint = db.constraint().unwrap_or_default().to_string();
            let entity = match constraint.as_str() {
                "uq_dossier_termin1" | "uq_dossier_termin2" | "uq_eintrag_termin" => Entity::Termin,
                "uq_eintrag_nr" => Entity::Eintrag,
                "uq_impfung_termin" => Entity::Impfung,
                "uq_impfslot_fenster" => Entity::Slot,
                _ => Entity::Dossier,
            };
            metrics::counter!("terminbuchung_store_unique_violations_total", "constraint" => constraint.clone())
                .increment(1);
            return StoreError::UniqueViolation { entity, constraint };
        }
    }
    StoreError::Database(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_database_errors_map_to_database() {
        let error = db_error(sqlx::Error::RowNotFound);
        assert!(matches!(error, StoreError::Database(_)));
    }
}
