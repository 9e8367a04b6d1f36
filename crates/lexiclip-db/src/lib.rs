//! Owns the shared `PgPool` and the embedded migrations every store crate
//! (Result Store, Job Store, Word Index, Analysis Cache, AI quota counters)
//! runs its queries against, plus a narrow transaction helper for the
//! read-then-update upserts the spec requires for the word index.

use sqlx::PgPool;

#[derive(Clone)]
pub struct Db {
    pub pool: PgPool,
}

impl Db {
    /// Connects and runs pending migrations. Panics on failure: a database we
    /// cannot reach or migrate is a startup-time configuration error, not a
    /// recoverable condition.
    pub async fn connect(database_url: &str) -> Self {
        let pool = PgPool::connect(database_url)
            .await
            .expect("failed to connect to lexiclip database");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("failed to run lexiclip database migrations");

        Self { pool }
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}
