use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Create the PostgreSQL connection pool and run migrations. The controller
/// cannot operate without its database, so failures here are fatal.
pub async fn init_pg_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(database_url)
        .await?;

    sqlx::migrate!("../../migrations").run(&pool).await?;
    info!("database connected, migrations applied");

    Ok(pool)
}
