use sqlx::MySqlPool;
use sqlx_tx_propagation::config::ManagerConfig;
use sqlx_tx_propagation::mysql::MySqlHandle;
use sqlx_tx_propagation::{
    with_transaction, MySqlResource, Propagation, TransactionContext, TransactionDefinition,
    TransactionManager,
};

type Manager = TransactionManager<MySqlResource>;

/// Writes an audit row. Only meaningful as part of a caller's transaction,
/// so it runs with `MANDATORY` and refuses to start one of its own.
async fn record_audit(
    manager: &Manager,
    ctx: &mut TransactionContext<MySqlHandle>,
    user_id: i64,
    action: &'static str,
) -> anyhow::Result<()> {
    with_transaction(
        manager,
        ctx,
        &TransactionDefinition::new(Propagation::Mandatory),
        |tx| {
            Box::pin(async move {
                sqlx::query("INSERT INTO audit_log (user_id, action) VALUES (?, ?)")
                    .bind(user_id)
                    .bind(action)
                    .execute(tx.as_executor()?)
                    .await?;
                Ok::<_, anyhow::Error>(())
            })
        },
    )
    .await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "mysql://localhost/test".to_string());
    let pool = MySqlPool::connect(&database_url).await?;
    let manager = Manager::with_config(
        MySqlResource::new(pool.clone()),
        ManagerConfig::default().with_validate_existing_transaction(true),
    );
    let mut ctx = TransactionContext::new();

    println!("=== Basic Propagation Example ===\n");

    // 1. MANDATORY outside any transaction is refused before touching the pool
    println!("1. Audit helper called without a transaction...");
    match record_audit(&manager, &mut ctx, 0, "orphan").await {
        Ok(()) => println!("   ✗ Should have been refused!"),
        Err(e) => println!("   ✓ Refused: {}\n", e),
    }

    // 2. The same helper joins the caller's REQUIRED transaction
    println!("2. Sign-up with user, profile and audit row on one connection...");
    let inner = manager.clone();
    let user_id = with_transaction(&manager, &mut ctx, &TransactionDefinition::required(), |tx| {
        Box::pin(async move {
            let result = sqlx::query("INSERT INTO users (name, email) VALUES (?, ?)")
                .bind("Alice")
                .bind("alice@example.com")
                .execute(tx.as_executor()?)
                .await?;
            let user_id = result.last_insert_id() as i64;

            sqlx::query("INSERT INTO profiles (user_id, bio) VALUES (?, ?)")
                .bind(user_id)
                .bind("Software Developer")
                .execute(tx.as_executor()?)
                .await?;

            record_audit(&inner, tx, user_id, "signed up").await?;
            Ok::<_, anyhow::Error>(user_id)
        })
    })
    .await?;
    println!("   ✓ User {} committed with profile and audit row\n", user_id);

    // 3. A failing joined helper dooms the whole sign-up
    println!("3. Sign-up whose audit row fails...");
    let inner = manager.clone();
    let result: anyhow::Result<()> =
        with_transaction(&manager, &mut ctx, &TransactionDefinition::required(), |tx| {
            Box::pin(async move {
                sqlx::query("INSERT INTO users (name, email) VALUES (?, ?)")
                    .bind("Charlie")
                    .bind("charlie@example.com")
                    .execute(tx.as_executor()?)
                    .await?;

                // audit_log.user_id references users.id, so -1 is rejected
                if let Err(e) = record_audit(&inner, tx, -1, "signed up").await {
                    println!("   Audit failed ({}), rollback-only: {}", e, tx.is_rollback_only());
                }
                Ok::<_, anyhow::Error>(())
            })
        })
        .await;
    match result {
        Ok(()) => println!("   ✗ Commit should have been refused!"),
        Err(e) => println!("   ✓ {}\n", e),
    }

    // 4. Read-only outer transaction; a writer may not join it
    println!("4. Read-only report...");
    let inner = manager.clone();
    let read_only = TransactionDefinition::required().with_read_only(true);
    let user_count = with_transaction(&manager, &mut ctx, &read_only, |tx| {
        Box::pin(async move {
            let users: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
                .fetch_one(tx.as_executor()?)
                .await?;

            match inner.begin(tx, &TransactionDefinition::required()).await {
                Ok(mut status) => {
                    inner.commit(tx, &mut status).await?;
                    println!("   ✗ Writer should not join a read-only transaction");
                }
                Err(e) => println!("   Writer refused: {}", e),
            }
            Ok::<_, anyhow::Error>(users.0)
        })
    })
    .await?;
    println!("   ✓ Users: {}\n", user_count);

    ctx.finish()?;
    println!("=== All examples completed ===");

    pool.close().await;
    Ok(())
}
