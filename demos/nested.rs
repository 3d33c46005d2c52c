use sqlx::MySqlPool;
use sqlx_tx_propagation::{
    with_transaction, MySqlResource, Propagation, TransactionContext, TransactionDefinition,
    TransactionManager,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Connect to database
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "mysql://localhost/test".to_string());
    let pool = MySqlPool::connect(&database_url).await?;
    let manager = TransactionManager::new(MySqlResource::new(pool.clone()));
    let mut ctx = TransactionContext::new();

    println!("=== Propagation Example ===\n");

    // Example 1: NESTED - savepoint inside the outer transaction
    println!("1. Nested (savepoint) fails, outer succeeds...");
    let inner = manager.clone();
    with_transaction(&manager, &mut ctx, &TransactionDefinition::required(), |tx| {
        Box::pin(async move {
            let result = sqlx::query("INSERT INTO users (name, email) VALUES (?, ?)")
                .bind("Eve")
                .bind("eve@example.com")
                .execute(tx.as_executor()?)
                .await?;
            let user_id = result.last_insert_id() as i64;
            println!("   Outer: Created user with ID {}", user_id);

            let nested = with_transaction(
                &inner,
                tx,
                &TransactionDefinition::new(Propagation::Nested),
                |nested_tx| {
                    Box::pin(async move {
                        // This will fail
                        sqlx::query("INSERT INTO non_existent_table VALUES (?)")
                            .bind(user_id)
                            .execute(nested_tx.as_executor()?)
                            .await?;
                        Ok::<_, anyhow::Error>(())
                    })
                },
            )
            .await;

            match nested {
                Ok(_) => println!("   ✗ Nested should have failed!"),
                Err(e) => println!("   Nested: Rolled back to savepoint ({})", e),
            }
            println!("   ✓ Outer transaction committed (user created)\n");
            Ok::<_, anyhow::Error>(())
        })
    })
    .await?;

    // Example 2: REQUIRES_NEW - the audit log survives on its own connection
    println!("2. Independent audit log with REQUIRES_NEW...");
    let inner = manager.clone();
    let required = TransactionDefinition::required();
    let result: anyhow::Result<()> = with_transaction(&manager, &mut ctx, &required, |tx| {
        Box::pin(async move {
            let result = sqlx::query("INSERT INTO users (name, email) VALUES (?, ?)")
                .bind("Frank")
                .bind("frank@example.com")
                .execute(tx.as_executor()?)
                .await?;
            let user_id = result.last_insert_id() as i64;

            with_transaction(&inner, tx, &TransactionDefinition::requires_new(), |audit_tx| {
                Box::pin(async move {
                    sqlx::query("INSERT INTO audit_log (user_id, action) VALUES (?, ?)")
                        .bind(user_id)
                        .bind("Sign-up attempted")
                        .execute(audit_tx.as_executor()?)
                        .await?;
                    println!("   Inner: Audit log committed independently");
                    Ok::<_, anyhow::Error>(())
                })
            })
            .await?;

            anyhow::bail!("sign-up rejected after auditing")
        })
    })
    .await;
    match result {
        Ok(_) => println!("   ✗ Outer should have failed!"),
        Err(e) => println!("   ✓ Outer rolled back ({}), audit log kept\n", e),
    }

    // Example 3: REQUIRED inside REQUIRED - an inner failure dooms the outer
    println!("3. Inner REQUIRED failure marks the transaction rollback-only...");
    let inner = manager.clone();
    let result = with_transaction(&manager, &mut ctx, &TransactionDefinition::required(), |tx| {
        Box::pin(async move {
            sqlx::query("INSERT INTO users (name, email) VALUES (?, ?)")
                .bind("Grace")
                .bind("grace@example.com")
                .execute(tx.as_executor()?)
                .await?;

            let joined = with_transaction(&inner, tx, &TransactionDefinition::required(), |_| {
                Box::pin(async move { Err::<(), _>(anyhow::anyhow!("profile rejected")) })
            })
            .await;
            println!("   Inner: {:?} (swallowed)", joined.err().map(|e| e.to_string()));
            println!("   Rollback-only: {}", tx.is_rollback_only());
            Ok::<_, anyhow::Error>(())
        })
    })
    .await;
    match result {
        Ok(_) => println!("   ✗ Outer commit should have been refused!"),
        Err(e) => println!("   ✓ {}\n", e),
    }

    ctx.finish()?;
    println!("=== All propagation examples completed ===");

    pool.close().await;
    Ok(())
}
