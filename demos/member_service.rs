//! Member sign-up against the in-memory resource, with every propagation
//! decision logged at debug level.

use sqlx_tx_propagation::memory::MemoryHandle;
use sqlx_tx_propagation::{
    with_transaction, InMemoryResource, TransactionContext, TransactionDefinition,
    TransactionManager,
};

type Manager = TransactionManager<InMemoryResource>;

async fn join(
    manager: &Manager,
    ctx: &mut TransactionContext<MemoryHandle>,
    username: &str,
    log_definition: TransactionDefinition,
) -> anyhow::Result<()> {
    let inner = manager.clone();
    let username = username.to_string();
    with_transaction(manager, ctx, &TransactionDefinition::required(), |tx| {
        Box::pin(async move {
            with_transaction(&inner, tx, &TransactionDefinition::required(), |tx| {
                let username = username.clone();
                Box::pin(async move {
                    if let Some(conn) = tx.resource_mut() {
                        conn.insert("member", &username);
                    }
                    Ok::<_, anyhow::Error>(())
                })
            })
            .await?;

            let logged: anyhow::Result<()> = with_transaction(&inner, tx, &log_definition, |tx| {
                let username = username.clone();
                Box::pin(async move {
                    if let Some(conn) = tx.resource_mut() {
                        conn.insert("log", &username);
                    }
                    anyhow::bail!("log storage unavailable for {username}")
                })
            })
            .await;
            if let Err(e) = logged {
                println!("   log failed and was swallowed: {e}");
            }
            Ok(())
        })
    })
    .await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let resource = InMemoryResource::new();
    let manager = Manager::new(resource.clone());

    println!("=== Member Sign-up Example ===\n");

    println!("1. Log joins the member transaction (REQUIRED)...");
    let mut ctx = TransactionContext::new();
    match join(&manager, &mut ctx, "kim", TransactionDefinition::required()).await {
        Ok(()) => println!("   ✗ Should have been rolled back"),
        Err(e) => println!("   ✓ {e}"),
    }
    println!(
        "   member saved: {}, log saved: {}\n",
        resource.contains("member", "kim"),
        resource.contains("log", "kim")
    );

    println!("2. Log runs on its own transaction (REQUIRES_NEW)...");
    join(&manager, &mut ctx, "lee", TransactionDefinition::requires_new()).await?;
    println!(
        "   member saved: {}, log saved: {}\n",
        resource.contains("member", "lee"),
        resource.contains("log", "lee")
    );

    ctx.finish()?;
    println!(
        "=== Done: {} physical commits, {} physical rollbacks ===",
        resource.commits(),
        resource.rollbacks()
    );
    Ok(())
}
