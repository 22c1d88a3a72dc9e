use std::sync::Arc;
use std::time::Duration;

use coord::{Election, MemoryStore, Observer, Session, SessionConfig};
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("Leader election demo");
    println!("====================\n");

    let store = Arc::new(MemoryStore::new());
    let config = SessionConfig::new(Duration::from_secs(2), Duration::from_millis(400));

    // Print every change of leader as it happens.
    let mut observer = Observer::new(store.clone(), "demo");
    let printer = tokio::spawn(async move {
        while let Some(Ok(leader)) = observer.next().await {
            println!("  observer: leader is now {} ({})", leader.value_str(), leader.key);
        }
    });

    let mut nodes = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        let session = Session::open(store.clone(), config.clone()).await?;
        let election = Arc::new(Election::new(&session, "demo"));
        let campaigner = election.clone();
        tokio::spawn(async move {
            match campaigner.campaign(name).await {
                Ok(_) => println!("{name}: elected"),
                Err(e) => println!("{name}: campaign ended: {e}"),
            }
        });
        nodes.push((name, session, election));
        sleep(Duration::from_millis(50)).await;
    }

    sleep(Duration::from_millis(200)).await;

    // Graceful hand-over: the leader resigns.
    let (name, _, election) = &nodes[0];
    println!("\n{name}: resigning");
    election.resign().await?;
    sleep(Duration::from_millis(200)).await;

    // Crash: the next leader stops renewing and its lease runs out.
    let (name, session, _) = nodes.remove(1);
    println!("\n{name}: crashing, the store expires its lease");
    store.expire_lease(session.lease_id());
    drop(session);
    sleep(Duration::from_millis(300)).await;

    for (_, session, _) in nodes {
        session.close().await?;
    }
    printer.abort();
    println!("\ndone");
    Ok(())
}
