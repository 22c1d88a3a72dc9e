use coord::{
    test_utils::{fast_config, wait_for_state, PartitionedStore},
    Election, MemoryStore, Observer, ParticipantState, Session, Store,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const ELECTION: &str = "observed";

async fn participant(store: Arc<dyn Store>) -> Arc<Election> {
    let session = Session::open(store, fast_config()).await.unwrap();
    Arc::new(Election::new(&session, ELECTION))
}

async fn next_leader(observer: &mut Observer) -> coord::LeaderKey {
    timeout(Duration::from_secs(1), observer.next())
        .await
        .expect("observer stalled")
        .expect("observer ended")
        .expect("observer failed")
}

#[tokio::test]
async fn test_observer_reports_each_new_leader_once() {
    let memory = Arc::new(MemoryStore::new());
    let p1 = participant(memory.clone()).await;
    let p2 = participant(memory.clone()).await;
    let p3 = participant(memory.clone()).await;

    p1.campaign("p1").await.unwrap();
    for (p, id) in [(&p2, "p2"), (&p3, "p3")] {
        let candidate = p.clone();
        tokio::spawn(async move { candidate.campaign(id).await });
        assert!(wait_for_state(p, ParticipantState::Following, Duration::from_millis(500)).await);
    }

    let mut observer = Observer::new(memory.clone(), ELECTION);
    let mut seen = vec![next_leader(&mut observer).await];

    // A proclaim keeps the holder; nothing is emitted for it.
    p1.proclaim("p1-renamed").await.unwrap();
    p1.resign().await.unwrap();
    seen.push(next_leader(&mut observer).await);
    p2.resign().await.unwrap();
    seen.push(next_leader(&mut observer).await);

    let identities: Vec<_> = seen.iter().map(|l| l.value_str().into_owned()).collect();
    assert_eq!(identities, ["p1", "p2", "p3"]);
    assert!(seen.windows(2).all(|w| w[0].create_revision < w[1].create_revision));
}

#[tokio::test]
async fn test_observer_waits_for_first_candidate() {
    let memory = Arc::new(MemoryStore::new());
    let election = participant(memory.clone()).await;
    let mut observer = election.observe();

    let pending = tokio::spawn(async move { next_leader(&mut observer).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    election.campaign("late").await.unwrap();
    let leader = timeout(Duration::from_millis(500), pending).await.unwrap().unwrap();
    assert_eq!(leader.value_str(), "late");
}

#[tokio::test]
async fn test_observer_resyncs_after_compaction() {
    let memory = Arc::new(MemoryStore::new());
    let p1 = participant(memory.clone()).await;
    let p2 = participant(memory.clone()).await;

    p1.campaign("p1").await.unwrap();
    let follower = {
        let p2 = p2.clone();
        tokio::spawn(async move { p2.campaign("p2").await })
    };
    assert!(wait_for_state(&p2, ParticipantState::Following, Duration::from_millis(500)).await);

    let mut observer = Observer::new(memory.clone(), ELECTION);
    assert_eq!(next_leader(&mut observer).await.value_str(), "p1");

    // History the observer has not read yet is compacted away, and the
    // change it would have shown happens meanwhile.
    memory.compact(memory.revision());
    p1.resign().await.unwrap();

    let leader = next_leader(&mut observer).await;
    assert_eq!(leader.value_str(), "p2");
    assert_eq!(follower.await.unwrap().unwrap().key, leader.key);
}

#[tokio::test]
async fn test_campaign_resyncs_after_compaction() {
    let memory = Arc::new(MemoryStore::new());
    let p1 = participant(memory.clone()).await;
    let p2 = participant(memory.clone()).await;

    p1.campaign("p1").await.unwrap();
    let follower = {
        let p2 = p2.clone();
        tokio::spawn(async move { p2.campaign("p2").await })
    };
    assert!(wait_for_state(&p2, ParticipantState::Following, Duration::from_millis(500)).await);

    memory.compact(memory.revision());
    p1.resign().await.unwrap();

    let leader = timeout(Duration::from_millis(500), follower).await.unwrap().unwrap().unwrap();
    assert_eq!(leader.value_str(), "p2");
}

#[tokio::test]
async fn test_observer_recovers_after_store_error() {
    let memory = Arc::new(MemoryStore::new());
    let flaky = PartitionedStore::new(memory.clone());
    let p1 = participant(memory.clone()).await;
    let p2 = participant(memory.clone()).await;

    p1.campaign("p1").await.unwrap();
    let follower = {
        let p2 = p2.clone();
        tokio::spawn(async move { p2.campaign("p2").await })
    };
    assert!(wait_for_state(&p2, ParticipantState::Following, Duration::from_millis(500)).await);

    let mut observer = Observer::new(Arc::new(flaky.clone()), ELECTION);
    assert_eq!(next_leader(&mut observer).await.value_str(), "p1");

    flaky.partition();
    let err = timeout(Duration::from_millis(500), observer.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(err.is_transient());

    p1.resign().await.unwrap();
    flaky.heal();
    assert_eq!(next_leader(&mut observer).await.value_str(), "p2");
    follower.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_observer_as_stream() {
    let memory = Arc::new(MemoryStore::new());
    let p1 = participant(memory.clone()).await;
    p1.campaign("p1").await.unwrap();

    let mut leaders = Observer::new(memory.clone(), ELECTION).into_stream().boxed();
    let first = timeout(Duration::from_millis(500), leaders.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(first.key, p1.key());
}
