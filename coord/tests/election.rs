use bytes::Bytes;
use coord::{
    test_utils::{fast_config, wait_for_state, wait_until, PartitionedStore},
    Election, Error, MemoryStore, ParticipantState, Session, SessionState, Store,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

const ELECTION: &str = "scheduler";

async fn participant(store: Arc<dyn Store>) -> (Session, Arc<Election>) {
    let session = Session::open(store, fast_config()).await.unwrap();
    let election = Arc::new(Election::new(&session, ELECTION));
    (session, election)
}

fn spawn_campaign(
    election: &Arc<Election>,
    identity: &'static str,
) -> tokio::task::JoinHandle<coord::Result<coord::LeaderKey>> {
    let election = election.clone();
    tokio::spawn(async move { election.campaign(identity).await })
}

#[tokio::test]
async fn test_single_candidate_wins_immediately() {
    let memory = Arc::new(MemoryStore::new());
    let (session, election) = participant(memory.clone()).await;

    let leader = timeout(Duration::from_millis(200), election.campaign("p1"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(leader.key, election.key());
    assert_eq!(leader.value_str(), "p1");
    assert_eq!(leader.lease, Some(session.lease_id()));
    assert!(election.is_leader());
    assert_eq!(election.leader_key().await.unwrap(), leader);
}

#[tokio::test]
async fn test_key_is_named_after_lease() {
    let memory = Arc::new(MemoryStore::new());
    let (session, election) = participant(memory.clone()).await;
    assert_eq!(election.key(), format!("{ELECTION}/{}", session.lease_id()));
    assert_eq!(election.name(), ELECTION);
    assert_eq!(election.state(), ParticipantState::Idle);
}

#[tokio::test]
async fn test_at_most_one_leader_while_leadership_rotates() {
    let memory = Arc::new(MemoryStore::new());
    let mut elections = Vec::new();
    let mut campaigns = Vec::new();
    for identity in ["p0", "p1", "p2", "p3", "p4"] {
        let (_session, election) = participant(memory.clone()).await;
        campaigns.push(spawn_campaign(&election, identity));
        elections.push(election);
    }

    let mut served = Vec::new();
    for round in 0..elections.len() {
        let elections_ref = &elections;
        assert!(
            wait_until(Duration::from_secs(1), || elections_ref.iter().any(|e| e.is_leader())).await,
            "no leader in round {round}"
        );
        let leaders: Vec<_> = elections.iter().filter(|e| e.is_leader()).collect();
        assert_eq!(leaders.len(), 1, "round {round} has {} leaders", leaders.len());

        let leader = leaders[0].clone();
        let key = memory.get(leader.key()).unwrap();
        println!("round {round}: {} leads at revision {}", leader.key(), key.create_revision);
        served.push(key.create_revision);
        leader.resign().await.unwrap();
        assert_eq!(leader.state(), ParticipantState::Resigned);
    }

    // Leadership was handed out in creation order.
    assert!(served.windows(2).all(|w| w[0] < w[1]), "order was {served:?}");
    for campaign in campaigns {
        assert!(campaign.await.unwrap().is_ok());
    }
}

#[tokio::test]
async fn test_failover_after_leader_session_dies() {
    let memory = Arc::new(MemoryStore::new());
    let flaky = PartitionedStore::new(memory.clone());

    let (_s1, p1) = participant(Arc::new(flaky.clone())).await;
    let (_s2, p2) = participant(memory.clone()).await;

    p1.campaign("p1").await.unwrap();
    let p1_key = p1.key().to_string();
    let follower = spawn_campaign(&p2, "p2");
    assert!(wait_for_state(&p2, ParticipantState::Following, Duration::from_millis(500)).await);

    flaky.partition();

    // p1 learns first, from its own keep-alive failures.
    let cause = timeout(Duration::from_secs(1), p1.lost()).await.unwrap();
    assert_eq!(cause, Error::SessionLost);
    assert_eq!(p1.state(), ParticipantState::Resigned);

    // p2 takes over only once the store has expired p1's lease.
    let leader = timeout(Duration::from_secs(2), follower)
        .await
        .expect("p2 should be elected after p1's lease expires")
        .unwrap()
        .unwrap();
    assert_eq!(leader.key, p2.key());
    assert!(memory.get(&p1_key).is_none());
    assert!(p2.is_leader());
}

#[tokio::test]
async fn test_resign_is_idempotent_and_hands_over() {
    let memory = Arc::new(MemoryStore::new());
    let (_s1, p1) = participant(memory.clone()).await;
    let (_s2, p2) = participant(memory.clone()).await;

    p1.campaign("p1").await.unwrap();
    let follower = spawn_campaign(&p2, "p2");
    assert!(wait_for_state(&p2, ParticipantState::Following, Duration::from_millis(500)).await);

    p1.resign().await.unwrap();
    p1.resign().await.unwrap();
    assert!(memory.get(p1.key()).is_none());

    let leader = timeout(Duration::from_millis(500), follower).await.unwrap().unwrap().unwrap();
    assert_eq!(leader.value_str(), "p2");

    // A resigned participant cannot campaign again.
    assert!(matches!(p1.campaign("again").await, Err(Error::InvalidState(_))));
}

#[tokio::test]
async fn test_resign_while_idle() {
    let memory = Arc::new(MemoryStore::new());
    let (_session, election) = participant(memory.clone()).await;
    election.resign().await.unwrap();
    assert_eq!(election.state(), ParticipantState::Resigned);
}

#[tokio::test]
async fn test_leader_key_without_candidates() {
    let memory = Arc::new(MemoryStore::new());
    let (_session, election) = participant(memory.clone()).await;
    assert_eq!(election.leader_key().await.unwrap_err(), Error::NoLeader);
}

#[tokio::test]
async fn test_leader_key_is_seen_by_followers() {
    let memory = Arc::new(MemoryStore::new());
    let (_s1, p1) = participant(memory.clone()).await;
    let (_s2, p2) = participant(memory.clone()).await;

    let leader = p1.campaign("10.0.0.1:8080").await.unwrap();
    let _follower = spawn_campaign(&p2, "10.0.0.2:8080");
    assert!(wait_for_state(&p2, ParticipantState::Following, Duration::from_millis(500)).await);

    let seen = p2.leader_key().await.unwrap();
    assert_eq!(seen, leader);
    assert_eq!(seen.value_str(), "10.0.0.1:8080");
}

#[tokio::test]
async fn test_cancelled_campaign_withdraws_key() {
    let memory = Arc::new(MemoryStore::new());
    let (_s1, p1) = participant(memory.clone()).await;
    let (_s2, p2) = participant(memory.clone()).await;

    p1.campaign("p1").await.unwrap();
    let result = p2
        .campaign_until("p2", sleep(Duration::from_millis(100)))
        .await;

    assert_eq!(result.unwrap_err(), Error::Cancelled);
    assert!(memory.get(p2.key()).is_none());
    assert_eq!(p2.state(), ParticipantState::Idle);
    assert!(p1.is_leader());

    // Idle again, so it may campaign later.
    p1.resign().await.unwrap();
    assert!(timeout(Duration::from_millis(500), p2.campaign("p2")).await.unwrap().is_ok());
}

#[tokio::test]
async fn test_campaign_on_dead_session() {
    let memory = Arc::new(MemoryStore::new());
    let (session, election) = participant(memory.clone()).await;
    session.close().await.unwrap();

    assert_eq!(election.campaign("late").await.unwrap_err(), Error::SessionLost);
    assert_eq!(election.state(), ParticipantState::Resigned);
}

#[tokio::test]
async fn test_follower_session_death_ends_campaign() {
    let memory = Arc::new(MemoryStore::new());
    let (_s1, p1) = participant(memory.clone()).await;
    let (s2, p2) = participant(memory.clone()).await;

    p1.campaign("p1").await.unwrap();
    let follower = spawn_campaign(&p2, "p2");
    assert!(wait_for_state(&p2, ParticipantState::Following, Duration::from_millis(500)).await);

    s2.close().await.unwrap();
    let result = timeout(Duration::from_millis(500), follower).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err(), Error::SessionLost);
    assert_eq!(p2.state(), ParticipantState::Resigned);
}

#[tokio::test]
async fn test_proclaim_updates_identity_in_place() {
    let memory = Arc::new(MemoryStore::new());
    let (_session, election) = participant(memory.clone()).await;

    let before = election.campaign("v1").await.unwrap();
    election.proclaim("v2").await.unwrap();

    let after = election.leader_key().await.unwrap();
    assert_eq!(after.value_str(), "v2");
    assert_eq!(after.create_revision, before.create_revision);
    assert!(election.is_leader());
}

#[tokio::test]
async fn test_proclaim_without_candidacy() {
    let memory = Arc::new(MemoryStore::new());
    let (_session, election) = participant(memory.clone()).await;
    assert!(matches!(election.proclaim("v").await, Err(Error::InvalidState(_))));
}

#[tokio::test]
async fn test_proclaim_after_key_deleted() {
    let memory = Arc::new(MemoryStore::new());
    let (_session, election) = participant(memory.clone()).await;
    election.campaign("v1").await.unwrap();

    memory.delete(election.key()).await.unwrap();
    assert_eq!(election.proclaim("v2").await.unwrap_err(), Error::CandidacyLost);
}

#[tokio::test]
async fn test_external_delete_is_reported_by_lost() {
    let memory = Arc::new(MemoryStore::new());
    let (_session, election) = participant(memory.clone()).await;
    election.campaign("p1").await.unwrap();

    let watcher = {
        let election = election.clone();
        tokio::spawn(async move { election.lost().await })
    };
    sleep(Duration::from_millis(50)).await;
    memory.delete(election.key()).await.unwrap();

    let cause = timeout(Duration::from_millis(500), watcher).await.unwrap().unwrap();
    assert_eq!(cause, Error::CandidacyLost);
    assert!(!election.is_leader());
}

#[tokio::test]
async fn test_follower_key_deleted_externally() {
    let memory = Arc::new(MemoryStore::new());
    let (_s1, p1) = participant(memory.clone()).await;
    let (_s2, p2) = participant(memory.clone()).await;

    p1.campaign("p1").await.unwrap();
    let follower = spawn_campaign(&p2, "p2");
    assert!(wait_for_state(&p2, ParticipantState::Following, Duration::from_millis(500)).await);

    memory.delete(p2.key()).await.unwrap();
    let result = timeout(Duration::from_millis(500), follower).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err(), Error::CandidacyLost);
    assert_eq!(p2.state(), ParticipantState::Idle);
}

#[tokio::test]
async fn test_leader_lease_expiry_is_reported_as_session_lost() {
    let memory = Arc::new(MemoryStore::new());
    let (session, election) = participant(memory.clone()).await;
    election.campaign("p1").await.unwrap();

    let watcher = {
        let election = election.clone();
        tokio::spawn(async move { election.lost().await })
    };
    sleep(Duration::from_millis(50)).await;
    assert!(memory.expire_lease(session.lease_id()));

    let cause = timeout(Duration::from_millis(500), watcher).await.unwrap().unwrap();
    assert_eq!(cause, Error::SessionLost);
    assert_eq!(election.state(), ParticipantState::Resigned);
    assert_eq!(session.state(), SessionState::Dead);
    assert!(matches!(session.death_cause(), Some(Error::LeaseNotFound(_))));
}

#[tokio::test]
async fn test_follower_lease_expiry_ends_campaign_with_session_lost() {
    let memory = Arc::new(MemoryStore::new());
    let (_s1, p1) = participant(memory.clone()).await;
    let (s2, p2) = participant(memory.clone()).await;

    p1.campaign("p1").await.unwrap();
    let follower = spawn_campaign(&p2, "p2");
    assert!(wait_for_state(&p2, ParticipantState::Following, Duration::from_millis(500)).await);

    assert!(memory.expire_lease(s2.lease_id()));
    let result = timeout(Duration::from_millis(500), follower).await.unwrap().unwrap();
    assert_eq!(result.unwrap_err(), Error::SessionLost);
    assert_eq!(p2.state(), ParticipantState::Resigned);
    assert!(!s2.is_active());
    assert!(p1.is_leader());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_campaigns_on_one_participant() {
    let memory = Arc::new(MemoryStore::new());
    let (_s1, p1) = participant(memory.clone()).await;
    let (_s2, p2) = participant(memory.clone()).await;
    p1.campaign("p1").await.unwrap();

    // p1 keeps the lead, so every campaign on p2 either waits or is refused.
    let campaigns: Vec<_> = (0..8)
        .map(|_| {
            let p2 = p2.clone();
            tokio::spawn(async move {
                p2.campaign_until("p2", sleep(Duration::from_millis(150))).await
            })
        })
        .collect();

    let mut cancelled = 0;
    let mut refused = 0;
    for campaign in campaigns {
        match campaign.await.unwrap() {
            Err(Error::Cancelled) => cancelled += 1,
            Err(Error::InvalidState(_)) => refused += 1,
            other => panic!("unexpected campaign result {other:?}"),
        }
    }
    assert_eq!(cancelled, 1);
    assert_eq!(refused, 7);
    assert_eq!(p2.state(), ParticipantState::Idle);
}

#[tokio::test]
async fn test_rejoin_keeps_original_position() {
    let memory = Arc::new(MemoryStore::new());
    let (_s1, p1) = participant(memory.clone()).await;
    let (s2, p2) = participant(memory.clone()).await;
    let (_s3, p3) = participant(memory.clone()).await;

    p1.campaign("p1").await.unwrap();

    // A previous run holding s2's lease registered before p3 arrived.
    let earlier = memory
        .put(p2.key(), Bytes::from_static(b"old"), Some(s2.lease_id()))
        .await
        .unwrap();
    let third = spawn_campaign(&p3, "p3");
    assert!(wait_for_state(&p3, ParticipantState::Following, Duration::from_millis(500)).await);

    let second = spawn_campaign(&p2, "new");
    assert!(wait_for_state(&p2, ParticipantState::Following, Duration::from_millis(500)).await);
    let kv = memory.get(p2.key()).unwrap();
    assert_eq!(kv.create_revision, earlier.create_revision);
    assert_eq!(&kv.value[..], b"new");

    p1.resign().await.unwrap();
    let leader = timeout(Duration::from_millis(500), second).await.unwrap().unwrap().unwrap();
    assert_eq!(leader.key, p2.key());
    assert!(!p3.is_leader());
    third.abort();
}

#[tokio::test]
async fn test_broken_watch_ends_campaign_with_transient_error() {
    let memory = Arc::new(MemoryStore::new());
    let (_s1, p1) = participant(memory.clone()).await;
    p1.campaign("p1").await.unwrap();

    let flaky = PartitionedStore::new(memory.clone());
    let (_s2, p2) = participant(Arc::new(flaky.clone())).await;
    let follower = spawn_campaign(&p2, "p2");
    assert!(wait_for_state(&p2, ParticipantState::Following, Duration::from_millis(500)).await);

    // The watch breaks; the campaign gives up with the transient error.
    flaky.partition();
    let result = timeout(Duration::from_millis(500), follower).await.unwrap().unwrap();
    assert!(result.unwrap_err().is_transient());
    flaky.heal();

    assert_eq!(p2.state(), ParticipantState::Idle);
    assert!(p1.is_leader());
}
