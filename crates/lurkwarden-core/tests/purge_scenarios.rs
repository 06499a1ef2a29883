mod common;

use chrono::Utc;
use common::{tuning, Call, FakeGateway, Harness};
use lurkwarden_core::config::EngineTuning;
use lurkwarden_core::error::ModerationError;
use lurkwarden_core::executor::PurgeMode;
use lurkwarden_core::gateway::GatewayError;
use lurkwarden_core::model::{CounterKind, Status};
use lurkwarden_core::storage::MembershipStore;
use lurkwarden_core::sweeper::{SkipReason, SweepOutcome};
use std::time::Duration;

const CHAT: i64 = -2002;

/// Admin 1, whitelisted 2, recent poster 3, eligible 10..=14 where 14 has two prior kicks.
async fn three_strikes_chat(harness: &Harness) {
    harness.gateway.set_admins(CHAT, vec![1]);
    harness.moderator.toggle_three_strikes(CHAT).await.expect("toggle");
    harness.seed_members(CHAT, [1, 2, 3]).await;
    harness.seed_members(CHAT, 10..=14).await;
    harness.moderator.add_whitelist(CHAT, 2).await.expect("whitelist");
    harness
        .store
        .upsert_activity(3, CHAT, Some(Utc::now()))
        .await
        .expect("activity");
    harness
        .store
        .upsert_activity(10, CHAT, Some(Utc::now() - chrono::Duration::days(3)))
        .await
        .expect("activity");
    for _ in 0..2 {
        harness
            .store
            .increment_counter(14, CHAT, CounterKind::Kick, Utc::now(), None)
            .await
            .expect("counter");
    }
}

fn ids(candidates: &[lurkwarden_core::executor::Candidate]) -> Vec<i64> {
    candidates.iter().map(|c| c.user_id).collect()
}

#[tokio::test]
async fn test_pretend_reports_split_without_mutating() {
    let harness = Harness::new(FakeGateway::new());
    three_strikes_chat(&harness).await;

    let (cutoff, report) = harness
        .moderator
        .run_purge(CHAT, "1d", PurgeMode::Kick, true)
        .await
        .expect("purge");
    assert_eq!(cutoff.label, "1d");
    assert!(report.pretend);
    assert_eq!(ids(&report.kicked), vec![10, 11, 12, 13]);
    assert_eq!(ids(&report.banned), vec![14]);
    assert!(harness.gateway.calls().is_empty());
    assert_eq!(harness.status(CHAT, 10).await, Some(Status::Member));
    let counter = harness
        .store
        .get_counter(10, CHAT, CounterKind::Kick)
        .await
        .expect("counter");
    assert_eq!(counter.count, 0);
}

#[tokio::test]
async fn test_purge_kicks_and_escalates() {
    let harness = Harness::new(FakeGateway::new());
    three_strikes_chat(&harness).await;

    let (_, report) = harness
        .moderator
        .run_purge(CHAT, "1d", PurgeMode::Kick, false)
        .await
        .expect("purge");
    assert_eq!(ids(&report.kicked), vec![10, 11, 12, 13]);
    assert_eq!(ids(&report.banned), vec![14]);
    assert!(report.skipped.is_empty());

    let mut calls = harness.gateway.calls();
    calls.sort_by_key(|c| match c {
        Call::Kick(_, id) | Call::Ban(_, id) | Call::Unban(_, id) => *id,
    });
    assert_eq!(
        calls,
        vec![
            Call::Kick(CHAT, 10),
            Call::Kick(CHAT, 11),
            Call::Kick(CHAT, 12),
            Call::Kick(CHAT, 13),
            Call::Ban(CHAT, 14),
        ]
    );

    for id in 10..=13 {
        assert_eq!(harness.status(CHAT, id).await, Some(Status::Kicked));
        let kicks = harness.store.get_counter(id, CHAT, CounterKind::Kick).await.expect("counter");
        assert_eq!(kicks.count, 1);
    }
    assert_eq!(harness.status(CHAT, 14).await, Some(Status::Banned));
    let kicks = harness.store.get_counter(14, CHAT, CounterKind::Kick).await.expect("counter");
    let bans = harness.store.get_counter(14, CHAT, CounterKind::Ban).await.expect("counter");
    assert_eq!((kicks.count, bans.count), (3, 1));

    // Removed users are no longer tracked; exempt and active users are untouched
    let activity = harness.store.list_activity(CHAT).await.expect("activity");
    assert!(!activity.contains_key(&10));
    assert!(activity.contains_key(&3));
    for id in 1..=3 {
        assert_eq!(harness.status(CHAT, id).await, Some(Status::Member));
    }
}

#[tokio::test]
async fn test_three_strikes_off_never_escalates() {
    let harness = Harness::new(FakeGateway::new());
    three_strikes_chat(&harness).await;
    assert!(!harness.moderator.toggle_three_strikes(CHAT).await.expect("toggle"));

    let (_, report) = harness
        .moderator
        .run_purge(CHAT, "1d", PurgeMode::Kick, true)
        .await
        .expect("purge");
    assert_eq!(ids(&report.kicked), vec![10, 11, 12, 13, 14]);
    assert!(report.banned.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_user_is_skipped_after_three_waits() {
    let gateway = FakeGateway::new();
    gateway.fail_action(
        "ban",
        11,
        GatewayError::RateLimited { wait: Duration::from_secs(5) },
        3,
    );
    let tuning = EngineTuning {
        num_batches: 1,
        ..tuning()
    };
    let harness = Harness::with_tuning(gateway, tuning);
    harness.moderator.track_chat(CHAT, None).await.expect("track");
    harness.seed_members(CHAT, [10, 11, 12]).await;

    let started = tokio::time::Instant::now();
    let (_, report) = harness
        .moderator
        .run_purge(CHAT, "1d", PurgeMode::Ban, false)
        .await
        .expect("purge");
    let elapsed = started.elapsed();

    assert_eq!(ids(&report.banned), vec![10, 12]);
    assert_eq!(ids(&report.skipped), vec![11]);
    assert!(elapsed >= Duration::from_secs(15), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(20), "elapsed {elapsed:?}");
    assert_eq!(
        harness.gateway.calls(),
        vec![Call::Ban(CHAT, 10), Call::Ban(CHAT, 12)]
    );
    assert_eq!(harness.status(CHAT, 11).await, Some(Status::Member));
}

#[tokio::test(start_paused = true)]
async fn test_single_purge_and_sweeps_suspended() {
    let gateway = FakeGateway::new().with_action_delay(Duration::from_secs(10));
    let harness = Harness::new(gateway);
    harness.moderator.track_chat(CHAT, None).await.expect("track");
    harness.seed_members(CHAT, [10]).await;

    let first = harness.moderator.run_purge(CHAT, "1d", PurgeMode::Kick, false);
    let contender = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = harness.moderator.run_purge(CHAT, "1d", PurgeMode::Kick, false).await;
        let sweep = harness.moderator.sweeper().sweep_chat(CHAT).await;
        (second, sweep)
    };
    let (first, (second, sweep)) = tokio::join!(first, contender);

    assert!(first.is_ok());
    assert!(matches!(second, Err(ModerationError::PurgeInProgress)));
    assert_eq!(sweep, SweepOutcome::Skipped(SkipReason::Suspended));

    // Flags are released once the purge finishes
    harness.gateway.set_present(CHAT, Vec::<i64>::new());
    assert!(matches!(
        harness.moderator.sweeper().sweep_chat(CHAT).await,
        SweepOutcome::Completed(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_purge_waits_for_running_sweep() {
    let gateway = FakeGateway::new().with_list_delay(Duration::from_secs(5));
    gateway.set_present(CHAT, [10]);
    let harness = Harness::new(gateway);
    harness.moderator.track_chat(CHAT, None).await.expect("track");
    harness.seed_members(CHAT, [10]).await;

    let started = tokio::time::Instant::now();
    let sweep = async {
        let outcome = harness.moderator.sweeper().sweep_chat(CHAT).await;
        (outcome, started.elapsed())
    };
    let purge = async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let result = harness.moderator.run_purge(CHAT, "1d", PurgeMode::Kick, false).await;
        (result, started.elapsed())
    };
    let ((sweep, swept_at), (purge, purged_at)) = tokio::join!(sweep, purge);

    assert!(matches!(sweep, SweepOutcome::Completed(_)));
    let (_, report) = purge.expect("purge");
    assert_eq!(ids(&report.kicked), vec![10]);
    assert!(swept_at >= Duration::from_secs(5), "swept at {swept_at:?}");
    assert!(purged_at >= swept_at, "purged at {purged_at:?}, swept at {swept_at:?}");
    assert_eq!(harness.gateway.calls(), vec![Call::Kick(CHAT, 10)]);
    assert_eq!(harness.status(CHAT, 10).await, Some(Status::Kicked));
}
