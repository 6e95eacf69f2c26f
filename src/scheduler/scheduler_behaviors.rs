// BDD-style tests for the scheduler tick and completion handling.
// Ports are in-memory fakes; the store is a real in-memory SQLite database.

use super::*;
use crate::config::{ProjectConfig, TierConfig};
use crate::error::SwarmError;
use crate::liveness::Liveness;
use crate::ports::fakes::{bead, FakeBeadSource, FakeDispatcher, FakeLiveness};
use crate::rate_limiter::{RateLimitConfig, WindowConfig};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::types::{DispatchStatus, FailureCategory, HealthEventKind, Tier};
use std::collections::BTreeMap;

struct Harness {
    db: SwarmDb,
    dispatcher: FakeDispatcher,
    beads: FakeBeadSource,
    liveness: FakeLiveness,
    scheduler: Scheduler,
}

fn project() -> ProjectConfig {
    ProjectConfig {
        workspace: "/nonexistent/workspace".into(),
        ..ProjectConfig::default()
    }
}

fn config() -> SchedulerConfig {
    SchedulerConfig {
        holder: "sched-test".to_string(),
        max_per_tick: 5,
        cooldown_secs: 0,
        projects: BTreeMap::from([("alpha".to_string(), project())]),
        tiers: TierConfig {
            fast: vec!["haiku".to_string()],
            balanced: vec!["sonnet".to_string()],
            premium: vec!["opus".to_string()],
        },
        ..SchedulerConfig::default()
    }
}

fn harness_with(config: SchedulerConfig, db: SwarmDb) -> Harness {
    let dispatcher = FakeDispatcher::default();
    let beads = FakeBeadSource::default();
    let liveness = FakeLiveness::default();
    let scheduler = Scheduler::new(
        ConfigHandle::new(config),
        db.clone(),
        Arc::new(dispatcher.clone()),
        Arc::new(beads.clone()),
        Arc::new(liveness.clone()),
    );
    Harness {
        db,
        dispatcher,
        beads,
        liveness,
        scheduler,
    }
}

async fn harness(config: SchedulerConfig) -> Harness {
    let db = SwarmDb::in_memory()
        .await
        .unwrap_or_else(|e| panic!("open failed: {e}"));
    db.activate_plan("plan-1", "lead")
        .await
        .unwrap_or_else(|e| panic!("activate failed: {e}"));
    harness_with(config, db)
}

async fn tick(h: &Harness) -> TickReport {
    h.scheduler
        .run_tick(&CancellationToken::new())
        .await
        .unwrap_or_else(|e| panic!("tick failed: {e}"))
}

async fn only_dispatch(h: &Harness, bead_id: &str) -> crate::types::Dispatch {
    let rows = h
        .db
        .get_dispatches_by_bead(&BeadId::new(bead_id))
        .await
        .unwrap_or_else(|e| panic!("load failed: {e}"));
    rows.into_iter()
        .next()
        .unwrap_or_else(|| panic!("no dispatch for {bead_id}"))
}

fn labelled(mut b: Bead, stage: &str) -> Bead {
    b.labels = vec![format!("stage:{stage}")];
    b
}

async fn complete(h: &Harness, id: DispatchId, outcome: DispatchOutcome) -> CompletionResult {
    h.scheduler
        .complete_dispatch(id, outcome)
        .await
        .unwrap_or_else(|e| panic!("complete failed: {e}"))
}

fn failed() -> DispatchOutcome {
    DispatchOutcome::Failed {
        category: FailureCategory::ProcessError,
        summary: "tests failed".to_string(),
        exit_code: Some(1),
    }
}

mod given_a_closed_plan_gate {
    use super::*;

    #[tokio::test]
    async fn then_nothing_is_dispatched() {
        // Given
        let db = SwarmDb::in_memory()
            .await
            .unwrap_or_else(|e| panic!("open failed: {e}"));
        let h = harness_with(config(), db);
        h.beads.add(bead("b1", "alpha", 0, 5)).await;

        // When
        let report = tick(&h).await;

        // Then
        assert!(report.gate_closed);
        assert_eq!(report.dispatched, 0);
        assert!(h.dispatcher.requests().await.is_empty());
    }
}

mod given_ready_beads {
    use super::*;

    #[tokio::test]
    async fn then_best_beads_are_dispatched_up_to_max_per_tick() {
        // Given
        let h = harness(SchedulerConfig {
            max_per_tick: 2,
            ..config()
        })
        .await;
        h.beads.add(bead("b-low", "alpha", 3, 30)).await;
        h.beads.add(bead("b-high", "alpha", 0, 5)).await;
        h.beads.add(bead("b-mid-new", "alpha", 1, 1)).await;
        h.beads.add(bead("b-mid-old", "alpha", 1, 20)).await;

        // When
        let report = tick(&h).await;

        // Then
        assert_eq!(report.candidates, 4);
        assert_eq!(report.dispatched, 2);
        let dispatched: Vec<String> = h
            .db
            .get_running_dispatches()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|d| d.bead_id.value().to_string())
            .collect();
        assert_eq!(dispatched, vec!["b-high", "b-mid-old"]);
        let requests = h.dispatcher.requests().await;
        assert!(requests.iter().all(|r| r.agent.value() == "alpha-planner"));
        assert!(requests.iter().all(|r| r.provider == "sonnet"));
        assert!(requests[0].prompt.contains("b-high"));
    }

    #[tokio::test]
    async fn then_stage_row_lease_and_label_are_written() {
        // Given
        let h = harness(config()).await;
        h.beads.add(labelled(bead("b1", "alpha", 0, 5), "implement")).await;
        h.beads.add(bead("b2", "alpha", 1, 5)).await;

        // When
        tick(&h).await;

        // Then
        let row = only_dispatch(&h, "b1").await;
        assert_eq!(row.status, DispatchStatus::Running);
        assert_eq!(row.tier, Tier::Fast);
        assert_eq!(row.provider, "haiku");
        assert_eq!(row.session_name.as_deref(), Some("fake-101"));
        let stage = h
            .db
            .get_bead_stage(&ProjectId::new("alpha"), &BeadId::new("b1"))
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| panic!("stage missing"));
        assert_eq!(stage.current_stage, "implement");
        let lease = h
            .db
            .get_claim_lease(&BeadId::new("b1"))
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| panic!("lease missing"));
        assert_eq!(lease.holder, "sched-test");
        assert_eq!(lease.dispatch_id, Some(row.id));
        assert_eq!(h.beads.labels("alpha", "b2").await, vec!["stage:plan"]);
    }

    #[tokio::test]
    async fn then_open_known_dependencies_block_and_unknown_ones_do_not() {
        // Given
        let h = harness(config()).await;
        h.beads.add(bead("b1", "alpha", 2, 5)).await;
        let mut blocked = bead("b2", "alpha", 0, 5);
        blocked.depends_on = vec![BeadId::new("b1")];
        h.beads.add(blocked).await;
        let mut dangling = bead("b3", "alpha", 0, 5);
        dangling.depends_on = vec![BeadId::new("ghost")];
        h.beads.add(dangling).await;

        // When
        let report = tick(&h).await;

        // Then
        assert_eq!(report.candidates, 2);
        assert!(h
            .db
            .get_dispatches_by_bead(&BeadId::new("b2"))
            .await
            .unwrap_or_default()
            .is_empty());
    }

    #[tokio::test]
    async fn then_project_concurrency_cap_is_respected() {
        // Given
        let mut cfg = config();
        if let Some(alpha) = cfg.projects.get_mut("alpha") {
            alpha.max_concurrent = 1;
        }
        let h = harness(cfg).await;
        h.beads.add(bead("b1", "alpha", 0, 5)).await;
        h.beads.add(bead("b2", "alpha", 1, 5)).await;

        // When
        let report = tick(&h).await;

        // Then
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.skipped_concurrency, 1);
    }

    #[tokio::test]
    async fn then_recently_dispatched_beads_wait_out_the_cooldown() {
        // Given
        let h = harness(SchedulerConfig {
            cooldown_secs: 300,
            ..config()
        })
        .await;
        h.beads.add(bead("b1", "alpha", 0, 5)).await;
        tick(&h).await;
        let first = only_dispatch(&h, "b1").await;
        complete(&h, first.id, DispatchOutcome::Completed).await;

        // When
        let report = tick(&h).await;

        // Then
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.skipped_cooldown, 1);
    }
}

mod given_the_same_bead_id_in_two_projects {
    use super::*;

    #[tokio::test]
    async fn then_only_one_is_claimed_per_tick() {
        // Given
        let mut cfg = config();
        cfg.projects.insert("beta".to_string(), project());
        let h = harness(cfg).await;
        h.beads.add(bead("b1", "alpha", 0, 5)).await;
        h.beads.add(bead("b1", "beta", 0, 5)).await;

        // When
        let report = tick(&h).await;

        // Then
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.skipped_contention, 1);
        assert_eq!(h.dispatcher.requests().await.len(), 1);
    }
}

mod given_concurrent_ticks {
    use super::*;

    #[tokio::test]
    async fn then_a_bead_is_dispatched_exactly_once() {
        // Given
        let h = harness(config()).await;
        h.beads.add(bead("b1", "alpha", 0, 5)).await;
        let rival = Scheduler::new(
            ConfigHandle::new(SchedulerConfig {
                holder: "sched-rival".to_string(),
                ..config()
            }),
            h.db.clone(),
            Arc::new(h.dispatcher.clone()),
            Arc::new(h.beads.clone()),
            Arc::new(h.liveness.clone()),
        );
        let cancel = CancellationToken::new();

        // When
        let (a, b) = tokio::join!(h.scheduler.run_tick(&cancel), rival.run_tick(&cancel));

        // Then
        let dispatched = a.map(|r| r.dispatched).unwrap_or(0) + b.map(|r| r.dispatched).unwrap_or(0);
        assert_eq!(dispatched, 1);
        assert_eq!(h.dispatcher.requests().await.len(), 1);
        assert!(h.db.has_active_dispatch(&BeadId::new("b1")).await.unwrap_or(false));
    }
}

mod given_a_quota_limit {
    use super::*;

    fn capped(strict: bool) -> SchedulerConfig {
        SchedulerConfig {
            rate_limits: RateLimitConfig {
                short_window: WindowConfig {
                    cap: 1,
                    headroom_pct: 100,
                    ..WindowConfig::default()
                },
                strict,
                ..RateLimitConfig::default()
            },
            ..config()
        }
    }

    #[tokio::test]
    async fn then_launches_stop_once_the_window_is_full() {
        for strict in [false, true] {
            // Given
            let h = harness(capped(strict)).await;
            h.beads.add(bead("b1", "alpha", 0, 5)).await;
            h.beads.add(bead("b2", "alpha", 1, 5)).await;

            // When
            let report = tick(&h).await;

            // Then
            assert_eq!(report.dispatched, 1, "strict={strict}");
            assert_eq!(report.skipped_quota, 1, "strict={strict}");
            assert!(h
                .db
                .get_claim_lease(&BeadId::new("b2"))
                .await
                .ok()
                .flatten()
                .is_none());
        }
    }
}

mod given_a_dispatcher_that_cannot_launch {
    use super::*;

    #[tokio::test]
    async fn then_the_attempt_is_recorded_failed_and_queued_for_retry() {
        // Given
        let h = harness(config()).await;
        h.beads.add(labelled(bead("b1", "alpha", 0, 5), "implement")).await;
        h.dispatcher.fail_launches(true).await;

        // When
        let report = tick(&h).await;

        // Then
        assert_eq!(report.launch_failures, 1);
        let row = only_dispatch(&h, "b1").await;
        assert_eq!(row.status, DispatchStatus::PendingRetry);
        assert_eq!(row.failure_category, Some(FailureCategory::DispatchError));
        assert_eq!(row.tier, Tier::Balanced);
        assert!(h.db.list_claim_leases().await.unwrap_or_default().is_empty());
        let events = h.db.get_recent_health_events(5).await.unwrap_or_default();
        assert!(events.iter().any(|e| e.kind == HealthEventKind::DispatchError));

        // When the dispatcher recovers
        h.dispatcher.fail_launches(false).await;
        let report = tick(&h).await;

        // Then the retry goes out at the escalated tier
        assert_eq!(report.retried, 1);
        let retry = only_dispatch(&h, "b1").await;
        assert_eq!(retry.tier, Tier::Balanced);
        assert_eq!(retry.escalated_from_tier, Some(Tier::Fast));
        assert_eq!(retry.status, DispatchStatus::Running);
    }
}

mod given_cancellation {
    use super::*;

    #[tokio::test]
    async fn then_a_cancelled_tick_launches_nothing() {
        // Given
        let h = harness(config()).await;
        h.beads.add(bead("b1", "alpha", 0, 5)).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        // When
        let report = h
            .scheduler
            .run_tick(&cancel)
            .await
            .unwrap_or_else(|e| panic!("tick failed: {e}"));

        // Then
        assert!(report.cancelled);
        assert!(h.db.list_claim_leases().await.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn then_a_launch_interrupted_by_shutdown_releases_its_lease() {
        // Given
        let h = harness(config()).await;
        h.beads.add(bead("b1", "alpha", 0, 5)).await;
        h.beads.add(bead("b2", "alpha", 1, 5)).await;
        let cancel = CancellationToken::new();
        h.dispatcher.state.lock().await.cancel_during_dispatch = Some(cancel.clone());

        // When
        let report = h
            .scheduler
            .run_tick(&cancel)
            .await
            .unwrap_or_else(|e| panic!("tick failed: {e}"));

        // Then
        assert!(report.cancelled);
        assert_eq!(report.dispatched, 0);
        assert!(h.db.list_claim_leases().await.unwrap_or_default().is_empty());
        assert!(h
            .db
            .get_dispatches_by_bead(&BeadId::new("b1"))
            .await
            .unwrap_or_default()
            .is_empty());
    }
}

mod given_repeated_failures {
    use super::*;

    #[tokio::test]
    async fn then_tiers_escalate_until_retries_are_exhausted() {
        // Given
        let h = harness(SchedulerConfig {
            retry: RetryPolicy::default(),
            cooldown_secs: 300,
            ..config()
        })
        .await;
        h.beads.add(labelled(bead("b1", "alpha", 0, 5), "implement")).await;

        // When the first attempt fails at fast
        tick(&h).await;
        let first = only_dispatch(&h, "b1").await;
        assert_eq!(first.tier, Tier::Fast);
        let result = complete(&h, first.id, failed()).await;

        // Then it is queued at balanced
        assert_eq!(
            result,
            CompletionResult::Failed {
                decision: RetryDecision::Retry {
                    next_tier: Tier::Balanced
                }
            }
        );

        // When the retry fails at balanced
        let report = tick(&h).await;
        assert_eq!(report.retried, 1);
        let second = only_dispatch(&h, "b1").await;
        assert_eq!(second.tier, Tier::Balanced);
        complete(&h, second.id, failed()).await;

        // Then it is queued at premium, remembering the original tier
        let queued = only_dispatch(&h, "b1").await;
        assert_eq!(queued.status, DispatchStatus::PendingRetry);
        assert_eq!(queued.tier, Tier::Premium);
        assert_eq!(queued.escalated_from_tier, Some(Tier::Fast));

        // When the third attempt fails
        tick(&h).await;
        let third = only_dispatch(&h, "b1").await;
        assert_eq!(third.tier, Tier::Premium);
        assert_eq!(third.retries, 2);
        let result = complete(&h, third.id, failed()).await;

        // Then it is terminal
        assert_eq!(
            result,
            CompletionResult::Failed {
                decision: RetryDecision::Exhausted
            }
        );
        let last = only_dispatch(&h, "b1").await;
        assert_eq!(last.status, DispatchStatus::Failed);
        assert_eq!(last.escalated_from_tier, Some(Tier::Fast));
        let report = tick(&h).await;
        assert_eq!(report.retried + report.dispatched, 0);
        let events = h.db.get_recent_health_events(10).await.unwrap_or_default();
        assert!(!events.iter().any(|e| e.kind == HealthEventKind::Quarantine));
    }

    #[tokio::test]
    async fn then_a_quarantined_bead_is_never_redispatched() {
        // Given
        let h = harness(SchedulerConfig {
            retry: RetryPolicy {
                max_retries: 1,
                failure_streak_threshold: 3,
                ..RetryPolicy::default()
            },
            ..config()
        })
        .await;
        h.beads.add(bead("b1", "alpha", 0, 5)).await;
        tick(&h).await;
        complete(&h, only_dispatch(&h, "b1").await.id, failed()).await;
        tick(&h).await;
        let requeued = complete(&h, only_dispatch(&h, "b1").await.id, DispatchOutcome::Interrupted).await;
        assert_eq!(
            requeued,
            CompletionResult::Failed {
                decision: RetryDecision::Requeue
            }
        );
        tick(&h).await;

        // When
        let result = complete(&h, only_dispatch(&h, "b1").await.id, failed()).await;
        let report = tick(&h).await;

        // Then
        assert_eq!(
            result,
            CompletionResult::Failed {
                decision: RetryDecision::Quarantine { streak: 3 }
            }
        );
        assert_eq!(report.dispatched + report.retried, 0);
        assert_eq!(report.skipped_quarantined, 1);
        let events = h.db.get_recent_health_events(5).await.unwrap_or_default();
        assert!(events.iter().any(|e| e.kind == HealthEventKind::Quarantine));
    }
}

mod given_a_finished_worker {
    use super::*;

    #[tokio::test]
    async fn then_success_advances_the_stage_and_writes_the_next_label() {
        // Given
        let h = harness(config()).await;
        h.beads.add(labelled(bead("b1", "alpha", 0, 5), "implement")).await;
        tick(&h).await;
        let row = only_dispatch(&h, "b1").await;

        // When
        let result = complete(&h, row.id, DispatchOutcome::Completed).await;

        // Then
        let CompletionResult::Advanced { stage: Some(stage) } = result else {
            panic!("expected an advanced stage, got {result:?}");
        };
        assert_eq!(stage.current_stage, "review");
        assert_eq!(h.beads.labels("alpha", "b1").await, vec!["stage:review"]);
        assert!(h.db.list_claim_leases().await.unwrap_or_default().is_empty());
        assert_eq!(
            complete(&h, row.id, DispatchOutcome::Completed).await,
            CompletionResult::AlreadyClosed
        );
    }

    #[tokio::test]
    async fn then_changes_requested_reverts_to_the_named_stage() {
        // Given
        let h = harness(config()).await;
        h.beads.add(labelled(bead("b1", "alpha", 0, 5), "review")).await;
        tick(&h).await;
        let row = only_dispatch(&h, "b1").await;

        // When
        let result = complete(
            &h,
            row.id,
            DispatchOutcome::ChangesRequested {
                revert_to: "implement".to_string(),
            },
        )
        .await;

        // Then
        let CompletionResult::Reverted { stage } = result else {
            panic!("expected a revert, got {result:?}");
        };
        assert_eq!(stage.current_stage, "implement");
        assert_eq!(stage.stage_index, 1);
        assert_eq!(h.beads.labels("alpha", "b1").await, vec!["stage:implement"]);
    }

    #[tokio::test]
    async fn then_a_rejected_stage_move_leaves_the_dispatch_open_and_claimed() {
        // Given
        let h = harness(config()).await;
        h.beads.add(labelled(bead("b1", "alpha", 0, 5), "implement")).await;
        tick(&h).await;
        let row = only_dispatch(&h, "b1").await;

        // When
        let rejected = h
            .scheduler
            .complete_dispatch(
                row.id,
                DispatchOutcome::ChangesRequested {
                    revert_to: "qa".to_string(),
                },
            )
            .await;

        // Then
        assert!(matches!(rejected, Err(SwarmError::StageError(_))));
        assert_eq!(only_dispatch(&h, "b1").await.status, DispatchStatus::Running);
        let stage = h
            .db
            .get_bead_stage(&ProjectId::new("alpha"), &BeadId::new("b1"))
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| panic!("stage missing"));
        assert_eq!(stage.current_stage, "implement");
        assert!(h
            .db
            .get_claim_lease(&BeadId::new("b1"))
            .await
            .ok()
            .flatten()
            .is_some());

        // When the completion is reported again
        let result = complete(&h, row.id, DispatchOutcome::Completed).await;

        // Then
        assert!(matches!(result, CompletionResult::Advanced { stage: Some(ref s) } if s.current_stage == "review"));
    }

    #[tokio::test]
    async fn then_the_final_stage_completes_the_pipeline() {
        // Given
        let h = harness(config()).await;
        h.beads.add(labelled(bead("b1", "alpha", 0, 5), "qa")).await;
        tick(&h).await;

        // When
        complete(&h, only_dispatch(&h, "b1").await.id, DispatchOutcome::Completed).await;
        let report = tick(&h).await;

        // Then
        let stage = h
            .db
            .get_bead_stage(&ProjectId::new("alpha"), &BeadId::new("b1"))
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| panic!("stage missing"));
        assert!(stage.completed);
        assert_eq!(report.dispatched, 0);
    }

    #[tokio::test]
    async fn then_reconcile_closes_exited_workers_and_ignores_unknown_ones() {
        // Given
        let h = harness(SchedulerConfig {
            cooldown_secs: 300,
            ..config()
        })
        .await;
        h.beads.add(labelled(bead("b-ok", "alpha", 0, 5), "implement")).await;
        h.beads.add(bead("b-bad", "alpha", 1, 5)).await;
        h.beads.add(bead("b-lost", "alpha", 2, 5)).await;
        tick(&h).await;
        let ok = only_dispatch(&h, "b-ok").await;
        let bad = only_dispatch(&h, "b-bad").await;
        let lost = only_dispatch(&h, "b-lost").await;
        for (row, code) in [(&ok, Some(0)), (&bad, Some(2))] {
            let handle = row.handle.unwrap_or_default();
            h.dispatcher.exit(handle, code).await;
            h.liveness.answer(handle, Liveness::Missing).await;
        }
        let lost_handle = lost.handle.unwrap_or_default();
        h.dispatcher.vanish(lost_handle).await;
        h.liveness.answer(lost_handle, Liveness::Missing).await;

        // When
        let report = tick(&h).await;

        // Then
        assert_eq!(report.reconciled, 2);
        assert_eq!(report.retried, 1);
        assert_eq!(only_dispatch(&h, "b-ok").await.status, DispatchStatus::Completed);
        let closed = h
            .db
            .get_dispatch_by_id(bad.id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| panic!("dispatch missing"));
        assert_eq!(closed.status, DispatchStatus::Retried);
        assert_eq!(closed.exit_code, Some(2));
        assert_eq!(only_dispatch(&h, "b-bad").await.tier, Tier::Premium);
        assert_eq!(only_dispatch(&h, "b-lost").await.status, DispatchStatus::Running);
        assert_eq!(h.beads.labels("alpha", "b-ok").await, vec!["stage:review"]);
    }
}

mod given_an_expired_lease {
    use super::*;
    use crate::health::HealthConfig;
    use std::time::Duration;

    fn sweeping_every_tick() -> SchedulerConfig {
        SchedulerConfig {
            health: HealthConfig {
                sweep_interval_secs: 0,
                ..HealthConfig::default()
            },
            ..config()
        }
    }

    #[tokio::test]
    async fn then_a_worker_of_unknown_liveness_is_not_launched_twice() {
        // Given
        let h = harness(sweeping_every_tick()).await;
        h.beads.add(bead("b1", "alpha", 0, 5)).await;
        tick(&h).await;
        let first = only_dispatch(&h, "b1").await;
        h.liveness
            .answer(first.handle.unwrap_or_default(), Liveness::Unknown)
            .await;
        h.db.backdate_lease(&BeadId::new("b1"), Duration::from_secs(7200))
            .await;

        // When
        let report = tick(&h).await;

        // Then
        assert_eq!(h.dispatcher.requests().await.len(), 1);
        assert!(h.dispatcher.killed().await.is_empty());
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.retried, 0);
        let rows = h
            .db
            .get_dispatches_by_bead(&BeadId::new("b1"))
            .await
            .unwrap_or_default();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, DispatchStatus::Running);
        let events = h.db.get_recent_health_events(10).await.unwrap_or_default();
        assert!(events.iter().any(|e| e.kind == HealthEventKind::LeaseUnverified));
    }

    #[tokio::test]
    async fn then_a_missing_worker_is_killed_before_the_bead_is_relaunched() {
        // Given
        let h = harness(sweeping_every_tick()).await;
        h.beads.add(bead("b1", "alpha", 0, 5)).await;
        tick(&h).await;
        let first = only_dispatch(&h, "b1").await;
        let handle = first.handle.unwrap_or_default();
        h.dispatcher.vanish(handle).await;
        h.liveness.answer(handle, Liveness::Missing).await;
        h.db.backdate_lease(&BeadId::new("b1"), Duration::from_secs(7200))
            .await;

        // When
        tick(&h).await;

        // Then
        assert_eq!(h.dispatcher.killed().await, vec![handle]);
        let old = h
            .db
            .get_dispatch_by_id(first.id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| panic!("dispatch missing"));
        assert_eq!(old.status, DispatchStatus::Retried);
        assert_eq!(old.failure_category, Some(FailureCategory::LeaseExpired));
        assert_eq!(only_dispatch(&h, "b1").await.status, DispatchStatus::Running);
        assert_eq!(h.dispatcher.requests().await.len(), 2);
    }
}
