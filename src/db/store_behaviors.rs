// BDD-style tests for the dispatch store.
// Focus on atomic dispatch writes, lease exclusivity, and retry bookkeeping.

use super::*;
use crate::labels::Labels;
use crate::types::{
    AgentId, BeadId, DispatchId, DispatchStatus, FailureCategory, ProjectId, StageAssignment,
    StageStatus, Tier, UsageEvent,
};
use crate::workflow::WorkflowDefinition;
use futures_util::future::join_all;
use std::time::Duration;

async fn store() -> SwarmDb {
    SwarmDb::in_memory()
        .await
        .unwrap_or_else(|e| panic!("open failed: {e}"))
}

fn record(bead: &str, project: &str) -> SchedulerDispatchRecord {
    SchedulerDispatchRecord {
        bead_id: BeadId::new(bead),
        project: ProjectId::new(project),
        agent_id: AgentId::new(format!("{project}-coder")),
        provider: "claude".to_string(),
        tier: Tier::Fast,
        handle: Some(4242),
        session_name: Some(format!("swarm-{bead}")),
        prompt: "do the work".to_string(),
        workdir: "/tmp/work".to_string(),
        labels: Labels::parse("area:core, area:core,stage:plan"),
        stage: WorkflowDefinition::standard().resolve(Some("implement")),
        retries: 0,
        escalated_from_tier: None,
        retry_of: None,
    }
}

async fn count(db: &SwarmDb, table: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(db.pool())
        .await
        .unwrap_or_else(|e| panic!("count {table} failed: {e}"))
}

async fn dispatch(db: &SwarmDb, id: DispatchId) -> crate::types::Dispatch {
    db.get_dispatch_by_id(id)
        .await
        .unwrap_or_else(|e| panic!("load failed: {e}"))
        .unwrap_or_else(|| panic!("dispatch {id} missing"))
}

mod recording_a_dispatch {
    use super::*;

    #[tokio::test]
    async fn then_row_stage_history_labels_and_lease_link_are_written_together() {
        // Given
        let db = store().await;
        let rec = record("b-1", "alpha");
        db.acquire_claim_lease(&rec.bead_id, &rec.project, "/tmp/work", "sched")
            .await
            .unwrap_or_else(|e| panic!("claim failed: {e}"));

        // When
        let id = db
            .record_scheduler_dispatch(&rec)
            .await
            .unwrap_or_else(|e| panic!("record failed: {e}"));

        // Then
        let row = dispatch(&db, id).await;
        assert_eq!(row.status, DispatchStatus::Running);
        assert_eq!(row.stage, DispatchStatus::Dispatched);
        assert_eq!(row.labels, vec!["area:core", "stage:implement"]);

        let stage = db
            .get_bead_stage(&rec.project, &rec.bead_id)
            .await
            .unwrap_or_else(|e| panic!("stage failed: {e}"))
            .unwrap_or_else(|| panic!("stage missing"));
        assert_eq!(stage.current_stage, "implement");
        assert_eq!(stage.stage_index, 1);
        assert_eq!(stage.history.len(), 1);
        assert_eq!(stage.history[0].dispatch_id, Some(id));

        let lease = db
            .get_claim_lease(&rec.bead_id)
            .await
            .unwrap_or_else(|e| panic!("lease failed: {e}"))
            .unwrap_or_else(|| panic!("lease missing"));
        assert_eq!(lease.dispatch_id, Some(id));
    }

    #[tokio::test]
    async fn then_labels_containing_commas_read_back_whole() {
        // Given
        let db = store().await;
        let rec = SchedulerDispatchRecord {
            labels: Labels::new(["note:split,here", "area:core"]),
            ..record("b-comma", "alpha")
        };

        // When
        let id = db
            .record_scheduler_dispatch(&rec)
            .await
            .unwrap_or_else(|e| panic!("record failed: {e}"));

        // Then
        assert_eq!(
            dispatch(&db, id).await.labels,
            vec!["note:split,here", "area:core", "stage:implement"]
        );
    }

    mod given_a_fault_at_any_checkpoint {
        use super::*;
        use std::sync::Arc;

        #[tokio::test]
        async fn then_no_partial_rows_remain_and_the_retry_succeeds() {
            for checkpoint in FaultCheckpoint::ALL {
                // Given
                let injector = Arc::new(FailOnceAt::new(checkpoint));
                let db = store().await.with_fault_injector(injector.clone());
                let rec = record("b-fault", "alpha");

                // When
                let first = db.record_scheduler_dispatch(&rec).await;

                // Then
                assert!(
                    matches!(first, Err(ref e) if e.is_transient()),
                    "{checkpoint}: expected transient failure, got {first:?}"
                );
                assert!(injector.has_fired());
                assert_eq!(count(&db, "dispatches").await, 0, "{checkpoint}: dispatch row leaked");
                assert_eq!(count(&db, "bead_stages").await, 0, "{checkpoint}: stage row leaked");
                assert_eq!(count(&db, "bead_stage_history").await, 0, "{checkpoint}: history leaked");

                let retried = db.record_scheduler_dispatch(&rec).await;
                assert!(retried.is_ok(), "{checkpoint}: retry failed: {retried:?}");
                assert_eq!(count(&db, "dispatches").await, 1);
                assert_eq!(count(&db, "bead_stages").await, 1);
            }
        }
    }

    #[tokio::test]
    async fn then_a_retry_attempt_replaces_its_pending_row_exactly_once() {
        // Given
        let db = store().await;
        let first = db
            .record_scheduler_dispatch(&record("b-2", "alpha"))
            .await
            .unwrap_or_else(|e| panic!("record failed: {e}"));
        db.update_dispatch_failure(
            first,
            DispatchStatus::Failed,
            FailureCategory::ProcessError,
            "exit 1",
            Some(1),
        )
        .await
        .unwrap_or_else(|e| panic!("fail failed: {e}"));
        db.mark_dispatch_pending_retry(first, Tier::Balanced)
            .await
            .unwrap_or_else(|e| panic!("pending failed: {e}"));

        // When
        let mut retry = record("b-2", "alpha");
        retry.retry_of = Some(first);
        retry.tier = Tier::Balanced;
        let second = db.record_scheduler_dispatch(&retry).await;
        let third = db.record_scheduler_dispatch(&retry).await;

        // Then
        assert!(second.is_ok());
        assert!(third.is_err(), "a replaced row must not be retried twice");
        assert_eq!(dispatch(&db, first).await.status, DispatchStatus::Retried);
        assert_eq!(count(&db, "dispatches").await, 2);
    }
}

mod claiming_leases {
    use super::*;

    #[tokio::test]
    async fn then_exactly_one_of_many_concurrent_claims_wins() {
        // Given
        let db = store().await;
        let bead = BeadId::new("b-race");
        let project = ProjectId::new("alpha");

        // When
        let attempts = (0..16).map(|n| {
            let db = db.clone();
            let bead = bead.clone();
            let project = project.clone();
            async move {
                db.acquire_claim_lease(&bead, &project, "/tmp", &format!("holder-{n}"))
                    .await
            }
        });
        let results = join_all(attempts).await;

        // Then
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(crate::SwarmError::is_contention));
    }

    #[tokio::test]
    async fn then_reclaim_only_removes_a_lease_whose_heartbeat_has_not_moved() {
        // Given
        let db = store().await;
        let bead = BeadId::new("b-stale");
        let lease = db
            .acquire_claim_lease(&bead, &ProjectId::new("alpha"), "/tmp", "sched")
            .await
            .unwrap_or_else(|e| panic!("claim failed: {e}"));
        db.backdate_lease(&bead, Duration::from_secs(600)).await;

        // When
        let stale = db
            .get_expired_claim_leases(Duration::from_secs(300))
            .await
            .unwrap_or_else(|e| panic!("expired failed: {e}"));

        // Then
        assert_eq!(stale.len(), 1);
        let wrong_observation = db
            .reclaim_claim_lease(&bead, lease.heartbeat_at)
            .await
            .unwrap_or_else(|e| panic!("reclaim failed: {e}"));
        assert!(!wrong_observation);
        let reclaimed = db
            .reclaim_claim_lease(&bead, stale[0].heartbeat_at)
            .await
            .unwrap_or_else(|e| panic!("reclaim failed: {e}"));
        assert!(reclaimed);
    }
}

mod retry_bookkeeping {
    use super::*;

    #[tokio::test]
    async fn then_escalated_from_tier_keeps_the_first_tier_change() {
        // Given
        let db = store().await;
        let id = db
            .record_scheduler_dispatch(&record("b-3", "alpha"))
            .await
            .unwrap_or_else(|e| panic!("record failed: {e}"));

        // When
        db.mark_dispatch_pending_retry(id, Tier::Balanced)
            .await
            .unwrap_or_else(|e| panic!("pending failed: {e}"));
        let again = db
            .mark_dispatch_pending_retry(id, Tier::Premium)
            .await
            .unwrap_or_else(|e| panic!("pending failed: {e}"));

        // Then
        let row = dispatch(&db, id).await;
        assert!(!again, "a queued row is not queued twice");
        assert_eq!(row.retries, 1);
        assert_eq!(row.tier, Tier::Balanced);
        assert_eq!(row.escalated_from_tier, Some(Tier::Fast));
        assert_eq!(row.stage, DispatchStatus::PendingRetry);
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn then_same_tier_retry_leaves_escalation_empty() {
        let db = store().await;
        let mut rec = record("b-4", "alpha");
        rec.tier = Tier::Premium;
        let id = db
            .record_scheduler_dispatch(&rec)
            .await
            .unwrap_or_else(|e| panic!("record failed: {e}"));

        db.mark_dispatch_pending_retry(id, Tier::Premium)
            .await
            .unwrap_or_else(|e| panic!("pending failed: {e}"));

        assert_eq!(dispatch(&db, id).await.escalated_from_tier, None);
    }

    #[tokio::test]
    async fn then_failure_streak_stops_at_the_newest_success() {
        // Given
        let db = store().await;
        let bead = BeadId::new("b-5");
        let statuses = [
            DispatchStatus::Completed,
            DispatchStatus::Failed,
            DispatchStatus::Cancelled,
            DispatchStatus::Failed,
        ];
        for status in statuses {
            let id = db
                .record_scheduler_dispatch(&record("b-5", "alpha"))
                .await
                .unwrap_or_else(|e| panic!("record failed: {e}"));
            db.update_dispatch_status(id, status, None)
                .await
                .unwrap_or_else(|e| panic!("status failed: {e}"));
            tokio::time::sleep(Duration::from_millis(3)).await;
        }

        // When
        let streak = db
            .count_consecutive_failures(&bead, Duration::from_secs(3600))
            .await
            .unwrap_or_else(|e| panic!("streak failed: {e}"));

        // Then
        assert_eq!(streak, 3);
    }

    #[tokio::test]
    async fn then_closed_dispatches_do_not_reopen() {
        let db = store().await;
        let id = db
            .record_scheduler_dispatch(&record("b-6", "alpha"))
            .await
            .unwrap_or_else(|e| panic!("record failed: {e}"));

        let first = db.update_dispatch_status(id, DispatchStatus::Completed, Some(0)).await;
        let second = db.update_dispatch_status(id, DispatchStatus::Failed, Some(1)).await;

        assert!(matches!(first, Ok(true)));
        assert!(matches!(second, Ok(false)));
        let row = dispatch(&db, id).await;
        assert_eq!(row.status, DispatchStatus::Completed);
        assert_eq!(row.exit_code, Some(0));
        assert!(row.duration_s.is_some());
    }

    #[tokio::test]
    async fn then_worker_reported_stage_pr_and_usage_are_stored() {
        // Given
        let db = store().await;
        let id = db
            .record_scheduler_dispatch(&record("b-report", "alpha"))
            .await
            .unwrap_or_else(|e| panic!("record failed: {e}"));

        // When
        db.update_dispatch_stage(id, DispatchStatus::Running)
            .await
            .unwrap_or_else(|e| panic!("stage failed: {e}"));
        db.update_dispatch_pr(id, "https://git.example/pr/17", Some(17))
            .await
            .unwrap_or_else(|e| panic!("pr failed: {e}"));
        db.update_dispatch_usage(
            id,
            DispatchUsage {
                input_tokens: 1200,
                output_tokens: 340,
                cost_usd: 0.25,
            },
        )
        .await
        .unwrap_or_else(|e| panic!("usage failed: {e}"));

        // Then
        let row = dispatch(&db, id).await;
        assert_eq!(row.stage, DispatchStatus::Running);
        assert_eq!(row.status, DispatchStatus::Running);
        assert_eq!(row.pr_url.as_deref(), Some("https://git.example/pr/17"));
        assert_eq!(row.pr_number, Some(17));
        assert_eq!((row.input_tokens, row.output_tokens), (1200, 340));
        assert!((row.cost_usd - 0.25).abs() < f64::EPSILON);
        let missing = DispatchId::new(999);
        assert!(db.update_dispatch_stage(missing, DispatchStatus::Running).await.is_err());
        assert!(db.update_dispatch_pr(missing, "x", None).await.is_err());
        assert!(db
            .update_dispatch_usage(missing, DispatchUsage::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn then_the_cooldown_window_expires_and_a_zero_window_never_blocks() {
        // Given
        let db = store().await;
        let bead = BeadId::new("b-cool");
        let id = db
            .record_scheduler_dispatch(&record("b-cool", "alpha"))
            .await
            .unwrap_or_else(|e| panic!("record failed: {e}"));
        let window = Duration::from_secs(300);

        // Then
        assert!(matches!(db.was_bead_dispatched_recently(&bead, window).await, Ok(true)));
        assert!(matches!(
            db.was_bead_dispatched_recently(&bead, Duration::ZERO).await,
            Ok(false)
        ));

        // When the dispatch ages past the window
        db.backdate_dispatch(id, Duration::from_secs(600)).await;

        // Then
        assert!(matches!(db.was_bead_dispatched_recently(&bead, window).await, Ok(false)));
        assert!(matches!(
            db.was_bead_dispatched_recently(&bead, Duration::from_secs(900)).await,
            Ok(true)
        ));
    }

    #[tokio::test]
    async fn then_missing_dispatches_are_reported() {
        let db = store().await;
        let result = db
            .update_dispatch_status(DispatchId::new(999), DispatchStatus::Failed, None)
            .await;
        assert!(result.is_err());
    }
}

mod stage_progression {
    use super::*;

    #[tokio::test]
    async fn then_advance_and_revert_move_the_bead_and_keep_history() {
        // Given
        let db = store().await;
        let workflow = WorkflowDefinition::standard();
        let rec = record("b-7", "alpha");
        let id = db
            .record_scheduler_dispatch(&rec)
            .await
            .unwrap_or_else(|e| panic!("record failed: {e}"));

        // When
        let advanced = db
            .advance_bead_stage(&rec.project, &rec.bead_id, &workflow)
            .await
            .unwrap_or_else(|e| panic!("advance failed: {e}"));
        let reverted = db
            .revert_bead_stage(&rec.project, &rec.bead_id, &workflow, "implement")
            .await
            .unwrap_or_else(|e| panic!("revert failed: {e}"));

        // Then
        assert_eq!(advanced.current_stage, "review");
        assert_eq!(advanced.history[0].status, StageStatus::Passed);
        assert_eq!(advanced.history[0].dispatch_id, Some(id));
        assert_eq!(reverted.current_stage, "implement");
        assert_eq!(reverted.stage_index, 1);
        assert_eq!(
            reverted.history.last().map(|entry| entry.status),
            Some(StageStatus::Reverted)
        );
        let forward = db
            .revert_bead_stage(&rec.project, &rec.bead_id, &workflow, "qa")
            .await;
        assert!(forward.is_err());
    }

    #[tokio::test]
    async fn then_the_final_stage_completes_the_pipeline() {
        let db = store().await;
        let workflow = WorkflowDefinition::standard();
        let project = ProjectId::new("alpha");
        let bead = BeadId::new("b-8");
        let qa = StageAssignment {
            workflow: workflow.name.clone(),
            stage: "qa".to_string(),
            stage_index: 3,
            total_stages: 4,
        };
        db.upsert_bead_stage(&project, &bead, &qa)
            .await
            .unwrap_or_else(|e| panic!("upsert failed: {e}"));

        let done = db
            .advance_bead_stage(&project, &bead, &workflow)
            .await
            .unwrap_or_else(|e| panic!("advance failed: {e}"));

        assert!(done.completed);
        assert_eq!(done.current_stage, "qa");
        assert!(db.advance_bead_stage(&project, &bead, &workflow).await.is_err());
    }

    #[tokio::test]
    async fn then_moving_one_projects_bead_leaves_the_same_id_elsewhere_alone() {
        // Given
        let db = store().await;
        let workflow = WorkflowDefinition::standard();
        let (alpha, beta) = (ProjectId::new("alpha"), ProjectId::new("beta"));
        let shared = BeadId::new("shared");
        for project in ["alpha", "beta"] {
            db.record_scheduler_dispatch(&record("shared", project))
                .await
                .unwrap_or_else(|e| panic!("record failed: {e}"));
        }
        let before = db
            .get_bead_stage(&beta, &shared)
            .await
            .unwrap_or_else(|e| panic!("stage failed: {e}"))
            .unwrap_or_else(|| panic!("beta stage missing"));

        // When
        let review = StageAssignment {
            workflow: workflow.name.clone(),
            stage: "review".to_string(),
            stage_index: 2,
            total_stages: 4,
        };
        db.upsert_bead_stage(&alpha, &shared, &review)
            .await
            .unwrap_or_else(|e| panic!("upsert failed: {e}"));
        let advanced = db
            .advance_bead_stage(&alpha, &shared, &workflow)
            .await
            .unwrap_or_else(|e| panic!("advance failed: {e}"));

        // Then
        assert_eq!(advanced.current_stage, "qa");
        let after = db
            .get_bead_stage(&beta, &shared)
            .await
            .unwrap_or_else(|e| panic!("stage failed: {e}"))
            .unwrap_or_else(|| panic!("beta stage missing"));
        assert_eq!(after.current_stage, "implement");
        assert_eq!(after.stage_index, before.stage_index);
        assert_eq!(after.history.len(), before.history.len());
        assert_eq!(after.history[0].status, StageStatus::Started);
    }

    #[tokio::test]
    async fn then_completion_and_stage_move_commit_or_roll_back_together() {
        // Given
        let db = store().await;
        let workflow = WorkflowDefinition::standard();
        let rec = record("b-done", "alpha");
        db.acquire_claim_lease(&rec.bead_id, &rec.project, "/tmp/work", "sched")
            .await
            .unwrap_or_else(|e| panic!("claim failed: {e}"));
        let id = db
            .record_scheduler_dispatch(&rec)
            .await
            .unwrap_or_else(|e| panic!("record failed: {e}"));
        let forward = StageTransition::Revert {
            workflow: &workflow,
            to_stage: "qa",
        };

        // When the stage move is rejected
        let rejected = db
            .complete_dispatch_with_stage(id, &rec.project, &rec.bead_id, Some(forward))
            .await;

        // Then nothing was written
        assert!(rejected.is_err());
        assert_eq!(dispatch(&db, id).await.status, DispatchStatus::Running);
        assert!(db.get_claim_lease(&rec.bead_id).await.ok().flatten().is_some());

        // When the completion advances the stage
        let applied = db
            .complete_dispatch_with_stage(id, &rec.project, &rec.bead_id, Some(StageTransition::Advance(&workflow)))
            .await
            .unwrap_or_else(|e| panic!("complete failed: {e}"));

        // Then all three writes landed
        assert!(applied);
        let row = dispatch(&db, id).await;
        assert_eq!(row.status, DispatchStatus::Completed);
        assert_eq!(row.exit_code, Some(0));
        let stage = db
            .get_bead_stage(&rec.project, &rec.bead_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| panic!("stage missing"));
        assert_eq!(stage.current_stage, "review");
        assert!(db.get_claim_lease(&rec.bead_id).await.ok().flatten().is_none());
        let again = db
            .complete_dispatch_with_stage(id, &rec.project, &rec.bead_id, Some(StageTransition::Advance(&workflow)))
            .await;
        assert!(matches!(again, Ok(false)));
        assert_eq!(
            db.get_bead_stage(&rec.project, &rec.bead_id)
                .await
                .ok()
                .flatten()
                .map(|s| s.current_stage),
            Some("review".to_string())
        );
    }

    #[tokio::test]
    async fn then_identical_bead_ids_in_two_projects_are_ambiguous_by_id() {
        // Given
        let db = store().await;
        for project in ["alpha", "beta"] {
            db.record_scheduler_dispatch(&record("shared", project))
                .await
                .unwrap_or_else(|e| panic!("record failed: {e}"));
        }

        // When
        let scoped = db
            .get_bead_stage(&ProjectId::new("beta"), &BeadId::new("shared"))
            .await
            .unwrap_or_else(|e| panic!("stage failed: {e}"));
        let by_id = db.get_bead_stage_by_bead_id(&BeadId::new("shared")).await;

        // Then
        assert!(scoped.is_some_and(|stage| stage.project.value() == "beta"));
        assert!(matches!(
            by_id,
            Err(crate::SwarmError::AmbiguousBead { ref projects, .. }) if projects.len() == 2
        ));
        let deleted = db
            .delete_bead_stage(&ProjectId::new("alpha"), &BeadId::new("shared"))
            .await
            .unwrap_or_else(|e| panic!("delete failed: {e}"));
        assert!(deleted);
        let remaining = db.get_bead_stage_by_bead_id(&BeadId::new("shared")).await;
        assert!(matches!(remaining, Ok(Some(_))));
    }
}

mod gate_and_usage {
    use super::*;
    use chrono::Utc;

    fn usage(bead: &str) -> UsageEvent {
        UsageEvent {
            provider: "claude".to_string(),
            agent_id: AgentId::new("alpha-coder"),
            bead_id: BeadId::new(bead),
            input_tokens: 0,
            output_tokens: 0,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn then_gate_opens_and_closes() {
        let db = store().await;
        assert!(!db.is_plan_gate_open().await.unwrap_or(true));
        assert!(db.activate_plan("  ", "ops").await.is_err());

        db.activate_plan("plan-1", "ops")
            .await
            .unwrap_or_else(|e| panic!("activate failed: {e}"));
        assert!(db.is_plan_gate_open().await.unwrap_or(false));

        assert!(db.clear_plan().await.unwrap_or(false));
        assert!(!db.is_plan_gate_open().await.unwrap_or(true));
    }

    #[tokio::test]
    async fn then_strict_reservation_never_exceeds_the_cap() {
        // Given
        let db = store().await;
        let window = WindowCap {
            since_ms: 0,
            cap: Some(3),
        };
        let open = WindowCap {
            since_ms: 0,
            cap: None,
        };

        // When
        let mut landed = 0;
        for n in 0..5 {
            if db
                .record_authed_usage_within(&usage(&format!("b-{n}")), window, open)
                .await
                .unwrap_or_else(|e| panic!("reserve failed: {e}"))
            {
                landed += 1;
            }
        }

        // Then
        assert_eq!(landed, 3);
        assert_eq!(
            db.count_authed_usage_within(Duration::from_secs(60))
                .await
                .unwrap_or(0),
            3
        );
    }

    #[tokio::test]
    async fn then_old_usage_falls_out_of_the_window() {
        let db = store().await;
        db.record_usage_event(&usage("b-old"), true)
            .await
            .unwrap_or_else(|e| panic!("usage failed: {e}"));
        db.record_usage_event(&usage("b-free"), false)
            .await
            .unwrap_or_else(|e| panic!("usage failed: {e}"));
        db.backdate_usage(Duration::from_secs(7200)).await;
        db.record_usage_event(&usage("b-new"), true)
            .await
            .unwrap_or_else(|e| panic!("usage failed: {e}"));

        let counts = db
            .usage_counts(Duration::from_secs(3600), Duration::from_secs(86_400))
            .await
            .unwrap_or_else(|e| panic!("counts failed: {e}"));

        assert_eq!(counts.short_window, 1);
        assert_eq!(counts.long_window, 2);
    }

    #[tokio::test]
    async fn then_allocation_groups_active_dispatches() {
        let db = store().await;
        for (bead, project) in [("b-a", "alpha"), ("b-b", "alpha"), ("b-c", "beta")] {
            db.record_scheduler_dispatch(&record(bead, project))
                .await
                .unwrap_or_else(|e| panic!("record failed: {e}"));
        }
        let done = db
            .record_scheduler_dispatch(&record("b-d", "beta"))
            .await
            .unwrap_or_else(|e| panic!("record failed: {e}"));
        db.update_dispatch_status(done, DispatchStatus::Completed, Some(0))
            .await
            .unwrap_or_else(|e| panic!("status failed: {e}"));

        let allocation = db
            .get_current_allocation()
            .await
            .unwrap_or_else(|e| panic!("allocation failed: {e}"));

        assert_eq!(allocation.total_active, 3);
        assert_eq!(allocation.by_project.get("alpha"), Some(&2));
        assert_eq!(allocation.by_tier.get("fast"), Some(&3));
        assert_eq!(
            db.count_active_dispatches(&ProjectId::new("beta")).await.unwrap_or(0),
            1
        );
    }
}
