//! Plan generation integration: ordering, determinism modulo the LLM,
//! fallback, spam exclusion, and regeneration semantics.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::{at, harness, t0, HarnessOptions, StubChatter};
use dayflow::cancel::CancelSignal;
use dayflow::error::CoreError;
use dayflow::store::Store;
use dayflow::types::{Priority, TaskDraft, TaskSource, UserId};

fn date() -> chrono::NaiveDate {
    t0().date_naive()
}

async fn seed_task(
    store: &Store,
    user: &UserId,
    id: &str,
    title: &str,
    hour: u32,
    priority: Priority,
    critical: bool,
    urgent: bool,
    spam: bool,
) -> String {
    let draft = TaskDraft {
        title: title.to_owned(),
        description: None,
        start: at(hour, 0),
        end: at(hour, 30),
        attendees: vec![],
        location: None,
        recurrence: None,
        priority,
        is_critical: critical,
        is_urgent: urgent,
        is_spam: spam,
        spam_reason: spam.then(|| "promotional".to_owned()),
        spam_score: spam.then_some(0.9),
        raw_payload: json!({}),
        external_id: Some(id.to_owned()),
        external_updated_at: None,
    };
    let (task_id, _) = store
        .upsert_ingested_task(user, TaskSource::Calendar, &draft, t0())
        .await
        .expect("seed");
    task_id
}

/// Stub that answers every planner request with full coverage.
fn covering_stub(entries: &[(&str, Vec<&str>)]) -> Arc<StubChatter> {
    let body = json!({
        "entries": entries
            .iter()
            .map(|(id, steps)| json!({"task_id": id, "action_plan": steps}))
            .collect::<Vec<_>>()
    });
    Arc::new(StubChatter::always(&body.to_string()))
}

#[tokio::test]
async fn energy_two_with_critical_urgent_normal_orders_by_score() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");

    let tc = seed_task(&h.store, &user, "tc", "Critical fix", 10, Priority::High, true, false, false).await;
    let tu = seed_task(&h.store, &user, "tu", "Urgent call", 11, Priority::Normal, false, true, false).await;
    let tn = seed_task(&h.store, &user, "tn", "Normal chore", 14, Priority::Normal, false, false, false).await;

    h.core.set_energy(&user, date(), 2).await.expect("energy");

    // Rebuild the core with a covering stub for the three ids.
    let h = {
        let chatter = covering_stub(&[
            (tc.as_str(), vec!["open incident", "ship fix"]),
            (tu.as_str(), vec!["dial in"]),
            (tn.as_str(), vec!["do the thing"]),
        ]);
        let mut options = HarnessOptions::default();
        options.chatter = Some(chatter);
        rebuild_with_store(h, options).await
    };

    let plan = h
        .core
        .generate_plan(&user, date(), &CancelSignal::never())
        .await
        .expect("plan");

    let order: Vec<&str> = plan.entries.iter().map(|e| e.task_id.as_str()).collect();
    assert_eq!(order, vec![tc.as_str(), tu.as_str(), tn.as_str()]);
    assert!(plan.entries[0].priority_score > plan.entries[1].priority_score);
    assert!(plan.entries[1].priority_score > plan.entries[2].priority_score);
    assert_eq!(plan.energy_level, Some(2));
    for entry in &plan.entries {
        assert!(
            (1..=6).contains(&entry.action_plan.len()),
            "action plans carry 1-6 steps"
        );
    }
}

/// Keep the same store but swap collaborators (chatter) on a new core.
async fn rebuild_with_store(
    h: common::Harness,
    mut options: HarnessOptions,
) -> common::Harness {
    use dayflow::core::{Collaborators, Core};
    let collab = Collaborators {
        chatter: options.chatter.take(),
        embedder: None,
        vectors: None,
        sources: std::collections::HashMap::new(),
        task_manager: h.task_manager.clone(),
        refresher: Arc::new(common::MockRefresher { succeed: true }),
        mailer: None,
        clock: Arc::new(h.clock.clone()),
    };
    let core = Core::new(h.store.clone(), Default::default(), collab).expect("core");
    common::Harness {
        core,
        store: h.store,
        clock: h.clock,
        task_manager: h.task_manager,
    }
}

#[tokio::test]
async fn identical_inputs_and_stub_produce_identical_plans() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");
    let a = seed_task(&h.store, &user, "a", "Alpha", 9, Priority::High, false, false, false).await;
    let b = seed_task(&h.store, &user, "b", "Beta", 12, Priority::Low, false, false, false).await;

    let h = {
        let mut options = HarnessOptions::default();
        options.chatter = Some(covering_stub(&[
            (a.as_str(), vec!["one"]),
            (b.as_str(), vec!["two"]),
        ]));
        rebuild_with_store(h, options).await
    };

    let first = h
        .core
        .generate_plan(&user, date(), &CancelSignal::never())
        .await
        .expect("first");
    let second = h
        .core
        .generate_plan(&user, date(), &CancelSignal::never())
        .await
        .expect("second");

    let view = |p: &dayflow::types::DailyPlan| {
        p.entries
            .iter()
            .map(|e| {
                (
                    e.task_id.clone(),
                    e.title.clone(),
                    e.predicted_start,
                    e.predicted_end,
                    e.priority_score.to_bits(),
                    e.action_plan.clone(),
                )
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(view(&first), view(&second), "byte-identical entries");
    assert_ne!(first.id, second.id, "regeneration mints a fresh plan id");
}

#[tokio::test]
async fn llm_failure_falls_back_to_deterministic_plan() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");
    seed_task(&h.store, &user, "a", "Alpha", 9, Priority::High, false, false, false).await;
    seed_task(&h.store, &user, "b", "Beta", 12, Priority::Low, false, false, false).await;

    let h = {
        let mut options = HarnessOptions::default();
        options.chatter = Some(Arc::new(StubChatter::failing()));
        rebuild_with_store(h, options).await
    };

    let plan = h
        .core
        .generate_plan(&user, date(), &CancelSignal::never())
        .await
        .expect("fallback plan");
    assert_eq!(plan.entries.len(), 2);
    assert!(
        plan.entries.iter().all(|e| e.action_plan.is_empty()),
        "fallback omits action plans"
    );
    // Score order still holds.
    assert!(plan.entries[0].priority_score >= plan.entries[1].priority_score);
}

#[tokio::test]
async fn malformed_llm_output_retries_then_falls_back() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");
    seed_task(&h.store, &user, "a", "Alpha", 9, Priority::High, false, false, false).await;

    let stub = Arc::new(StubChatter::new(vec![
        Ok("not json".to_owned()),
        Ok("still not json".to_owned()),
    ]));
    let h = {
        let mut options = HarnessOptions::default();
        options.chatter = Some(stub.clone());
        rebuild_with_store(h, options).await
    };

    let plan = h
        .core
        .generate_plan(&user, date(), &CancelSignal::never())
        .await
        .expect("plan generates");
    assert_eq!(
        stub.calls.load(std::sync::atomic::Ordering::SeqCst),
        2,
        "one corrective retry before the deterministic fallback"
    );
    assert!(plan.entries[0].action_plan.is_empty());
}

#[tokio::test]
async fn spam_tasks_never_appear_in_plans() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");
    seed_task(&h.store, &user, "ham", "Real work", 10, Priority::Normal, false, false, false).await;
    seed_task(&h.store, &user, "spam", "50% off!", 11, Priority::Low, false, false, true).await;

    let plan = h
        .core
        .generate_plan(&user, date(), &CancelSignal::never())
        .await
        .expect("plan");
    assert_eq!(plan.entries.len(), 1);
    assert_eq!(plan.entries[0].title, "Real work");
}

#[tokio::test]
async fn promo_title_post_filter_drops_entry() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");
    // Not flagged spam (slipped through extraction) but promotional title.
    seed_task(&h.store, &user, "sneaky", "Flash sale: 70% off", 10, Priority::Normal, false, false, false).await;
    seed_task(&h.store, &user, "real", "Write report", 11, Priority::Normal, false, false, false).await;

    let plan = h
        .core
        .generate_plan(&user, date(), &CancelSignal::never())
        .await
        .expect("plan");
    assert_eq!(plan.entries.len(), 1, "promotional title filtered post-LLM");
    assert_eq!(plan.entries[0].title, "Write report");
}

#[tokio::test]
async fn completed_tasks_are_not_planned() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");
    let done = seed_task(&h.store, &user, "done", "Already done", 10, Priority::High, false, false, false).await;
    let open = seed_task(&h.store, &user, "open", "Still open", 11, Priority::Normal, false, false, false).await;

    h.core
        .update_task_flags(
            &user,
            &done,
            dayflow::types::TaskFlags {
                is_completed: Some(true),
                ..Default::default()
            },
        )
        .await
        .expect("complete");

    let plan = h
        .core
        .generate_plan(&user, date(), &CancelSignal::never())
        .await
        .expect("plan");
    assert_eq!(plan.entries.len(), 1);
    assert_eq!(plan.entries[0].task_id, open);
}

#[tokio::test]
async fn blocked_task_is_pushed_to_end_of_day() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");
    // Dependent ends late enough that the end-of-day push still fits.
    let dependent = {
        let draft = TaskDraft {
            title: "Dependent".to_owned(),
            description: None,
            start: at(9, 0),
            end: at(15, 0),
            attendees: vec![],
            location: None,
            recurrence: None,
            priority: Priority::Normal,
            is_critical: false,
            is_urgent: false,
            is_spam: false,
            spam_reason: None,
            spam_score: None,
            raw_payload: json!({}),
            external_id: Some("dep".to_owned()),
            external_updated_at: None,
        };
        let (id, _) = h
            .store
            .upsert_ingested_task(&user, TaskSource::Calendar, &draft, t0())
            .await
            .expect("seed");
        id
    };
    let blocker = seed_task(&h.store, &user, "blk", "Blocker", 10, Priority::Normal, false, false, false).await;
    h.core
        .add_task_dependency(&user, &dependent, &blocker, dayflow::types::DependencyKind::DependsOn)
        .await
        .expect("edge");

    let plan = h
        .core
        .generate_plan(&user, date(), &CancelSignal::never())
        .await
        .expect("plan");
    let dep_entry = plan
        .entries
        .iter()
        .find(|e| e.task_id == dependent)
        .expect("dependent still planned");
    let blk_entry = plan
        .entries
        .iter()
        .find(|e| e.task_id == blocker)
        .expect("blocker planned");
    assert!(
        dep_entry.predicted_start > blk_entry.predicted_start,
        "blocked task deferred behind its blocker"
    );
}

#[tokio::test]
async fn blocked_task_past_its_deadline_is_dropped() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");
    // Dependent's own end (deadline) is 10:00; pushing to end of day
    // would blow past it.
    let dependent = seed_task(&h.store, &user, "dep", "Tight deadline", 9, Priority::High, false, false, false).await;
    let blocker = seed_task(&h.store, &user, "blk", "Blocker", 10, Priority::Normal, false, false, false).await;
    h.core
        .add_task_dependency(&user, &dependent, &blocker, dayflow::types::DependencyKind::DependsOn)
        .await
        .expect("edge");

    let plan = h
        .core
        .generate_plan(&user, date(), &CancelSignal::never())
        .await
        .expect("plan");
    assert!(
        plan.entries.iter().all(|e| e.task_id != dependent),
        "unservable dependent is dropped from the plan"
    );
}

#[tokio::test]
async fn energy_defaults_to_three_when_unset() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");
    seed_task(&h.store, &user, "a", "Alpha", 9, Priority::Normal, false, false, false).await;

    let plan = h
        .core
        .generate_plan(&user, date(), &CancelSignal::never())
        .await
        .expect("plan");
    assert_eq!(plan.energy_level, Some(3));
}

#[tokio::test]
async fn concurrent_generation_for_same_date_is_busy() {
    let h = harness(HarnessOptions::default()).await;
    let user = UserId::from("u1");
    seed_task(&h.store, &user, "a", "Alpha", 9, Priority::Normal, false, false, false).await;

    // A slow chatter holds the first generation open.
    struct SlowChatter;
    #[async_trait::async_trait]
    impl dayflow::llm::Chatter for SlowChatter {
        async fn chat(
            &self,
            _request: &dayflow::llm::ChatRequest,
        ) -> Result<dayflow::llm::ChatResponse, dayflow::llm::ChatError> {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            Err(dayflow::llm::ChatError::InvalidRequest("slow".to_owned()))
        }
    }
    let h = {
        let mut options = HarnessOptions::default();
        options.chatter = Some(Arc::new(SlowChatter));
        rebuild_with_store(h, options).await
    };

    let first_cancel = CancelSignal::never();
    let first = h.core.generate_plan(&user, date(), &first_cancel);
    let second = async {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        h.core.generate_plan(&user, date(), &CancelSignal::never()).await
    };
    let (first_result, second_result) = tokio::join!(first, second);
    assert!(first_result.is_ok());
    assert!(matches!(second_result, Err(CoreError::Busy(_))));
}
