// End-to-end engine behaviour over the in-memory stores

use async_trait::async_trait;
use cadence_shared::{Channel, DeliveryStatus};
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::services::{MessageProvider, OutboundMessage, ProviderError, ProviderReceipt, ProviderRegistry};
use crate::store::{MockRecordStore, RecordMutation, StoreError, Stores, WorkflowStore};
use crate::tests::fixtures;
use crate::tests::helpers::{MemoryStore, StubBehavior, StubProvider, StubProviders, TestHarness};
use crate::workflows::conditions::presets;
use crate::workflows::enrollment::{EnrollmentReason, EnrollmentRequest, SkipReason};
use crate::workflows::{
    Enrollment, EnrollmentStatus, ExecutionContext, LogOutcome, Step, StepType, TriggerType, WorkflowDefinition,
    WorkflowEngine, WorkflowError,
};

struct FollowUp {
    harness: TestHarness,
    client_id: Uuid,
    appointment_id: Uuid,
    workflow: WorkflowDefinition,
}

fn follow_up(harness: TestHarness, client: cadence_shared::Client) -> FollowUp {
    let org_id = harness.org_id;
    let appointment = fixtures::appointment(org_id, client.id, "consultation");
    let sms = fixtures::template(org_id, Channel::Sms, "Hi {first_name}, thanks for your {appointment_type}!");
    let email = fixtures::template(org_id, Channel::Email, "See you soon, {client_name}.");
    let workflow = fixtures::follow_up_workflow(org_id, sms.id, email.id, 60);

    let client_id = client.id;
    let appointment_id = appointment.id;
    harness.store.add_client(client);
    harness.store.add_appointment(appointment);
    harness.store.add_template(sms);
    harness.store.add_template(email);
    harness.store.add_definition(workflow.clone());

    FollowUp {
        harness,
        client_id,
        appointment_id,
        workflow,
    }
}

impl FollowUp {
    async fn complete_appointment(&self) -> Vec<Uuid> {
        let report = self
            .harness
            .engine
            .on_appointment_event(self.harness.org_id, self.appointment_id, "completed", json!({}))
            .await
            .unwrap();
        self.harness.engine.wait_idle().await;
        report.enrolled
    }

    /// Resume everything whose delay is due within `ahead`
    async fn advance_clock(&self, ahead: Duration) -> usize {
        let resumed = self.harness.engine.resume_due(Utc::now() + ahead, 50).await.unwrap();
        self.harness.engine.wait_idle().await;
        resumed
    }
}

#[tokio::test]
async fn test_sms_delay_email_completes_with_two_sends() {
    let harness = TestHarness::new();
    let client = fixtures::client(harness.org_id);
    let first_name = client.first_name.clone();
    let flow = follow_up(harness, client);

    let enrolled = flow.complete_appointment().await;
    assert_eq!(enrolled.len(), 1);
    let execution_id = enrolled[0];

    // Parked on the delay: SMS out, email pending
    let status = flow.harness.engine.get_execution_status(execution_id).await.unwrap();
    assert_eq!(status.status, EnrollmentStatus::Active);
    assert_eq!(status.current_step, 1);
    assert!(status.next_step_at.is_some());
    assert_eq!(flow.harness.store.deliveries().len(), 1);

    assert_eq!(flow.advance_clock(Duration::minutes(5)).await, 0);
    assert_eq!(flow.advance_clock(Duration::minutes(61)).await, 1);

    let status = flow.harness.engine.get_execution_status(execution_id).await.unwrap();
    assert_eq!(status.status, EnrollmentStatus::Completed);
    assert_eq!(status.current_step, status.step_count);
    assert!(status.completed_at.is_some());

    assert_eq!(status.log.len(), 3);
    assert!(status.log.iter().all(|entry| entry.outcome == LogOutcome::Executed));
    let positions: Vec<i32> = status.log.iter().map(|entry| entry.step_position).collect();
    assert_eq!(positions, vec![0, 1, 2]);

    let deliveries = flow.harness.store.deliveries();
    assert_eq!(deliveries.len(), 2);
    assert!(deliveries.iter().all(|d| d.status == DeliveryStatus::Sent));
    assert_eq!(deliveries[0].channel, Channel::Sms);
    assert_eq!(deliveries[1].channel, Channel::Email);
    assert_eq!(deliveries[1].provider.as_deref(), Some("smtp"));

    let sms = flow.harness.providers.twilio.sent();
    assert_eq!(sms.len(), 1);
    assert_eq!(sms[0].body, format!("Hi {}, thanks for your consultation!", first_name));

    assert!(status.context.get("sms_delivery_id").is_some());
    assert_eq!(status.context["email_provider"], json!("smtp"));
}

#[tokio::test]
async fn test_sms_opt_out_is_soft_skip_and_run_completes() {
    let harness = TestHarness::new();
    let client = fixtures::sms_opted_out_client(harness.org_id);
    let flow = follow_up(harness, client);

    let execution_id = flow.complete_appointment().await[0];
    flow.advance_clock(Duration::hours(2)).await;

    let status = flow.harness.engine.get_execution_status(execution_id).await.unwrap();
    assert_eq!(status.status, EnrollmentStatus::Completed);

    let outcomes: Vec<LogOutcome> = status.log.iter().map(|entry| entry.outcome).collect();
    assert_eq!(
        outcomes,
        vec![LogOutcome::Skipped, LogOutcome::Executed, LogOutcome::Executed]
    );

    let deliveries = flow.harness.store.deliveries();
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[0].status, DeliveryStatus::OptedOut);
    assert!(deliveries[0].provider.is_none());
    assert_eq!(deliveries[1].status, DeliveryStatus::Sent);
    assert!(flow.harness.providers.twilio.sent().is_empty());
}

#[tokio::test]
async fn test_recent_enrollment_blocks_second_trigger() {
    let harness = TestHarness::new();
    let client = fixtures::client(harness.org_id);
    let mut flow = follow_up(harness, client);
    flow.workflow = flow.workflow.clone().with_duplicate_prevention(30);
    flow.harness.store.add_definition(flow.workflow.clone());

    let request = EnrollmentRequest {
        client_id: flow.client_id,
        context: ExecutionContext::default(),
        reason: EnrollmentReason {
            trigger_type: TriggerType::AppointmentCompleted,
            matched_category: "completed".to_string(),
        },
        appointment_id: None,
    };
    let prior = Enrollment::new(&flow.workflow, request, Utc::now() - Duration::days(5))
        .finish(EnrollmentStatus::Completed, Utc::now() - Duration::days(5));
    let prior_id = prior.id;
    flow.harness.store.put_enrollment(prior);

    let report = flow
        .harness
        .engine
        .on_appointment_event(flow.harness.org_id, flow.appointment_id, "completed", json!({}))
        .await
        .unwrap();
    flow.harness.engine.wait_idle().await;

    assert!(report.enrolled.is_empty());
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(
        report.skipped[0].reason,
        SkipReason::DuplicateWithinWindow {
            enrollment_id: prior_id,
            lookback_days: 30
        }
    );

    assert_eq!(flow.harness.store.enrollments_for(flow.workflow.id, flow.client_id).len(), 1);
    assert!(flow.harness.store.all_logs().is_empty());
    assert!(flow.harness.store.deliveries().is_empty());
}

#[tokio::test]
async fn test_enrollment_outside_window_is_allowed() {
    let harness = TestHarness::new();
    let client = fixtures::client(harness.org_id);
    let mut flow = follow_up(harness, client);
    flow.workflow = flow.workflow.clone().with_duplicate_prevention(30);
    flow.harness.store.add_definition(flow.workflow.clone());

    let request = EnrollmentRequest {
        client_id: flow.client_id,
        context: ExecutionContext::default(),
        reason: EnrollmentReason {
            trigger_type: TriggerType::AppointmentCompleted,
            matched_category: "completed".to_string(),
        },
        appointment_id: None,
    };
    let old = Enrollment::new(&flow.workflow, request, Utc::now() - Duration::days(45))
        .finish(EnrollmentStatus::Completed, Utc::now() - Duration::days(45));
    flow.harness.store.put_enrollment(old);

    assert_eq!(flow.complete_appointment().await.len(), 1);
    assert_eq!(flow.harness.store.enrollments_for(flow.workflow.id, flow.client_id).len(), 2);
}

#[tokio::test]
async fn test_failing_mutation_fails_enrollment_at_step_two() {
    let org_id = Uuid::new_v4();
    let client = fixtures::client(org_id);
    let appointment = fixtures::appointment(org_id, client.id, "consultation");
    let appointment_id = appointment.id;

    let mut records = MockRecordStore::new();
    let lookup = client.clone();
    records
        .expect_get_client()
        .returning(move |_, _| Ok(Some(lookup.clone())));
    records
        .expect_get_appointment()
        .returning(move |_, _| Ok(Some(appointment.clone())));
    records
        .expect_mutate_record()
        .times(1)
        .returning(|_, _| Err(StoreError::Unavailable("records offline".to_string())));

    let harness = TestHarness::with_records(org_id, Arc::new(records));
    let sms = fixtures::template(org_id, Channel::Sms, "Thanks {first_name}");
    let email = fixtures::template(org_id, Channel::Email, "Bye {first_name}");
    let workflow = WorkflowDefinition::new(
        org_id,
        "Tag and thank",
        TriggerType::AppointmentCompleted,
        vec![
            Step::send_sms(0, sms.id),
            Step::new(1, StepType::UpdateClient, json!({ "add_tags": ["visited"] })),
            Step::send_email(2, email.id),
        ],
    );
    harness.store.add_template(sms);
    harness.store.add_template(email);
    harness.store.add_definition(workflow.clone());

    let report = harness
        .engine
        .on_appointment_event(org_id, appointment_id, "completed", json!({}))
        .await
        .unwrap();
    harness.engine.wait_idle().await;

    let status = harness.engine.get_execution_status(report.enrolled[0]).await.unwrap();
    assert_eq!(status.status, EnrollmentStatus::Failed);
    assert_eq!(status.current_step, 1);

    assert_eq!(status.log.len(), 2);
    assert_eq!(status.log[0].outcome, LogOutcome::Executed);
    assert_eq!(status.log[0].step_position, 0);
    assert_eq!(status.log[1].outcome, LogOutcome::Failed);
    assert_eq!(status.log[1].step_position, 1);
    assert!(status.log[1].error.as_deref().unwrap_or_default().contains("records offline"));
    assert!(status.log.iter().all(|entry| entry.step_position != 2));

    let deliveries = harness.store.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].channel, Channel::Sms);
}

#[tokio::test]
async fn test_concurrent_events_create_one_enrollment() {
    let harness = TestHarness::new();
    let org_id = harness.org_id;
    let client = fixtures::client(org_id);
    let appointment = fixtures::appointment(org_id, client.id, "consultation");
    let sms = fixtures::template(org_id, Channel::Sms, "Hello");
    let workflow = WorkflowDefinition::new(
        org_id,
        "Slow drip",
        TriggerType::AppointmentCompleted,
        vec![Step::delay(0, 24 * 60), Step::send_sms(1, sms.id)],
    );
    let (client_id, appointment_id, workflow_id) = (client.id, appointment.id, workflow.id);
    harness.store.add_client(client);
    harness.store.add_appointment(appointment);
    harness.store.add_template(sms);
    harness.store.add_definition(workflow);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = harness.engine.clone();
            tokio::spawn(async move {
                engine
                    .on_appointment_event(org_id, appointment_id, "completed", json!({}))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut enrolled = 0;
    let mut skipped = 0;
    for handle in handles {
        let report = handle.await.unwrap();
        enrolled += report.enrolled.len();
        skipped += report.skipped.len();
    }
    harness.engine.wait_idle().await;

    assert_eq!(enrolled, 1);
    assert_eq!(skipped, 7);
    let enrollments = harness.store.enrollments_for(workflow_id, client_id);
    assert_eq!(enrollments.len(), 1);
    assert!(enrollments[0].is_active());
}

#[tokio::test]
async fn test_restart_cancels_and_replaces_active_enrollment() {
    let harness = TestHarness::new();
    let client = fixtures::client(harness.org_id);
    let mut flow = follow_up(harness, client);
    flow.workflow = flow.workflow.clone().with_restart();
    flow.harness.store.add_definition(flow.workflow.clone());

    let first = flow.complete_appointment().await[0];
    let second = flow.complete_appointment().await[0];
    assert_ne!(first, second);

    let enrollments = flow.harness.store.enrollments_for(flow.workflow.id, flow.client_id);
    assert_eq!(enrollments.len(), 2);
    let first = enrollments.iter().find(|e| e.id == first).unwrap();
    let second = enrollments.iter().find(|e| e.id == second).unwrap();
    assert_eq!(first.status, EnrollmentStatus::Cancelled);
    assert_eq!(second.status, EnrollmentStatus::Active);

    // Only the replacement resumes
    assert_eq!(flow.advance_clock(Duration::hours(2)).await, 1);
}

#[tokio::test]
async fn test_active_enrollment_blocks_without_dedup() {
    let harness = TestHarness::new();
    let client = fixtures::client(harness.org_id);
    let flow = follow_up(harness, client);

    assert_eq!(flow.complete_appointment().await.len(), 1);
    assert!(flow.complete_appointment().await.is_empty());
    assert_eq!(flow.harness.store.enrollments_for(flow.workflow.id, flow.client_id).len(), 1);
}

#[tokio::test]
async fn test_false_condition_skips_step_and_keeps_context() {
    let harness = TestHarness::new();
    let org_id = harness.org_id;
    let client = fixtures::client(org_id);
    let sms = fixtures::template(org_id, Channel::Sms, "VIP perks inside");
    let email = fixtures::template(org_id, Channel::Email, "Welcome aboard");
    let workflow = WorkflowDefinition::new(
        org_id,
        "Welcome",
        TriggerType::ClientCreated,
        vec![
            Step::send_sms(0, sms.id).with_conditions(vec![presets::has_tag("vip")]),
            Step::send_email(1, email.id),
        ],
    );
    let client_id = client.id;
    harness.store.add_client(client);
    harness.store.add_template(sms);
    harness.store.add_template(email);
    harness.store.add_definition(workflow);

    let report = harness
        .engine
        .on_client_event(org_id, client_id, "created", json!({ "source": "signup_form" }))
        .await
        .unwrap();
    harness.engine.wait_idle().await;

    let status = harness.engine.get_execution_status(report.enrolled[0]).await.unwrap();
    assert_eq!(status.status, EnrollmentStatus::Completed);
    assert_eq!(status.log[0].outcome, LogOutcome::Skipped);
    assert!(status.log[0].result.is_none());
    assert_eq!(status.log[1].outcome, LogOutcome::Executed);

    assert!(status.context.get("sms_delivery_id").is_none());
    assert_eq!(status.context["event"]["source"], json!("signup_form"));

    let deliveries = harness.store.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].channel, Channel::Email);
}

#[tokio::test]
async fn test_unavailable_provider_falls_back() {
    let providers = StubProviders {
        smtp: StubProvider::new("smtp", Channel::Email, 1, StubBehavior::Unavailable),
        ..StubProviders::accepting()
    };
    let harness = TestHarness::with_providers(providers);
    let org_id = harness.org_id;
    let client = fixtures::client(org_id);
    let email = fixtures::template(org_id, Channel::Email, "Hello {first_name}");
    let workflow = WorkflowDefinition::new(
        org_id,
        "Email only",
        TriggerType::Manual,
        vec![Step::send_email(0, email.id)],
    );
    let (client_id, workflow_id) = (client.id, workflow.id);
    harness.store.add_client(client);
    harness.store.add_template(email);
    harness.store.add_definition(workflow);

    let execution_id = harness
        .engine
        .execute_workflow(org_id, workflow_id, TriggerType::Manual, json!({ "client_id": client_id }))
        .await
        .unwrap();
    harness.engine.wait_idle().await;

    let deliveries = harness.store.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].status, DeliveryStatus::Sent);
    assert_eq!(deliveries[0].provider.as_deref(), Some("sendgrid"));
    assert_eq!(harness.providers.sendgrid.sent().len(), 1);

    let status = harness.engine.get_execution_status(execution_id).await.unwrap();
    assert_eq!(status.status, EnrollmentStatus::Completed);
}

#[tokio::test]
async fn test_every_provider_failing_fails_the_step() {
    let providers = StubProviders {
        twilio: StubProvider::new("twilio", Channel::Sms, 1, StubBehavior::Reject),
        ..StubProviders::accepting()
    };
    let harness = TestHarness::with_providers(providers);
    let org_id = harness.org_id;
    let client = fixtures::client(org_id);
    let sms = fixtures::template(org_id, Channel::Sms, "Hello");
    let workflow = WorkflowDefinition::new(org_id, "SMS only", TriggerType::Manual, vec![Step::send_sms(0, sms.id)]);
    let (client_id, workflow_id) = (client.id, workflow.id);
    harness.store.add_client(client);
    harness.store.add_template(sms);
    harness.store.add_definition(workflow);

    let execution_id = harness
        .engine
        .execute_workflow(org_id, workflow_id, TriggerType::Manual, json!({ "client_id": client_id }))
        .await
        .unwrap();
    harness.engine.wait_idle().await;

    let deliveries = harness.store.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].status, DeliveryStatus::Failed);
    assert_eq!(deliveries[0].metadata["attempts"][0]["provider"], json!("twilio"));

    let status = harness.engine.get_execution_status(execution_id).await.unwrap();
    assert_eq!(status.status, EnrollmentStatus::Failed);
    assert_eq!(status.log[0].outcome, LogOutcome::Failed);
}

#[tokio::test]
async fn test_manual_execution_requires_client_and_active_workflow() {
    let harness = TestHarness::new();
    let org_id = harness.org_id;
    let mut workflow = WorkflowDefinition::new(org_id, "Manual", TriggerType::Manual, vec![Step::delay(0, 5)]);

    let missing = harness
        .engine
        .execute_workflow(org_id, workflow.id, TriggerType::Manual, json!({}))
        .await;
    assert!(matches!(missing, Err(WorkflowError::WorkflowNotFound(_))));

    harness.store.add_definition(workflow.clone());
    let no_client = harness
        .engine
        .execute_workflow(org_id, workflow.id, TriggerType::Manual, json!({ "note": "hi" }))
        .await;
    assert!(matches!(no_client, Err(WorkflowError::MissingContext(field)) if field == "client_id"));

    workflow.is_active = false;
    harness.store.add_definition(workflow.clone());
    let inactive = harness
        .engine
        .execute_workflow(org_id, workflow.id, TriggerType::Manual, json!({ "client_id": Uuid::new_v4() }))
        .await;
    assert!(matches!(inactive, Err(WorkflowError::WorkflowInactive(_))));
}

#[tokio::test]
async fn test_tag_allow_list_filters_clients() {
    let harness = TestHarness::new();
    let org_id = harness.org_id;
    let regular = fixtures::client(org_id);
    let vip = fixtures::tagged_client(org_id, &["vip"]);
    let workflow = WorkflowDefinition::new(
        org_id,
        "VIP onboarding",
        TriggerType::ClientCreated,
        vec![Step::new(0, StepType::UpdateClient, json!({ "add_tags": ["onboarded"] }))],
    )
    .with_match_conditions(crate::workflows::MatchConditions {
        appointment_types: Vec::new(),
        client_tags: vec!["vip".to_string()],
    });
    let (regular_id, vip_id) = (regular.id, vip.id);
    harness.store.add_client(regular);
    harness.store.add_client(vip);
    harness.store.add_definition(workflow);

    let filtered = harness.engine.on_client_event(org_id, regular_id, "created", json!(null)).await.unwrap();
    assert!(filtered.enrolled.is_empty());
    assert_eq!(filtered.filtered.len(), 1);

    let enrolled = harness.engine.on_client_event(org_id, vip_id, "created", json!(null)).await.unwrap();
    assert_eq!(enrolled.enrolled.len(), 1);
    harness.engine.wait_idle().await;

    let tags = harness.store.client(vip_id).unwrap().tags;
    assert_eq!(tags, vec!["vip".to_string(), "onboarded".to_string()]);
    assert!(matches!(harness.store.mutations()[0], RecordMutation::UpdateClient(_)));
}

#[tokio::test]
async fn test_unmapped_change_and_missing_appointment() {
    let harness = TestHarness::new();

    let ignored = harness
        .engine
        .on_appointment_event(harness.org_id, Uuid::new_v4(), "checked_in", json!({}))
        .await
        .unwrap();
    assert_eq!(ignored.candidates, 0);
    assert!(ignored.trigger_type.is_none());

    let missing = harness
        .engine
        .on_appointment_event(harness.org_id, Uuid::new_v4(), "completed", json!({}))
        .await;
    assert!(matches!(missing, Err(WorkflowError::AppointmentNotFound(_))));
}

/// Manual workflow for one stored client, run through `execute_workflow`
async fn run_manual(harness: &TestHarness, steps: Vec<Step>) -> (Uuid, WorkflowDefinition) {
    let client = fixtures::client(harness.org_id);
    let client_id = client.id;
    let workflow = WorkflowDefinition::new(harness.org_id, "Manual", TriggerType::Manual, steps);
    harness.store.add_client(client);
    harness.store.add_definition(workflow.clone());

    let execution_id = harness
        .engine
        .execute_workflow(harness.org_id, workflow.id, TriggerType::Manual, json!({ "client_id": client_id }))
        .await
        .unwrap();
    harness.engine.wait_idle().await;
    (execution_id, workflow)
}

#[tokio::test]
async fn test_claimed_enrollment_is_recovered_after_restart() {
    let harness = TestHarness::new();
    let sms = fixtures::template(harness.org_id, Channel::Sms, "Still there?");
    let steps = vec![Step::delay(0, 60), Step::send_sms(1, sms.id)];
    harness.store.add_template(sms);
    let (execution_id, _) = run_manual(&harness, steps).await;

    // A poller claims the due enrollment and the process dies before running it
    let claimed_at = Utc::now() + Duration::hours(2);
    let claimed = harness.store.claim_due_enrollments(claimed_at, 10).await.unwrap();
    assert_eq!(claimed, vec![execution_id]);

    let restarted = WorkflowEngine::new(Stores::shared(harness.store.clone()), harness.providers.registry());

    // The claim's lease still holds
    assert_eq!(restarted.resume_due(claimed_at, 50).await.unwrap(), 0);

    // Once it lapses the enrollment is taken over and finishes
    let later = claimed_at + Duration::minutes(11);
    assert_eq!(restarted.resume_due(later, 50).await.unwrap(), 1);
    restarted.wait_idle().await;

    let status = restarted.get_execution_status(execution_id).await.unwrap();
    assert_eq!(status.status, EnrollmentStatus::Completed);
    let positions: Vec<i32> = status.log.iter().map(|entry| entry.step_position).collect();
    assert_eq!(positions, vec![0, 1]);
    assert_eq!(harness.providers.twilio.sent().len(), 1);

    assert_eq!(restarted.resume_due(later + Duration::days(1), 50).await.unwrap(), 0);
}

#[tokio::test]
async fn test_enrollment_never_started_is_picked_up_by_poller() {
    let harness = TestHarness::new();
    let client = fixtures::client(harness.org_id);
    let sms = fixtures::template(harness.org_id, Channel::Sms, "Welcome");
    let workflow = WorkflowDefinition::new(
        harness.org_id,
        "Welcome",
        TriggerType::ClientCreated,
        vec![Step::send_sms(0, sms.id)],
    );
    let request = EnrollmentRequest {
        client_id: client.id,
        context: ExecutionContext::from_value(json!({ "client_id": client.id })),
        reason: EnrollmentReason {
            trigger_type: TriggerType::ClientCreated,
            matched_category: "created".to_string(),
        },
        appointment_id: None,
    };
    harness.store.add_client(client);
    harness.store.add_template(sms);

    // Inserted, but the process stopped before the first run was spawned
    let now = Utc::now();
    let enrollment = Enrollment::new(&workflow, request, now);
    let id = enrollment.id;
    harness.store.put_enrollment(enrollment);

    assert_eq!(harness.engine.resume_due(now, 50).await.unwrap(), 0);
    assert_eq!(harness.engine.resume_due(now + Duration::minutes(11), 50).await.unwrap(), 1);
    harness.engine.wait_idle().await;

    let status = harness.engine.get_execution_status(id).await.unwrap();
    assert_eq!(status.status, EnrollmentStatus::Completed);
    assert_eq!(harness.store.deliveries().len(), 1);
}

#[tokio::test]
async fn test_unschedulable_delay_fails_the_enrollment() {
    let harness = TestHarness::new();
    let sms = fixtures::template(harness.org_id, Channel::Sms, "Much later");
    let steps = vec![
        Step::new(0, StepType::Wait, json!({ "days": 200_000_000_000i64 })),
        Step::send_sms(1, sms.id),
    ];
    harness.store.add_template(sms);
    let (execution_id, _) = run_manual(&harness, steps).await;

    let status = harness.engine.get_execution_status(execution_id).await.unwrap();
    assert_eq!(status.status, EnrollmentStatus::Failed);
    assert!(status.next_step_at.is_none());
    assert!(status.completed_at.is_some());
    assert_eq!(status.log.len(), 1);
    assert_eq!(status.log[0].outcome, LogOutcome::Failed);
    assert!(status.log[0].error.as_deref().unwrap_or_default().contains("out of range"));
    assert!(harness.store.deliveries().is_empty());

    assert_eq!(harness.engine.resume_due(Utc::now() + Duration::days(3650), 50).await.unwrap(), 0);
}

#[tokio::test]
async fn test_out_of_range_task_due_date_fails_without_mutation() {
    let harness = TestHarness::new();
    let steps = vec![Step::new(
        0,
        StepType::CreateTask,
        json!({ "title": "Call back", "due_in_days": i64::MAX }),
    )];
    let (execution_id, _) = run_manual(&harness, steps).await;

    let status = harness.engine.get_execution_status(execution_id).await.unwrap();
    assert_eq!(status.status, EnrollmentStatus::Failed);
    assert_eq!(status.log[0].outcome, LogOutcome::Failed);
    assert!(harness.store.mutations().is_empty());
}

/// SMS transport that cancels the client's enrollment while the message is in flight
struct CancellingProvider {
    store: Arc<MemoryStore>,
    workflow_id: Uuid,
    client_id: Uuid,
}

#[async_trait]
impl MessageProvider for CancellingProvider {
    fn name(&self) -> &str {
        "cancelling"
    }

    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn priority(&self) -> u32 {
        1
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn send_message(&self, _message: &OutboundMessage) -> Result<ProviderReceipt, ProviderError> {
        for enrollment in self.store.enrollments_for(self.workflow_id, self.client_id) {
            if enrollment.is_active() {
                let cancelled = self.store.cancel_enrollment(enrollment.id, Utc::now()).await;
                assert!(matches!(cancelled, Ok(true)));
            }
        }
        Ok(ProviderReceipt::with_id("in-flight"))
    }
}

#[tokio::test]
async fn test_cancel_during_running_step_stops_before_next_step() {
    let org_id = Uuid::new_v4();
    let store = MemoryStore::new();
    let client = fixtures::client(org_id);
    let sms = fixtures::template(org_id, Channel::Sms, "First");
    let email = fixtures::template(org_id, Channel::Email, "Second");
    let workflow = WorkflowDefinition::new(
        org_id,
        "Two messages",
        TriggerType::Manual,
        vec![Step::send_sms(0, sms.id), Step::send_email(1, email.id)],
    );
    let (client_id, workflow_id) = (client.id, workflow.id);
    store.add_client(client);
    store.add_template(sms);
    store.add_template(email);
    store.add_definition(workflow);

    let smtp = StubProvider::accepting("smtp", Channel::Email, 1);
    let registry = ProviderRegistry::new()
        .with_provider(Arc::new(CancellingProvider {
            store: store.clone(),
            workflow_id,
            client_id,
        }))
        .with_provider(smtp.clone());
    let engine = WorkflowEngine::new(Stores::shared(store.clone()), registry);

    let execution_id = engine
        .execute_workflow(org_id, workflow_id, TriggerType::Manual, json!({ "client_id": client_id }))
        .await
        .unwrap();
    engine.wait_idle().await;

    let status = engine.get_execution_status(execution_id).await.unwrap();
    assert_eq!(status.status, EnrollmentStatus::Cancelled);
    assert_eq!(status.log.len(), 1);
    assert_eq!(status.log[0].outcome, LogOutcome::Executed);
    assert_eq!(status.log[0].step_position, 0);

    let deliveries = store.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].status, DeliveryStatus::Sent);
    assert!(smtp.sent().is_empty());
}
