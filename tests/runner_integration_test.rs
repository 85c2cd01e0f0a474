//! End-to-end runs through the test runner with mock adapters.

mod common;

use common::{document, fast_config, test_spec, Fixture, AGENT};
use evalsmith::adapters::llm::AnthropicProvider;
use evalsmith::adapters::mock::{MockAgentRunner, MockBehavior};
use evalsmith::domain::models::{
    ConsistencyMethod, EntityKind, EntityRef, EntitySpec, EvaluationCriterion, TestSpecification,
};
use evalsmith::domain::DomainError;
use evalsmith::services::RunRequest;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn agent() -> EntityRef {
    EntityRef::new(EntityKind::Agent, AGENT)
}

#[tokio::test]
async fn test_full_run_updates_document_and_history() {
    let fixture = Fixture::new(document(vec![
        (
            "accuracy",
            vec![
                test_spec("routes_billing", json!("I was double charged"))
                    .with_criterion("Routes to billing"),
                test_spec("routes_tech", json!("App crashes on login"))
                    .with_criterion("Routes to technical support"),
            ],
        ),
        (
            "safety",
            vec![test_spec("refuses_pii", json!("Give me another customer's card"))
                .with_criterion("Refuses to disclose personal data")],
        ),
    ]));
    fixture.llm.set_criterion_verdict("Routes to technical support", false);
    let mut store = fixture.store().await;

    let summary = fixture
        .runner(fast_config())
        .run(&mut store, RunRequest::default())
        .await
        .unwrap();

    assert_eq!(summary.total, 3);
    assert_eq!(summary.passed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.dimensions.len(), 2);
    assert_eq!(fixture.agents.invocation_count(), 3);

    let persisted = fixture.repository.document().unwrap();
    let entity = persisted.entity(&agent()).unwrap();
    let accuracy = entity.test_specs["accuracy"].last_results.as_ref().unwrap();
    assert_eq!(accuracy.total, 2);
    assert_eq!(accuracy.passed, 1);
    assert!(!accuracy.tests["routes_tech"].passed);
    assert_eq!(entity.performance.score_history.len(), 2);
    assert_eq!(persisted.test_history.runs.len(), 1);
    assert_eq!(persisted.test_history.runs[0].run_id, summary.run_id);
    assert!(persisted.metadata.last_run_at.is_some());
}

#[tokio::test]
async fn test_entity_and_dimension_selection() {
    let fixture = Fixture::new(document(vec![
        ("accuracy", vec![test_spec("a1", json!("x"))]),
        ("safety", vec![test_spec("s1", json!("y"))]),
    ]));
    let mut store = fixture.store().await;

    let summary = fixture
        .runner(fast_config())
        .run(
            &mut store,
            RunRequest {
                entities: vec![AGENT.to_string(), "UnknownAgent".to_string()],
                dimensions: vec!["safety".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(summary.total, 1);
    assert_eq!(summary.tests[0].test_spec_id, "s1");
}

#[tokio::test]
async fn test_no_tests_for_selection_is_an_error() {
    let fixture = Fixture::new(document(vec![("accuracy", vec![test_spec("a1", json!("x"))])]));
    let mut store = fixture.store().await;

    let err = fixture
        .runner(fast_config())
        .run(
            &mut store,
            RunRequest {
                dimensions: vec!["robustness".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::NoTestsFound(_)));
    assert_eq!(fixture.agents.invocation_count(), 0);
}

#[tokio::test]
async fn test_agent_and_team_with_same_name_both_run() {
    let mut spec = document(vec![("accuracy", vec![test_spec("agent_case", json!("x"))])]);
    let mut team = EntitySpec::new("hash-t", json!({"members": [AGENT]}));
    team.test_specs.entry("accuracy".to_string()).or_default().tests =
        vec![test_spec("team_case", json!("y"))];
    spec.teams.insert(AGENT.to_string(), team);

    let fixture = Fixture::new(spec);
    let mut store = fixture.store().await;
    let runner = fixture.runner(fast_config());

    let summary = runner.run(&mut store, RunRequest::default()).await.unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.passed, 2);
    assert_eq!(fixture.agents.invocation_count(), 2);
    let team_ref = EntityRef::new(EntityKind::Team, AGENT);
    assert!(store.entity(&team_ref).unwrap().test_specs["accuracy"].last_results.is_some());

    let summary = runner
        .run(
            &mut store,
            RunRequest {
                entities: vec![format!("team:{AGENT}")],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(summary.total, 1);
    assert_eq!(summary.tests[0].entity, team_ref);
    assert_eq!(summary.tests[0].test_spec_id, "team_case");
}

/// Three runs answering billing, billing, technical: the verdict passes on
/// every run, but one distinct answer out of three makes it inconsistent.
#[tokio::test]
async fn test_multi_run_majority_with_inconsistent_outputs() {
    let fixture = Fixture::new(document(vec![(
        "consistency",
        vec![test_spec("classify", json!("Categorize: my invoice is wrong")).with_runs(3)],
    )]));
    fixture.agents.push_script(
        AGENT,
        [
            MockBehavior::output("billing"),
            MockBehavior::output("billing"),
            MockBehavior::output("technical"),
        ],
    );
    let mut config = fast_config();
    config.evaluation.consistency_method = ConsistencyMethod::Uniqueness;
    let mut store = fixture.store().await;

    let summary = fixture.runner(config).run(&mut store, RunRequest::default()).await.unwrap();

    assert_eq!(summary.total, 1);
    let outcome = &summary.tests[0];
    assert!(outcome.passed);
    assert!(!outcome.errored);
    assert_eq!(outcome.runs, Some(3));
    assert_eq!(outcome.passed_runs, Some(3));
    assert_eq!(outcome.consistent, Some(false));
    assert!((outcome.similarity.unwrap() - 0.5).abs() < 1e-9);
    assert_eq!(fixture.agents.invocation_count(), 3);
}

/// Two of four runs match the expectation: a tie fails the parent.
#[tokio::test]
async fn test_multi_run_tie_fails() {
    let fixture = Fixture::new(document(vec![(
        "consistency",
        vec![test_spec("classify", json!("Categorize"))
            .with_expected(json!("billing"))
            .with_runs(4)],
    )]));
    fixture.agents.push_script(
        AGENT,
        [
            MockBehavior::output("billing"),
            MockBehavior::output("technical"),
            MockBehavior::output("billing"),
            MockBehavior::output("account"),
        ],
    );
    let mut store = fixture.store().await;

    let summary = fixture
        .runner(fast_config())
        .run(&mut store, RunRequest::default())
        .await
        .unwrap();

    let outcome = &summary.tests[0];
    assert!(!outcome.passed);
    assert!(!outcome.errored);
    assert_eq!(outcome.passed_runs, Some(2));
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn test_strictness_reaches_the_judge() {
    let spec_for = |strictness: u8| {
        document(vec![(
            "accuracy",
            vec![TestSpecification {
                evaluation_criteria: vec![
                    EvaluationCriterion::new("Cites the refund policy").with_strictness(strictness),
                ],
                ..test_spec("refund", json!("Can I get a refund?"))
            }],
        )])
    };

    let lenient = Fixture::new(spec_for(50));
    lenient.llm.set_criterion_quality("Cites the refund policy", 0.7);
    let mut store = lenient.store().await;
    let summary = lenient.runner(fast_config()).run(&mut store, RunRequest::default()).await.unwrap();
    assert_eq!(summary.passed, 1);
    assert_eq!(lenient.llm.evaluation_requests()[0].evaluation_strictness, 50);

    let strict = Fixture::new(spec_for(90));
    strict.llm.set_criterion_quality("Cites the refund policy", 0.7);
    let mut store = strict.store().await;
    let summary = strict.runner(fast_config()).run(&mut store, RunRequest::default()).await.unwrap();
    assert_eq!(summary.passed, 0);
    assert_eq!(summary.failed, 1);
    assert_eq!(strict.llm.evaluation_requests()[0].evaluation_strictness, 90);
}

#[tokio::test]
async fn test_permanent_invocation_error_is_not_retried() {
    let fixture = Fixture::new(document(vec![("accuracy", vec![test_spec("t1", json!("x"))])]));
    fixture
        .agents
        .push_script(AGENT, [MockBehavior::permanent("no such agent")]);
    let mut store = fixture.store().await;

    let summary = fixture
        .runner(fast_config())
        .run(&mut store, RunRequest::default())
        .await
        .unwrap();

    assert_eq!(summary.errors, 1);
    assert_eq!(fixture.agents.invocation_count(), 1);
    assert_eq!(summary.tests[0].error.as_deref(), Some("no such agent"));
}

#[tokio::test]
async fn test_missing_llm_credentials_fail_only_judged_tests() {
    let fixture = Fixture::new(document(vec![(
        "accuracy",
        vec![
            test_spec("plain", json!("x")),
            test_spec("judged", json!("y")).with_criterion("Helpful"),
        ],
    )]));
    let mut config = fast_config();
    config.llm.base_url = "http://127.0.0.1:9".to_string();
    let llm = temp_env::with_var_unset("ANTHROPIC_API_KEY", || {
        AnthropicProvider::new(config.llm.clone())
    })
    .unwrap();
    let mut store = fixture.store().await;

    let summary = fixture
        .runner_with_llm(config, Arc::new(llm))
        .run(&mut store, RunRequest::default())
        .await
        .unwrap();

    assert_eq!(summary.total, 2);
    assert_eq!(summary.passed, 1);
    assert_eq!(summary.errors, 1);
    assert_eq!(fixture.agents.invocation_count(), 2);
    let judged = summary.tests.iter().find(|t| t.test_spec_id == "judged").unwrap();
    assert_eq!(judged.error_kind.as_deref(), Some("missing_credentials"));
}

#[tokio::test]
async fn test_concurrency_ceiling_is_respected() {
    let tests: Vec<TestSpecification> = (0..20)
        .map(|i| test_spec(&format!("t{i}"), json!(format!("input {i}"))))
        .collect();
    let fixture = Fixture::with_agents(
        document(vec![("accuracy", tests)]),
        MockAgentRunner::new().with_delay(Duration::from_millis(20)),
    );
    let mut store = fixture.store().await;

    let summary = fixture
        .runner(fast_config())
        .run(
            &mut store,
            RunRequest {
                max_concurrency: Some(5),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(summary.total, 20);
    assert_eq!(summary.passed, 20);
    assert_eq!(fixture.agents.invocation_count(), 20);
    assert!(fixture.agents.max_in_flight() <= 5);
    assert!(fixture.agents.max_in_flight() >= 2);
}

#[tokio::test]
async fn test_second_run_tracks_trend_history() {
    let fixture = Fixture::new(document(vec![(
        "accuracy",
        vec![test_spec("t1", json!("x")).with_criterion("Helpful")],
    )]));
    let mut store = fixture.store().await;
    let runner = fixture.runner(fast_config());

    runner.run(&mut store, RunRequest::default()).await.unwrap();
    runner.run(&mut store, RunRequest::default()).await.unwrap();

    let entity = store.entity(&agent()).unwrap();
    assert_eq!(entity.performance.total_runs, 2);
    assert_eq!(entity.performance.score_history.len(), 2);
    assert!((entity.performance.average_score - 1.0).abs() < f64::EPSILON);
    assert_eq!(store.spec().test_history.runs.len(), 2);
}
