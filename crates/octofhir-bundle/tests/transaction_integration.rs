//! Transaction bundle scenarios against the in-memory backend.
//!
//! These tests verify the all-or-nothing behaviour of transaction bundles:
//! - identity resolution (placeholders, conditional criteria, cycles)
//! - phase ordering with responses in submission order
//! - aborts leave storage untouched

use std::sync::{Arc, Mutex};

use assert_json_diff::assert_json_include;
use async_trait::async_trait;
use base64::Engine;
use octofhir_bundle::{
    BundleContext, BundleInterceptor, EngineConfig, EntryContext, EntryOutcome, ErrorKind,
    InterceptorError, Phase, PreferReturn, ResponseStatus, TransactionCoordinator,
};
use octofhir_db_memory::InMemoryStorage;
use octofhir_storage::FhirStorage;
use serde_json::{Value, json};
use tokio_test::{assert_err, assert_ok};

const PATIENT_UUID: &str = "urn:uuid:61ebe359-bfdc-4613-8bf2-c5e300945f0a";
const OTHER_UUID: &str = "urn:uuid:88f151c0-a954-468a-88bd-5ae15c08e059";
const MRN: &str = "http://acme.org/mrn";

// =============================================================================
// Test Infrastructure
// =============================================================================

fn coordinator_with(storage: &InMemoryStorage, config: &EngineConfig) -> TransactionCoordinator {
    TransactionCoordinator::new(
        Arc::new(storage.clone()),
        storage.registry().clone(),
        config,
    )
}

fn coordinator(storage: &InMemoryStorage) -> TransactionCoordinator {
    coordinator_with(storage, &EngineConfig::default())
}

fn transaction(entries: Vec<Value>) -> Value {
    json!({"resourceType": "Bundle", "type": "transaction", "entry": entries})
}

fn post(full_url: Option<&str>, resource: Value) -> Value {
    let resource_type = resource["resourceType"].as_str().unwrap_or_default().to_string();
    let mut entry = json!({
        "resource": resource,
        "request": {"method": "POST", "url": resource_type}
    });
    if let Some(full_url) = full_url {
        entry["fullUrl"] = json!(full_url);
    }
    entry
}

fn request(method: &str, url: &str) -> Value {
    json!({"request": {"method": method, "url": url}})
}

fn patient_with_mrn(id: Option<&str>, mrn: &str) -> Value {
    let mut patient = json!({
        "resourceType": "Patient",
        "identifier": [{"system": MRN, "value": mrn}]
    });
    if let Some(id) = id {
        patient["id"] = json!(id);
    }
    patient
}

async fn seed(storage: &InMemoryStorage, resource: Value) {
    storage.create(&resource).await.unwrap();
}

fn created_id(outcome: &EntryOutcome) -> String {
    outcome.identity.as_ref().unwrap().id.clone()
}

// =============================================================================
// Identity Resolution
// =============================================================================

#[tokio::test]
async fn test_placeholder_reference_is_rewritten() {
    let storage = InMemoryStorage::new();
    let response = assert_ok!(
        coordinator(&storage)
            .process(transaction(vec![
                post(Some(PATIENT_UUID), json!({"resourceType": "Patient", "active": true})),
                post(
                    None,
                    json!({
                        "resourceType": "Observation",
                        "status": "final",
                        "subject": {"reference": PATIENT_UUID}
                    })
                ),
            ]))
            .await
    );

    assert_eq!(response.statuses(), vec!["201 Created", "201 Created"]);
    let patient_id = created_id(&response.outcomes[0]);
    let observation_id = created_id(&response.outcomes[1]);

    let observation = storage
        .read("Observation", &observation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        observation.resource["subject"]["reference"],
        format!("Patient/{patient_id}")
    );
}

#[tokio::test]
async fn test_mutual_references_resolve() {
    let storage = InMemoryStorage::new();
    let link = |to: &str| json!([{"other": {"reference": to}, "type": "seealso"}]);
    let response = assert_ok!(
        coordinator(&storage)
            .process(transaction(vec![
                post(
                    Some(PATIENT_UUID),
                    json!({"resourceType": "Patient", "link": link(OTHER_UUID)})
                ),
                post(
                    Some(OTHER_UUID),
                    json!({"resourceType": "Patient", "link": link(PATIENT_UUID)})
                ),
            ]))
            .await
    );

    let first = created_id(&response.outcomes[0]);
    let second = created_id(&response.outcomes[1]);
    let stored_first = storage.read("Patient", &first).await.unwrap().unwrap();
    let stored_second = storage.read("Patient", &second).await.unwrap().unwrap();
    assert_eq!(
        stored_first.resource["link"][0]["other"]["reference"],
        format!("Patient/{second}")
    );
    assert_eq!(
        stored_second.resource["link"][0]["other"]["reference"],
        format!("Patient/{first}")
    );
}

#[tokio::test]
async fn test_conditional_reference_resolves_to_existing() {
    let storage = InMemoryStorage::new();
    seed(&storage, patient_with_mrn(Some("known"), "1")).await;

    let response = assert_ok!(
        coordinator(&storage)
            .process(transaction(vec![post(
                None,
                json!({
                    "resourceType": "Observation",
                    "status": "final",
                    "subject": {"reference": format!("Patient?identifier={MRN}|1")}
                })
            )]))
            .await
    );
    let observation = storage
        .read("Observation", &created_id(&response.outcomes[0]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(observation.resource["subject"]["reference"], "Patient/known");
}

#[tokio::test]
async fn test_if_none_exist_returns_existing() {
    let storage = InMemoryStorage::new();
    seed(&storage, patient_with_mrn(Some("existing"), "1")).await;

    let mut entry = post(None, patient_with_mrn(None, "1"));
    entry["request"]["ifNoneExist"] = json!(format!("identifier={MRN}|1"));
    let response = assert_ok!(coordinator(&storage).process(transaction(vec![entry])).await);

    assert_eq!(response.statuses(), vec!["200 OK"]);
    assert_eq!(created_id(&response.outcomes[0]), "existing");
    assert_eq!(storage.count_type("Patient"), 1);
}

// =============================================================================
// Ordering and Response Shape
// =============================================================================

#[tokio::test]
async fn test_responses_follow_submission_order() {
    let storage = InMemoryStorage::new();
    seed(&storage, json!({"resourceType": "Patient", "id": "p1"})).await;

    let response = assert_ok!(
        coordinator(&storage)
            .process(transaction(vec![
                request("GET", "Patient/p1"),
                post(None, json!({"resourceType": "Patient"})),
                request("DELETE", "Patient/p2"),
                json!({
                    "resource": {"resourceType": "Patient", "id": "p3"},
                    "request": {"method": "PUT", "url": "Patient/p3"}
                }),
            ]))
            .await
    );

    assert_eq!(
        response.statuses(),
        vec!["200 OK", "201 Created", "204 No Content", "201 Created"]
    );
    let body = response.to_value().unwrap();
    assert_json_include!(
        actual: body,
        expected: json!({
            "resourceType": "Bundle",
            "type": "transaction-response",
            "entry": [
                {"resource": {"id": "p1"}, "response": {"etag": "W/\"1\""}},
                {},
                {},
                {"response": {"location": "Patient/p3/_history/1"}}
            ]
        })
    );
}

#[tokio::test]
async fn test_conditional_create_matches_after_deletes() {
    let storage = InMemoryStorage::new();
    seed(&storage, patient_with_mrn(Some("a"), "1")).await;

    let mut create = post(None, patient_with_mrn(None, "1"));
    create["request"]["ifNoneExist"] = json!(format!("identifier={MRN}|1"));
    let response = assert_ok!(
        coordinator(&storage)
            .process(transaction(vec![create, request("DELETE", "Patient/a")]))
            .await
    );

    assert_eq!(response.statuses(), vec!["201 Created", "204 No Content"]);
    let created = created_id(&response.outcomes[0]);
    assert_ne!(created, "a");
    assert!(storage.read("Patient", "a").await.unwrap().is_none());
    assert!(storage.read("Patient", &created).await.unwrap().is_some());
    assert_eq!(storage.count_type("Patient"), 1);
}

#[tokio::test]
async fn test_conditional_delete_then_conditional_create() {
    let storage = InMemoryStorage::new();
    seed(&storage, patient_with_mrn(Some("a"), "1")).await;

    let mut create = post(None, patient_with_mrn(None, "1"));
    create["request"]["ifNoneExist"] = json!(format!("identifier={MRN}|1"));
    let response = assert_ok!(
        coordinator(&storage)
            .process(transaction(vec![
                request("DELETE", &format!("Patient?identifier={MRN}|1")),
                create,
            ]))
            .await
    );

    assert_eq!(response.statuses(), vec!["204 No Content", "201 Created"]);
    assert!(storage.read("Patient", "a").await.unwrap().is_none());
    assert_eq!(storage.count_type("Patient"), 1);
}

#[tokio::test]
async fn test_update_placeholder_created_in_same_bundle() {
    let storage = InMemoryStorage::new();
    let update = json!({
        "resource": {"resourceType": "Patient", "active": true},
        "request": {"method": "PUT", "url": PATIENT_UUID, "ifMatch": "W/\"1\""}
    });

    let response = assert_ok!(
        coordinator(&storage)
            .process(transaction(vec![
                post(Some(PATIENT_UUID), json!({"resourceType": "Patient"})),
                update,
            ]))
            .await
    );

    assert_eq!(response.statuses(), vec!["201 Created", "200 OK"]);
    let id = created_id(&response.outcomes[0]);
    assert_eq!(created_id(&response.outcomes[1]), id);
    let stored = storage.read("Patient", &id).await.unwrap().unwrap();
    assert_eq!(stored.version_id, "2");
    assert_eq!(stored.resource["active"], true);
}

#[tokio::test]
async fn test_search_sees_earlier_writes() {
    let storage = InMemoryStorage::new();
    let response = assert_ok!(
        coordinator(&storage)
            .process(transaction(vec![
                request("GET", "Patient?active=true"),
                post(None, json!({"resourceType": "Patient", "active": true})),
            ]))
            .await
    );

    let body = response.to_value().unwrap();
    assert_eq!(body["entry"][0]["resource"]["type"], "searchset");
    assert_eq!(body["entry"][0]["resource"]["total"], 1);
}

#[tokio::test]
async fn test_missing_read_target_does_not_abort() {
    let storage = InMemoryStorage::new();
    let response = assert_ok!(
        coordinator(&storage)
            .process(transaction(vec![
                post(None, json!({"resourceType": "Patient"})),
                request("GET", "Patient/nope"),
            ]))
            .await
    );

    assert_eq!(response.statuses(), vec!["201 Created", "404 Not Found"]);
    assert_eq!(storage.count_type("Patient"), 1);
}

#[tokio::test]
async fn test_prefer_modes() {
    let storage = InMemoryStorage::new();
    let coordinator = coordinator(&storage);
    let bundle = || transaction(vec![post(None, json!({"resourceType": "Patient"}))]);

    let minimal = assert_ok!(
        coordinator
            .process_with_prefer(bundle(), Some(PreferReturn::Minimal))
            .await
    );
    let body = minimal.to_value().unwrap();
    assert!(body["entry"][0].get("resource").is_none());
    assert!(
        body["entry"][0]["response"]["location"]
            .as_str()
            .unwrap()
            .ends_with("/_history/1")
    );

    let outcome = assert_ok!(
        coordinator
            .process_with_prefer(bundle(), Some(PreferReturn::OperationOutcome))
            .await
    );
    let body = outcome.to_value().unwrap();
    let diagnostics = body["entry"][0]["response"]["outcome"]["issue"][0]["diagnostics"]
        .as_str()
        .unwrap();
    assert!(diagnostics.starts_with("Successfully created resource \"Patient/"));
}

#[tokio::test]
async fn test_patch_entry() {
    let storage = InMemoryStorage::new();
    seed(
        &storage,
        json!({"resourceType": "Patient", "id": "p1", "active": true}),
    )
    .await;

    let document = json!([{"op": "replace", "path": "/active", "value": false}]);
    let response = assert_ok!(
        coordinator(&storage)
            .process(transaction(vec![json!({
                "resource": {
                    "resourceType": "Binary",
                    "contentType": "application/json-patch+json",
                    "data": base64::engine::general_purpose::STANDARD.encode(document.to_string())
                },
                "request": {"method": "PATCH", "url": "Patient/p1", "ifMatch": "W/\"1\""}
            })]))
            .await
    );

    assert_eq!(response.statuses(), vec!["200 OK"]);
    let stored = storage.read("Patient", "p1").await.unwrap().unwrap();
    assert_eq!(stored.version_id, "2");
    assert_eq!(stored.resource["active"], false);
}

// =============================================================================
// Conditional Delete
// =============================================================================

#[tokio::test]
async fn test_ambiguous_conditional_delete_aborts() {
    let storage = InMemoryStorage::new();
    seed(&storage, patient_with_mrn(Some("a"), "2")).await;
    seed(&storage, patient_with_mrn(Some("b"), "2")).await;

    let err = assert_err!(
        coordinator(&storage)
            .process(transaction(vec![
                post(None, json!({"resourceType": "Patient"})),
                request("DELETE", &format!("Patient?identifier={MRN}|2")),
            ]))
            .await
    );

    assert_eq!(err.kind(), ErrorKind::Ambiguous);
    assert_eq!(err.status(), ResponseStatus::PreconditionFailed);
    assert_eq!(err.entry_index(), Some(1));
    assert!(err.to_string().contains("because this search matched 2 resources"));
    assert_eq!(storage.count_type("Patient"), 2);
}

#[tokio::test]
async fn test_multiple_delete_when_allowed() {
    let storage = InMemoryStorage::new();
    seed(&storage, patient_with_mrn(Some("a"), "2")).await;
    seed(&storage, patient_with_mrn(Some("b"), "2")).await;
    seed(&storage, patient_with_mrn(Some("c"), "3")).await;

    let mut config = EngineConfig::default();
    config.transaction.allow_multiple_delete = true;
    let response = assert_ok!(
        coordinator_with(&storage, &config)
            .process(transaction(vec![request(
                "DELETE",
                &format!("Patient?identifier={MRN}|2")
            )]))
            .await
    );

    assert_eq!(response.statuses(), vec!["204 No Content"]);
    assert_eq!(storage.count_type("Patient"), 1);
    assert!(storage.read("Patient", "c").await.unwrap().is_some());
}

// =============================================================================
// Aborts (Atomicity - Failure Cases)
// =============================================================================

#[tokio::test]
async fn test_duplicate_targets_rejected_before_storage() {
    let storage = InMemoryStorage::new();
    let put = json!({
        "resource": {"resourceType": "Patient", "id": "p1"},
        "request": {"method": "PUT", "url": "Patient/p1"}
    });

    let err = assert_err!(
        coordinator(&storage)
            .process(transaction(vec![put.clone(), put]))
            .await
    );
    assert_eq!(
        err.to_string(),
        "Transaction bundle contains multiple resources with ID: Patient/p1"
    );
    assert_eq!(storage.count(), 0);
}

#[tokio::test]
async fn test_invalid_placeholder_rejected() {
    let storage = InMemoryStorage::new();
    let err = assert_err!(
        coordinator(&storage)
            .process(transaction(vec![post(
                Some("urn:uuid:not-a-uuid"),
                json!({"resourceType": "Patient"})
            )]))
            .await
    );
    assert_eq!(err.kind(), ErrorKind::Malformed);
    assert_eq!(err.entry_index(), Some(0));
    assert_eq!(storage.count(), 0);
}

#[tokio::test]
async fn test_version_conflict_rolls_back() {
    let storage = InMemoryStorage::new();
    seed(&storage, json!({"resourceType": "Patient", "id": "p1"})).await;

    let err = assert_err!(
        coordinator(&storage)
            .process(transaction(vec![
                post(None, json!({"resourceType": "Patient"})),
                json!({
                    "resource": {"resourceType": "Patient", "id": "p1", "active": false},
                    "request": {"method": "PUT", "url": "Patient/p1", "ifMatch": "W/\"5\""}
                }),
            ]))
            .await
    );

    assert_eq!(err.status(), ResponseStatus::Conflict);
    assert_eq!(err.entry_index(), Some(1));
    assert_eq!(storage.count_type("Patient"), 1);
    let stored = storage.read("Patient", "p1").await.unwrap().unwrap();
    assert_eq!(stored.version_id, "1");
}

#[tokio::test]
async fn test_stale_if_match_on_placeholder_rolls_back() {
    let storage = InMemoryStorage::new();
    let update = json!({
        "resource": {"resourceType": "Patient", "active": true},
        "request": {"method": "PUT", "url": PATIENT_UUID, "ifMatch": "W/\"2\""}
    });

    let err = assert_err!(
        coordinator(&storage)
            .process(transaction(vec![
                post(Some(PATIENT_UUID), json!({"resourceType": "Patient"})),
                update,
            ]))
            .await
    );

    assert_eq!(err.status(), ResponseStatus::Conflict);
    assert_eq!(err.entry_index(), Some(1));
    assert_eq!(storage.count(), 0);
}

#[tokio::test]
async fn test_conditional_delete_honours_if_match() {
    let storage = InMemoryStorage::new();
    seed(&storage, patient_with_mrn(Some("a"), "1")).await;
    let mut delete = request("DELETE", &format!("Patient?identifier={MRN}|1"));
    delete["request"]["ifMatch"] = json!("W/\"7\"");

    let err = assert_err!(
        coordinator(&storage)
            .process(transaction(vec![delete.clone()]))
            .await
    );
    assert_eq!(err.kind(), ErrorKind::VersionConflict);
    assert_eq!(err.status(), ResponseStatus::Conflict);
    assert_eq!(storage.count_type("Patient"), 1);

    delete["request"]["ifMatch"] = json!("W/\"1\"");
    let response = assert_ok!(coordinator(&storage).process(transaction(vec![delete])).await);
    assert_eq!(response.statuses(), vec!["204 No Content"]);
    assert_eq!(storage.count_type("Patient"), 0);
}

#[tokio::test]
async fn test_conditional_alias_of_literal_target_rejected() {
    let storage = InMemoryStorage::new();
    seed(&storage, patient_with_mrn(Some("a"), "1")).await;

    let err = assert_err!(
        coordinator(&storage)
            .process(transaction(vec![
                json!({
                    "resource": {"resourceType": "Patient", "id": "a", "active": true},
                    "request": {"method": "PUT", "url": "Patient/a"}
                }),
                json!({
                    "resource": {"resourceType": "Patient", "active": false},
                    "request": {"method": "PUT", "url": format!("Patient?identifier={MRN}|1")}
                }),
            ]))
            .await
    );

    assert_eq!(
        err.to_string(),
        "Transaction bundle contains multiple resources with ID: Patient/a"
    );
    let stored = storage.read("Patient", "a").await.unwrap().unwrap();
    assert_eq!(stored.version_id, "1");
    assert!(stored.resource.get("active").is_none());
}

#[tokio::test]
async fn test_duplicate_created_by_submission_is_detected() {
    let storage = InMemoryStorage::new();
    let mut create = post(None, patient_with_mrn(None, "7"));
    create["request"]["ifNoneExist"] = json!(format!("identifier={MRN}|7"));
    let update = json!({
        "resource": patient_with_mrn(None, "7"),
        "request": {"method": "PUT", "url": format!("Patient?identifier={MRN}|7")}
    });

    let err = assert_err!(
        coordinator(&storage)
            .process(transaction(vec![create, update]))
            .await
    );
    assert!(
        err.to_string()
            .contains("Request would cause multiple resources to match URL")
    );
    assert_eq!(storage.count(), 0);
}

#[tokio::test]
async fn test_failed_submission_as_operation_outcome() {
    let storage = InMemoryStorage::new();
    let (status, body) = coordinator(&storage)
        .process_to_json(
            transaction(vec![request("DELETE", "Patient?foo=bar")]),
            None,
        )
        .await;

    assert_eq!(status, ResponseStatus::BadRequest);
    assert_json_include!(
        actual: body,
        expected: json!({
            "resourceType": "OperationOutcome",
            "issue": [{"severity": "error", "code": "invalid"}]
        })
    );
}

// =============================================================================
// Bundle Shape and Limits
// =============================================================================

#[tokio::test]
async fn test_bundle_types() {
    let storage = InMemoryStorage::new();
    let coordinator = coordinator(&storage);

    let err = assert_err!(
        coordinator
            .process(json!({"resourceType": "Bundle", "type": "searchset"}))
            .await
    );
    assert_eq!(
        err.to_string(),
        "Unable to process transaction where incoming Bundle.type = searchset"
    );

    let response = assert_ok!(
        coordinator
            .process(json!({"resourceType": "Bundle", "type": "collection", "entry": []}))
            .await
    );
    assert_eq!(
        response.bundle.bundle_type.as_deref(),
        Some("batch-response")
    );

    let mut config = EngineConfig::default();
    config.transaction.collection_as_batch = false;
    assert_err!(
        coordinator_with(&storage, &config)
            .process(json!({"resourceType": "Bundle", "type": "collection"}))
            .await
    );
}

// =============================================================================
// Interceptors
// =============================================================================

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl BundleInterceptor for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn on_bundle_start(&self, ctx: &BundleContext) -> Result<(), InterceptorError> {
        self.push(format!("start:{}", ctx.entry_count));
        Ok(())
    }

    async fn on_phase_start(&self, phase: Phase) -> Result<(), InterceptorError> {
        self.push(format!("phase:{phase}"));
        Ok(())
    }

    async fn before_entry(&self, entry: &EntryContext<'_>) -> Result<(), InterceptorError> {
        self.push(format!("before:{}", entry.index));
        Ok(())
    }

    async fn after_entry(
        &self,
        entry: &EntryContext<'_>,
        outcome: &EntryOutcome,
    ) -> Result<(), InterceptorError> {
        self.push(format!("after:{}:{}", entry.index, outcome.http_status.code()));
        Ok(())
    }

    async fn on_bundle_end(
        &self,
        _ctx: &BundleContext,
        committed: bool,
    ) -> Result<(), InterceptorError> {
        self.push(format!("end:{committed}"));
        Ok(())
    }
}

struct ReadOnlyObservations;

#[async_trait]
impl BundleInterceptor for ReadOnlyObservations {
    fn name(&self) -> &str {
        "read_only_observations"
    }

    async fn before_entry(&self, entry: &EntryContext<'_>) -> Result<(), InterceptorError> {
        if entry.resource_type == "Observation" && entry.kind.is_mutating() {
            return Err(InterceptorError::rejected("Observations are read-only"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_interceptor_events_in_phase_order() {
    let storage = InMemoryStorage::new();
    seed(&storage, json!({"resourceType": "Patient", "id": "old"})).await;
    let recorder = Arc::new(Recorder::default());

    assert_ok!(
        coordinator(&storage)
            .with_interceptor(recorder.clone())
            .process(transaction(vec![
                request("GET", "Patient/old"),
                post(None, json!({"resourceType": "Patient"})),
                request("DELETE", "Patient/old"),
            ]))
            .await
    );

    assert_eq!(
        recorder.events(),
        vec![
            "start:3",
            "phase:delete",
            "before:2",
            "after:2:204",
            "phase:mutate",
            "before:1",
            "after:1:201",
            "phase:read",
            "before:0",
            "end:true",
        ]
    );
}

#[tokio::test]
async fn test_interceptor_veto_aborts_transaction() {
    let storage = InMemoryStorage::new();
    let recorder = Arc::new(Recorder::default());

    let err = assert_err!(
        coordinator(&storage)
            .with_interceptor(recorder.clone())
            .with_interceptor(Arc::new(ReadOnlyObservations))
            .process(transaction(vec![
                post(None, json!({"resourceType": "Patient"})),
                post(None, json!({"resourceType": "Observation", "status": "final"})),
            ]))
            .await
    );

    assert_eq!(err.status(), ResponseStatus::BadRequest);
    assert_eq!(err.entry_index(), Some(1));
    assert_eq!(storage.count(), 0);
    assert_eq!(
        recorder.events(),
        vec![
            "start:2",
            "phase:mutate",
            "before:0",
            "after:0:201",
            "before:1",
            "end:false"
        ]
    );
}
