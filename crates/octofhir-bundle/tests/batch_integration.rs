//! Batch bundle scenarios: every entry succeeds or fails on its own.

use std::sync::Arc;

use assert_json_diff::assert_json_include;
use octofhir_bundle::{BundleMode, EngineConfig, TransactionCoordinator};
use octofhir_db_memory::InMemoryStorage;
use octofhir_storage::FhirStorage;
use serde_json::{Value, json};
use tokio_test::assert_ok;

const PATIENT_UUID: &str = "urn:uuid:3f2d6c1e-9b7a-4c55-a0e2-4b1f7d2c9e11";

fn coordinator(storage: &InMemoryStorage) -> TransactionCoordinator {
    TransactionCoordinator::new(
        Arc::new(storage.clone()),
        storage.registry().clone(),
        &EngineConfig::default(),
    )
}

fn batch(entries: Vec<Value>) -> Value {
    json!({"resourceType": "Bundle", "type": "batch", "entry": entries})
}

#[tokio::test]
async fn test_partial_failure_keeps_successful_entries() {
    let storage = InMemoryStorage::new();
    storage
        .create(&json!({"resourceType": "Patient", "id": "p1"}))
        .await
        .unwrap();

    let response = assert_ok!(
        coordinator(&storage)
            .process(batch(vec![
                json!({
                    "resource": {"resourceType": "Patient", "active": true},
                    "request": {"method": "POST", "url": "Patient"}
                }),
                json!({"request": {"method": "GET", "url": "Patient/missing"}}),
                json!({
                    "resource": {"resourceType": "Patient", "id": "p1", "active": false},
                    "request": {"method": "PUT", "url": "Patient/p1", "ifMatch": "W/\"9\""}
                }),
                json!({"resource": {"resourceType": "Patient"}}),
            ]))
            .await
    );

    assert_eq!(response.mode, BundleMode::Batch);
    assert_eq!(
        response.statuses(),
        vec!["201 Created", "404 Not Found", "409 Conflict", "400 Bad Request"]
    );
    assert_eq!(storage.count_type("Patient"), 2);
    let p1 = storage.read("Patient", "p1").await.unwrap().unwrap();
    assert_eq!(p1.version_id, "1");

    let body = response.to_value().unwrap();
    assert_json_include!(
        actual: body,
        expected: json!({
            "type": "batch-response",
            "entry": [
                {},
                {"response": {"outcome": {"issue": [{"code": "not-found"}]}}},
                {"response": {"outcome": {"issue": [{"code": "conflict"}]}}},
                {"response": {"outcome": {"issue": [{"code": "invalid"}]}}}
            ]
        })
    );
}

#[tokio::test]
async fn test_cross_entry_references_are_rejected() {
    let storage = InMemoryStorage::new();
    let response = assert_ok!(
        coordinator(&storage)
            .process(batch(vec![
                json!({
                    "fullUrl": PATIENT_UUID,
                    "resource": {"resourceType": "Patient"},
                    "request": {"method": "POST", "url": "Patient"}
                }),
                json!({
                    "resource": {
                        "resourceType": "Observation",
                        "status": "final",
                        "subject": {"reference": PATIENT_UUID}
                    },
                    "request": {"method": "POST", "url": "Observation"}
                }),
            ]))
            .await
    );

    assert_eq!(response.statuses(), vec!["201 Created", "400 Bad Request"]);
    assert_eq!(storage.count_type("Observation"), 0);
    let error = response.outcomes[1].error.as_ref().unwrap();
    assert!(error.to_string().contains("non-conformant"));
}

#[tokio::test]
async fn test_contested_target_fails_both_entries() {
    let storage = InMemoryStorage::new();
    let put = |active: bool| {
        json!({
            "resource": {"resourceType": "Patient", "id": "p1", "active": active},
            "request": {"method": "PUT", "url": "Patient/p1"}
        })
    };

    let response = assert_ok!(
        coordinator(&storage)
            .process(batch(vec![put(true), put(false)]))
            .await
    );
    assert_eq!(
        response.statuses(),
        vec!["400 Bad Request", "400 Bad Request"]
    );
    assert_eq!(storage.count(), 0);
}

#[tokio::test]
async fn test_deletes_run_before_reads() {
    let storage = InMemoryStorage::new();
    storage
        .create(&json!({"resourceType": "Patient", "id": "p1"}))
        .await
        .unwrap();

    let response = assert_ok!(
        coordinator(&storage)
            .process(batch(vec![
                json!({"request": {"method": "GET", "url": "Patient/p1"}}),
                json!({"request": {"method": "DELETE", "url": "Patient/p1"}}),
            ]))
            .await
    );
    assert_eq!(response.statuses(), vec!["404 Not Found", "204 No Content"]);
}

#[tokio::test]
async fn test_ambiguous_conditional_entry_fails_alone() {
    let storage = InMemoryStorage::new();
    for id in ["a", "b"] {
        storage
            .create(&json!({
                "resourceType": "Patient",
                "id": id,
                "identifier": [{"system": "http://acme.org/mrn", "value": "2"}]
            }))
            .await
            .unwrap();
    }

    let response = assert_ok!(
        coordinator(&storage)
            .process(batch(vec![
                json!({"request": {"method": "DELETE", "url": "Patient?identifier=http://acme.org/mrn|2"}}),
                json!({
                    "resource": {"resourceType": "Patient"},
                    "request": {"method": "POST", "url": "Patient"}
                }),
            ]))
            .await
    );
    assert_eq!(
        response.statuses(),
        vec!["412 Precondition Failed", "201 Created"]
    );
    assert_eq!(storage.count_type("Patient"), 3);
}
