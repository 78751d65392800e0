use serde_json::json;
use versa_core::{Bundle, BundleResponse, Resource, ReturnPreference};
use versa_engine::{EngineConfig, EventKind};
use versa_harness::*;

fn status(response: &BundleResponse, index: usize) -> u16 {
    response.entries[index].status.code()
}

fn outcome_status(response: &BundleResponse) -> Option<u16> {
    response.outcome.as_ref().map(|o| o.status.code())
}

fn created_id(response: &BundleResponse, index: usize) -> Result<String, Box<dyn std::error::Error>> {
    let resource = response.entries[index]
        .resource
        .as_ref()
        .ok_or("entry has no resource")?;
    Ok(resource.id.clone().ok_or("resource has no id")?)
}

fn patient(system: &str, value: &str) -> Resource {
    with_identifier(Resource::new("Patient"), system, value)
}

// ============================================================================
// Atomicity
// ============================================================================

#[test]
fn failing_entry_rolls_back_the_whole_bundle() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let mut server = TestServer::new()?;
    let response = server.transaction(vec![
        create_entry(&temp_url(), Resource::new("Patient")),
        update_entry(Resource::new("Patient").with_id("missing")),
        read_entry("Patient/anything"),
    ])?;

    assert_eq!(outcome_status(&response), Some(400));
    assert_eq!(status(&response, 0), 424);
    assert_eq!(response.entries[0].outcome.as_ref().map(|o| o.text.as_str()), Some("rolled back"));
    assert_eq!(status(&response, 1), 405);
    assert_eq!(status(&response, 2), 424);
    assert_eq!(response.entries[2].outcome.as_ref().map(|o| o.text.as_str()), Some("not attempted"));

    assert_eq!(server.count("Patient")?, 0);
    assert!(server.events.events().is_empty(), "no event for a rolled back change");
    Ok(())
}

#[test]
fn version_conflict_rolls_back_the_whole_bundle() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    let id = server.create(Resource::new("Patient"))?;
    server.events.clear();

    let response = server.transaction(vec![
        create_entry(&temp_url(), Resource::new("Patient")),
        update_if_match_entry(Resource::new("Patient").with_id(id.clone()), "W/\"7\""),
    ])?;

    assert_eq!(outcome_status(&response), Some(400));
    assert_eq!(status(&response, 0), 424);
    assert_eq!(status(&response, 1), 412);
    assert_eq!(server.count("Patient")?, 1);
    assert_eq!(server.history("Patient", &id)?.len(), 1);
    assert!(server.events.events().is_empty());
    Ok(())
}

#[test]
fn events_are_released_only_after_commit() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    let response = server.transaction(vec![
        create_entry(&temp_url(), Resource::new("Organization")),
        create_entry(&temp_url(), Resource::new("Practitioner")),
    ])?;
    assert!(response.is_success());
    assert_eq!(
        server.events.kinds(),
        vec![
            (EventKind::Created, "Organization".to_string()),
            (EventKind::Created, "Practitioner".to_string()),
        ]
    );
    Ok(())
}

#[test]
fn duplicate_full_urls_are_rejected_before_anything_runs() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    let response = server.transaction(vec![
        create_entry("urn:uuid:dup", Resource::new("Patient")),
        create_entry("urn:uuid:dup", Resource::new("Patient")),
    ])?;
    assert_eq!(outcome_status(&response), Some(400));
    let outcome = response.outcome.as_ref().ok_or("missing outcome")?;
    assert!(outcome.diagnostic.text.contains("more than one entry"));
    assert_eq!(response.entries[0].outcome.as_ref().map(|o| o.text.as_str()), Some("not attempted"));
    assert_eq!(server.count("Patient")?, 0);
    Ok(())
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn delete_runs_before_create_regardless_of_entry_order() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    let response = server.transaction(vec![
        create_entry(&temp_url(), patient("http://sys", "1")),
        delete_entry("Patient?identifier=http://sys|1"),
    ])?;

    assert!(response.is_success());
    assert_eq!(status(&response, 0), 201);
    assert_eq!(status(&response, 1), 204, "the delete ran first and matched nothing");
    assert_eq!(server.count("Patient")?, 1);
    Ok(())
}

#[test]
fn conditional_delete_removes_the_old_resource_before_its_replacement_is_created() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    let old = server.create(patient("http://sys", "1"))?;

    let response = server.transaction(vec![
        delete_entry("Patient?identifier=http://sys|1"),
        create_entry(&temp_url(), patient("http://sys", "1")),
    ])?;
    assert_eq!(status(&response, 0), 200);
    assert_eq!(status(&response, 1), 201);

    let new = created_id(&response, 1)?;
    assert_ne!(old, new);
    assert!(server.read("Patient", &old).is_err(), "old resource is tombstoned");
    assert_eq!(server.count("Patient")?, 1);
    Ok(())
}

// ============================================================================
// Reference resolution
// ============================================================================

fn linked_bundle(patient_first: bool) -> Bundle {
    let patient_url = temp_url();
    let patient = create_entry(&patient_url, Resource::new("Patient"));
    let observation = create_entry(
        &temp_url(),
        Resource::new("Observation").with_field("subject", json!({ "reference": patient_url })),
    );
    if patient_first {
        transaction(vec![patient, observation])
    } else {
        transaction(vec![observation, patient])
    }
}

#[test]
fn temporary_references_resolve_in_either_order() -> Result<(), Box<dyn std::error::Error>> {
    for patient_first in [true, false] {
        let mut server = TestServer::new()?;
        let response = server.execute(&linked_bundle(patient_first))?;
        assert!(response.is_success(), "{response:?}");

        let (patient_index, observation_index) = if patient_first { (0, 1) } else { (1, 0) };
        let patient_id = created_id(&response, patient_index)?;
        let observation_id = created_id(&response, observation_index)?;

        let stored = server.read("Observation", &observation_id)?.ok_or("observation missing")?;
        assert_eq!(stored.body["subject"]["reference"], json!(format!("Patient/{patient_id}")));
        assert_eq!(stored.version(), Some(1), "resolution does not add a version");

        let returned = response.entries[observation_index]
            .resource
            .as_ref()
            .ok_or("observation not returned")?;
        assert_eq!(returned.body["subject"]["reference"], stored.body["subject"]["reference"]);
    }
    Ok(())
}

#[test]
fn unresolvable_reference_fails_with_its_location() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    let response = server.transaction(vec![
        create_entry(&temp_url(), Resource::new("Patient")),
        create_entry(
            &temp_url(),
            Resource::new("Observation").with_field("subject", json!({ "reference": "urn:uuid:nowhere" })),
        ),
    ])?;

    assert_eq!(outcome_status(&response), Some(400));
    assert_eq!(status(&response, 1), 400);
    let diagnostic = response.entries[1].outcome.as_ref().ok_or("missing diagnostic")?;
    assert_eq!(diagnostic.code, "reference");
    assert_eq!(diagnostic.location.as_deref(), Some("Bundle.entry[1].Observation.subject"));
    assert!(diagnostic.text.contains("urn:uuid:nowhere"));
    assert_eq!(server.count("Observation")?, 0);
    assert_eq!(server.count("Patient")?, 0);
    Ok(())
}

#[test]
fn literal_references_are_verified_and_made_relative() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    let patient_id = server.create(Resource::new("Patient"))?;
    let base = server.engine.config().server_base.clone();

    let response = server.transaction(vec![create_entry(
        &temp_url(),
        Resource::new("Observation")
            .with_field("subject", json!({ "reference": format!("{base}/Patient/{patient_id}") }))
            .with_field("performer", json!([{ "reference": "https://elsewhere.example.org/Practitioner/x" }])),
    )])?;
    assert!(response.is_success());
    let observation = server
        .read("Observation", &created_id(&response, 0)?)?
        .ok_or("observation missing")?;
    assert_eq!(observation.body["subject"]["reference"], json!(format!("Patient/{patient_id}")));
    assert_eq!(
        observation.body["performer"][0]["reference"],
        json!("https://elsewhere.example.org/Practitioner/x"),
        "external references pass through"
    );

    let response = server.transaction(vec![create_entry(
        &temp_url(),
        Resource::new("Observation").with_field("subject", json!({ "reference": "Patient/does-not-exist" })),
    )])?;
    assert_eq!(status(&response, 0), 400);
    Ok(())
}

#[test]
fn unknown_reference_forms_are_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    let response = server.transaction(vec![create_entry(
        &temp_url(),
        Resource::new("Observation").with_field("subject", json!({ "reference": "Unicorn/1" })),
    )])?;
    assert_eq!(status(&response, 0), 400);
    assert!(response.entries[0].outcome.as_ref().is_some_and(|o| o.text.contains("unknown reference")));
    Ok(())
}

#[test]
fn conditional_and_logical_references_resolve_to_one_resource() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    let patient_id = server.create(patient("http://sys", "p1"))?;
    let org_id = server.create(with_identifier(Resource::new("Organization"), "http://orgs", "o1"))?;

    let response = server.transaction(vec![create_entry(
        &temp_url(),
        Resource::new("Task")
            .with_field("for", json!({ "reference": "Patient?identifier=http://sys|p1" }))
            .with_field(
                "owner",
                json!({ "type": "Organization", "identifier": { "system": "http://orgs", "value": "o1" } }),
            ),
    )])?;
    assert!(response.is_success(), "{response:?}");

    let task = server.read("Task", &created_id(&response, 0)?)?.ok_or("task missing")?;
    assert_eq!(task.body["for"]["reference"], json!(format!("Patient/{patient_id}")));
    assert_eq!(task.body["owner"]["reference"], json!(format!("Organization/{org_id}")));
    assert_eq!(task.body["owner"]["identifier"]["value"], json!("o1"));
    Ok(())
}

#[test]
fn ambiguous_logical_reference_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    server.create(with_identifier(Resource::new("Organization"), "http://orgs", "dup"))?;
    server.create(with_identifier(Resource::new("Organization"), "http://orgs", "dup"))?;

    let response = server.transaction(vec![create_entry(
        &temp_url(),
        Resource::new("Task").with_field(
            "owner",
            json!({ "type": "Organization", "identifier": { "system": "http://orgs", "value": "dup" } }),
        ),
    )])?;
    assert_eq!(outcome_status(&response), Some(400));
    assert_eq!(server.count("Task")?, 0);
    Ok(())
}

#[test]
fn check_references_can_be_turned_off() -> Result<(), Box<dyn std::error::Error>> {
    let config = EngineConfig {
        check_references: false,
        ..EngineConfig::default()
    };
    let mut server = TestServer::with_config(config)?;
    let response = server.execute(&linked_bundle(false))?;
    assert!(response.is_success());
    Ok(())
}

// ============================================================================
// Conditional create and update
// ============================================================================

#[test]
fn conditional_create_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    let mut ids = Vec::new();
    for expected in [201, 200] {
        let response = server.transaction(vec![conditional_create_entry(
            &temp_url(),
            patient("http://sys", "42"),
            "identifier=http://sys|42",
        )])?;
        assert_eq!(status(&response, 0), expected);
        ids.push(created_id(&response, 0)?);
    }
    assert_eq!(ids[0], ids[1]);
    assert_eq!(server.count("Patient")?, 1);
    assert_eq!(server.history("Patient", &ids[0])?.len(), 1);
    assert_eq!(server.events.kinds(), vec![(EventKind::Created, "Patient".to_string())]);
    Ok(())
}

#[test]
fn references_to_a_conditional_create_follow_the_match() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    let existing = server.create(patient("http://sys", "7"))?;

    let patient_url = temp_url();
    let response = server.transaction(vec![
        create_entry(
            &temp_url(),
            Resource::new("Observation").with_field("subject", json!({ "reference": patient_url })),
        ),
        conditional_create_entry(&patient_url, patient("http://sys", "7"), "?identifier=http://sys|7"),
    ])?;
    assert!(response.is_success(), "{response:?}");
    assert_eq!(status(&response, 1), 200);

    let observation = server
        .read("Observation", &created_id(&response, 0)?)?
        .ok_or("observation missing")?;
    assert_eq!(observation.body["subject"]["reference"], json!(format!("Patient/{existing}")));
    Ok(())
}

#[test]
fn conditional_create_with_several_matches_is_a_precondition_failure() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    server.create(patient("http://sys", "twin"))?;
    server.create(patient("http://sys", "twin"))?;

    let response = server.transaction(vec![conditional_create_entry(
        &temp_url(),
        patient("http://sys", "twin"),
        "identifier=http://sys|twin",
    )])?;
    assert_eq!(status(&response, 0), 412);
    assert_eq!(outcome_status(&response), Some(400));
    Ok(())
}

#[test]
fn conditional_update_creates_updates_or_rejects() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;

    // no match, no id: create
    let response = server.transaction(vec![conditional_update_entry(
        Some(&temp_url()),
        patient("http://sys", "u1"),
        "identifier=http://sys|u1",
    )])?;
    assert_eq!(status(&response, 0), 201);
    let id = created_id(&response, 0)?;

    // one match: update that id
    let response = server.transaction(vec![conditional_update_entry(
        None,
        patient("http://sys", "u1").with_field("active", json!(false)),
        "identifier=http://sys|u1",
    )])?;
    assert_eq!(status(&response, 0), 200);
    assert_eq!(created_id(&response, 0)?, id);
    assert_eq!(server.read("Patient", &id)?.and_then(|p| p.version()), Some(2));

    // one match, different id
    let response = server.transaction(vec![conditional_update_entry(
        None,
        patient("http://sys", "u1").with_id("someone-else"),
        "identifier=http://sys|u1",
    )])?;
    assert_eq!(status(&response, 0), 400);

    // no match with a real id: no update-as-create
    let response = server.transaction(vec![conditional_update_entry(
        None,
        patient("http://sys", "u2").with_id("fresh-id"),
        "identifier=http://sys|u2",
    )])?;
    assert_eq!(status(&response, 0), 405);
    assert_eq!(server.count("Patient")?, 1);
    Ok(())
}

#[test]
fn update_by_id_checks_the_precondition_and_resurrects() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    let id = server.create(Resource::new("Patient"))?;

    let stale = server.transaction(vec![update_if_match_entry(
        Resource::new("Patient").with_id(id.clone()),
        "W/\"7\"",
    )])?;
    assert_eq!(status(&stale, 0), 412);

    let malformed = server.transaction(vec![update_if_match_entry(
        Resource::new("Patient").with_id(id.clone()),
        "not-an-etag",
    )])?;
    assert_eq!(status(&malformed, 0), 400);

    let response = server.transaction(vec![delete_entry(&format!("Patient/{id}"))])?;
    assert_eq!(status(&response, 0), 200);

    let response = server.transaction(vec![update_entry(Resource::new("Patient").with_id(id.clone()))])?;
    assert_eq!(status(&response, 0), 200);
    assert_eq!(response.entries[0].etag.as_deref(), Some("W/\"2\""));
    assert!(server.read("Patient", &id)?.is_some());
    Ok(())
}

#[test]
fn repeated_updates_of_one_id_report_their_own_versions() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    let id = server.create(Resource::new("Patient"))?;
    server.events.clear();

    let response = server.transaction(vec![
        update_entry(Resource::new("Patient").with_id(id.clone()).with_field("active", json!(true))),
        update_entry(Resource::new("Patient").with_id(id.clone()).with_field("active", json!(false))),
    ])?;
    assert!(response.is_success());

    assert_eq!(response.entries[0].etag.as_deref(), Some("W/\"2\""));
    let first = response.entries[0].resource.as_ref().ok_or("first update not returned")?;
    assert_eq!(first.body["active"], json!(true));
    assert_eq!(response.entries[1].etag.as_deref(), Some("W/\"3\""));
    let second = response.entries[1].resource.as_ref().ok_or("second update not returned")?;
    assert_eq!(second.body["active"], json!(false));

    let versions: Vec<Option<u64>> = server
        .events
        .events()
        .iter()
        .map(|event| event.resource.as_ref().and_then(Resource::version))
        .collect();
    assert_eq!(versions, vec![Some(2), Some(3)]);
    Ok(())
}

#[test]
fn client_meta_is_kept_but_the_version_stamp_is_not() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    let tagged = Resource::from_value(json!({
        "resourceType": "Patient",
        "meta": {
            "versionId": "42",
            "tag": [{"system": "http://example.org/tags", "code": "ALL"}]
        }
    }))?;
    let bundle: Bundle = serde_json::from_value(serde_json::to_value(transaction(vec![create_entry(
        &temp_url(),
        tagged,
    )]))?)?;

    let response = server.execute(&bundle)?;
    assert_eq!(status(&response, 0), 201);
    let id = created_id(&response, 0)?;

    let stored = server.read("Patient", &id)?.ok_or("created patient missing")?;
    assert_eq!(stored.version(), Some(1));
    let value = serde_json::to_value(&stored)?;
    assert_eq!(value["meta"]["tag"][0]["code"], json!("ALL"));

    let response = server.transaction(vec![update_entry(stored.clone())])?;
    assert_eq!(status(&response, 0), 200);
    let updated = server.read("Patient", &id)?.ok_or("updated patient missing")?;
    assert_eq!(updated.version(), Some(2));
    assert_eq!(serde_json::to_value(&updated)?["meta"]["tag"][0]["code"], json!("ALL"));
    Ok(())
}

// ============================================================================
// Delete and read
// ============================================================================

#[test]
fn delete_outcomes() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    let id = server.create(Resource::new("Patient"))?;
    server.events.clear();

    let response = server.transaction(vec![delete_entry("Patient/unknown")])?;
    assert_eq!(status(&response, 0), 404);

    let response = server.transaction(vec![delete_entry(&format!("Patient/{id}"))])?;
    assert_eq!(status(&response, 0), 200);
    let response = server.transaction(vec![delete_entry(&format!("Patient/{id}"))])?;
    assert_eq!(status(&response, 0), 200, "deleting twice is idempotent");
    assert_eq!(server.events.kinds(), vec![(EventKind::Deleted, "Patient".to_string())]);

    let response = server.transaction(vec![delete_entry("Patient?identifier=http://sys|none")])?;
    assert_eq!(status(&response, 0), 204);
    Ok(())
}

#[test]
fn read_shapes_and_statuses() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    let id = server.create(patient("http://sys", "r1"))?;
    server.transaction(vec![update_entry(patient("http://sys", "r1").with_id(id.clone()))])?;

    let response = server.transaction(vec![
        read_entry(&format!("Patient/{id}")),
        read_entry(&format!("Patient/{id}/_history/1")),
        read_entry("Patient?identifier=http://sys|r1"),
    ])?;
    assert!(response.is_success());
    assert_eq!(response.entries[0].etag.as_deref(), Some("W/\"2\""));
    assert_eq!(response.entries[1].etag.as_deref(), Some("W/\"1\""));
    assert_eq!(created_id(&response, 2)?, id);

    let mut conditional = read_entry(&format!("Patient/{id}"));
    conditional.request.if_none_match = Some("W/\"2\"".into());
    let response = server.transaction(vec![conditional])?;
    assert_eq!(status(&response, 0), 304);

    let mut since = read_entry(&format!("Patient/{id}"));
    since.request.if_modified_since = Some(chrono::Utc::now() + chrono::Duration::seconds(5));
    let response = server.transaction(vec![since])?;
    assert_eq!(status(&response, 0), 304);

    let response = server.transaction(vec![read_entry("Patient/nobody")])?;
    assert_eq!(status(&response, 0), 404);
    let response = server.transaction(vec![read_entry("Unicorn/1")])?;
    assert_eq!(status(&response, 0), 404);

    server.transaction(vec![delete_entry(&format!("Patient/{id}"))])?;
    let response = server.transaction(vec![read_entry(&format!("Patient/{id}"))])?;
    assert_eq!(status(&response, 0), 410);
    Ok(())
}

#[test]
fn read_can_address_a_resource_created_in_the_same_bundle() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    let url = temp_url();
    let response = server.transaction(vec![read_entry(&url), create_entry(&url, Resource::new("Patient"))])?;
    assert!(response.is_success(), "{response:?}");
    assert_eq!(created_id(&response, 0)?, created_id(&response, 1)?);
    Ok(())
}

#[test]
fn lenient_search_ignores_unsupported_parameters() -> Result<(), Box<dyn std::error::Error>> {
    let strict_query = "Patient?identifier=http://sys|s1&colour=blue";

    let mut strict = TestServer::new()?;
    strict.create(patient("http://sys", "s1"))?;
    let response = strict.transaction(vec![read_entry(strict_query)])?;
    assert_eq!(status(&response, 0), 400);

    let config = EngineConfig {
        strict_search_handling: false,
        ..EngineConfig::default()
    };
    let mut lenient = TestServer::with_config(config)?;
    lenient.create(patient("http://sys", "s1"))?;
    let response = lenient.transaction(vec![read_entry(strict_query)])?;
    assert_eq!(status(&response, 0), 200);
    Ok(())
}

// ============================================================================
// Authorization
// ============================================================================

#[test]
fn forbidden_is_propagated_unchanged() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?.with_access(ScriptedAccess::new().deny_create("Organization"));
    let response = server.transaction(vec![
        create_entry(&temp_url(), Resource::new("Patient")),
        create_entry(&temp_url(), Resource::new("Organization")),
    ])?;
    assert_eq!(outcome_status(&response), Some(403));
    assert_eq!(status(&response, 1), 403);
    assert_eq!(server.count("Patient")?, 0);
    Ok(())
}

#[test]
fn logical_resolution_only_sees_readable_resources() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    server.create(with_identifier(Resource::new("Organization"), "http://orgs", "hidden"))?;
    let mut server = server.with_access(ScriptedAccess::new().deny_read("Organization"));

    let response = server.transaction(vec![create_entry(
        &temp_url(),
        Resource::new("Task").with_field(
            "owner",
            json!({ "type": "Organization", "identifier": { "system": "http://orgs", "value": "hidden" } }),
        ),
    )])?;
    assert_eq!(outcome_status(&response), Some(403));
    Ok(())
}

#[test]
fn minimal_preference_omits_the_resource() -> Result<(), Box<dyn std::error::Error>> {
    let mut server = TestServer::new()?;
    let bundle = transaction(vec![create_entry(&temp_url(), Resource::new("Patient"))]);
    let user = server.user.clone();
    let response = server.engine.execute(&bundle, &user, ReturnPreference::Minimal)?;
    let entry = &response.entries[0];
    assert_eq!(entry.status.code(), 201);
    assert!(entry.resource.is_none());
    assert!(entry.location.as_deref().is_some_and(|l| l.ends_with("/_history/1")));
    Ok(())
}
