use std::sync::{Arc, Barrier};
use std::thread;

use serde_json::json;
use versa_core::{Resource, TypeRegistry};
use versa_harness::{SharedDatabase, init_tracing, update_if_match_entry};
use versa_storage::{ResourceStore, SqliteStorage, StorageError, VersionedStore};

fn open() -> Result<(SqliteStorage, ResourceStore), Box<dyn std::error::Error>> {
    let registry = TypeRegistry::standard();
    let storage = SqliteStorage::open_in_memory(&registry)?;
    Ok((storage, ResourceStore::new(Arc::new(registry))))
}

// ============================================================================
// Version chains
// ============================================================================

#[test]
fn create_then_updates_yield_contiguous_versions() -> Result<(), Box<dyn std::error::Error>> {
    let (storage, store) = open()?;
    let patients = store.for_type("Patient")?;
    let conn = storage.conn();

    conn.execute_batch("BEGIN IMMEDIATE")?;
    let mut current = patients.create(conn, Resource::new("Patient"), "p1")?;
    assert_eq!(current.version(), Some(1));
    for expected in 2..=5 {
        let next = current.clone().with_field("revision", json!(expected));
        current = patients.update(conn, next, current.version())?;
        assert_eq!(current.version(), Some(expected));
    }
    conn.execute_batch("COMMIT")?;

    let versions: Vec<u64> = patients
        .history(conn, "p1")?
        .iter()
        .filter_map(|row| row.resource.version())
        .collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);

    let latest = patients.read(conn, "p1")?.ok_or("p1 missing")?;
    assert_eq!(latest.version(), Some(5));
    assert_eq!(latest.body["revision"], json!(5));

    let first = patients.read_version(conn, "p1", 1)?.ok_or("version 1 missing")?;
    assert!(first.body.get("revision").is_none());
    Ok(())
}

#[test]
fn stale_expected_version_is_a_conflict() -> Result<(), Box<dyn std::error::Error>> {
    let (storage, store) = open()?;
    let patients = store.for_type("Patient")?;
    let conn = storage.conn();

    conn.execute_batch("BEGIN IMMEDIATE")?;
    let v1 = patients.create(conn, Resource::new("Patient"), "p1")?;
    patients.update(conn, v1.clone(), Some(1))?;
    let err = patients.update(conn, v1, Some(1)).unwrap_err();
    conn.execute_batch("ROLLBACK")?;

    match err {
        StorageError::VersionConflict { expected, actual, .. } => {
            assert_eq!((expected, actual), (1, 2));
        }
        other => panic!("expected a version conflict, got {other:?}"),
    }
    Ok(())
}

// ============================================================================
// Soft delete and resurrection
// ============================================================================

#[test]
fn delete_tombstones_every_version_and_update_resurrects() -> Result<(), Box<dyn std::error::Error>> {
    let (storage, store) = open()?;
    let patients = store.for_type("Patient")?;
    let conn = storage.conn();

    conn.execute_batch("BEGIN IMMEDIATE")?;
    let v1 = patients.create(conn, Resource::new("Patient"), "p1")?;
    patients.update(conn, v1, None)?;
    assert!(patients.delete(conn, "p1")?);
    assert!(!patients.delete(conn, "p1")?, "second delete is a no-op");
    conn.execute_batch("COMMIT")?;

    assert!(matches!(
        patients.read(conn, "p1"),
        Err(StorageError::Deleted { version: 2, .. })
    ));
    let history = patients.history(conn, "p1")?;
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|row| row.deleted));
    assert!(!patients.exists_live(conn, "p1", None)?);

    conn.execute_batch("BEGIN IMMEDIATE")?;
    let revived = patients.update(conn, Resource::new("Patient").with_id("p1"), None)?;
    conn.execute_batch("COMMIT")?;

    assert_eq!(revived.version(), Some(3));
    assert_eq!(patients.read(conn, "p1")?.and_then(|r| r.version()), Some(3));
    assert!(patients.history(conn, "p1")?.iter().all(|row| !row.deleted));
    Ok(())
}

#[test]
fn deleting_an_unknown_id_is_not_found() -> Result<(), Box<dyn std::error::Error>> {
    let (storage, store) = open()?;
    let patients = store.for_type("Patient")?;
    let conn = storage.conn();

    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = patients.delete(conn, "never-created");
    conn.execute_batch("ROLLBACK")?;
    assert!(matches!(result, Err(StorageError::NotFound { .. })));
    Ok(())
}

#[test]
fn mutations_outside_a_transaction_fail_fast() -> Result<(), Box<dyn std::error::Error>> {
    let (storage, store) = open()?;
    let patients = store.for_type("Patient")?;
    let conn = storage.conn();
    let created = patients.create(conn, Resource::new("Patient"), "p1")?;

    assert!(matches!(
        patients.update(conn, created.clone(), None),
        Err(StorageError::IllegalState(_))
    ));
    assert!(matches!(patients.delete(conn, "p1"), Err(StorageError::IllegalState(_))));
    assert!(matches!(
        patients.update_in_place(conn, &created),
        Err(StorageError::IllegalState(_))
    ));
    Ok(())
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn concurrent_updates_with_the_same_precondition_yield_one_conflict() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let db = SharedDatabase::new()?;
    let mut seed = db.open_server()?;
    let id = seed.create(Resource::new("Patient").with_field("active", json!(true)))?;

    // Open every connection up front so schema setup does not race.
    let writers = vec![db.open_server()?, db.open_server()?];
    let barrier = Arc::new(Barrier::new(writers.len()));
    let handles: Vec<_> = writers
        .into_iter()
        .enumerate()
        .map(|(n, mut server)| {
            let barrier = Arc::clone(&barrier);
            let resource = Resource::new("Patient")
                .with_id(id.clone())
                .with_field("name", json!(format!("writer {n}")));
            thread::spawn(move || -> Result<u16, String> {
                barrier.wait();
                let response = server
                    .transaction(vec![update_if_match_entry(resource, "W/\"1\"")])
                    .map_err(|e| e.to_string())?;
                Ok(response.entries[0].status.code())
            })
        })
        .collect();

    let mut statuses = Vec::new();
    for handle in handles {
        statuses.push(handle.join().map_err(|_| "writer thread panicked")??);
    }
    statuses.sort_unstable();
    assert_eq!(statuses, vec![200, 412]);

    let current = seed.read("Patient", &id)?.ok_or("patient missing")?;
    assert_eq!(current.version(), Some(2));
    assert_eq!(seed.history("Patient", &id)?.len(), 2);
    Ok(())
}

#[test]
fn file_backed_store_survives_reopen() -> Result<(), Box<dyn std::error::Error>> {
    let db = SharedDatabase::new()?;
    let id = db.open_server()?.create(Resource::new("Organization"))?;

    let reopened = db.open_server()?;
    assert!(reopened.read("Organization", &id)?.is_some());

    let storage = db.open_storage()?;
    let store = ResourceStore::new(Arc::new(TypeRegistry::standard()));
    assert!(store.for_type("Organization")?.exists_live(storage.conn(), &id, Some(1))?);
    Ok(())
}
