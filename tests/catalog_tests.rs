/*!
 * Storage catalog tests
 * Namespace-to-ident mapping, metadata round trips, rename/drop semantics
 * and persistence across restart
 */

use std::sync::Arc;

use bson::doc;

use rookdb::catalog_entry::CollectionMetaData;
use rookdb::engine::{CollectionOptions, Direction, IndexDescriptor, KvEngine, RecordId};
use rookdb::error::RookDBError;
use rookdb::heap_engine::HeapEngine;
use rookdb::recovery_unit::WriteUnitOfWork;
use rookdb::storage_engine::KvStorageEngine;

fn open_storage(engine: &HeapEngine) -> KvStorageEngine {
    KvStorageEngine::open(Arc::new(engine.clone())).unwrap()
}

fn create_collection(storage: &KvStorageEngine, ns: &str) {
    create_collection_with_options(storage, ns, &CollectionOptions::default());
}

fn create_collection_with_options(storage: &KvStorageEngine, ns: &str, options: &CollectionOptions) {
    let opctx = storage.new_operation_context();
    let db = storage.get_database_catalog_entry(ns.split('.').next().unwrap());
    let mut wuow = WriteUnitOfWork::new(&opctx);
    db.create_collection(&opctx, ns, options).unwrap();
    wuow.commit();
}

#[test]
fn idents_survive_restart_and_never_recur() {
    let engine = HeapEngine::new();
    let storage = open_storage(&engine);
    create_collection(&storage, "db.c1");
    let ident1 = storage.catalog().get_collection_ident("db.c1");

    // Restart: rebuild the catalog wrappers over the same underlying storage.
    drop(storage);
    let storage = open_storage(&engine);
    assert_eq!(storage.catalog().get_collection_ident("db.c1"), ident1);
    let db = storage.get_database_catalog_entry("db");
    assert!(db.get_record_store("db.c1").is_some());

    // A drop/create cycle must produce a fresh ident.
    let opctx = storage.new_operation_context();
    let mut wuow = WriteUnitOfWork::new(&opctx);
    db.drop_collection(&opctx, "db.c1").unwrap();
    wuow.commit();
    create_collection(&storage, "db.c1");
    let ident2 = storage.catalog().get_collection_ident("db.c1");
    assert_ne!(ident1, ident2);
}

#[test]
fn create_and_drop_namespace_errors() {
    let engine = HeapEngine::new();
    let storage = open_storage(&engine);
    create_collection(&storage, "db.c1");

    let opctx = storage.new_operation_context();
    let db = storage.get_database_catalog_entry("db");

    let mut wuow = WriteUnitOfWork::new(&opctx);
    let err = db
        .create_collection(&opctx, "db.c1", &CollectionOptions::default())
        .unwrap_err();
    assert!(matches!(err, RookDBError::NamespaceExists(_)));
    wuow.commit();

    let mut wuow = WriteUnitOfWork::new(&opctx);
    let err = db.drop_collection(&opctx, "db.nope").unwrap_err();
    assert!(matches!(err, RookDBError::NamespaceNotFound(_)));
    wuow.commit();
}

#[test]
fn uncommitted_create_leaves_no_trace() {
    let engine = HeapEngine::new();
    let storage = open_storage(&engine);
    let opctx = storage.new_operation_context();
    let db = storage.get_database_catalog_entry("db");

    {
        let _wuow = WriteUnitOfWork::new(&opctx);
        db.create_collection(&opctx, "db.c1", &CollectionOptions::default())
            .unwrap();
        // Unwinds without commit.
    }
    assert!(db.get_record_store("db.c1").is_none());
    assert!(storage.catalog().all_collections().is_empty());

    // A later create must succeed from a clean slate.
    create_collection(&storage, "db.c1");
    assert!(db.get_record_store("db.c1").is_some());
}

#[test]
fn rename_keeps_ident_and_clears_temp() {
    let engine = HeapEngine::new();
    let storage = open_storage(&engine);
    let options = CollectionOptions {
        temp: true,
        ..Default::default()
    };
    create_collection_with_options(&storage, "db.from", &options);
    let ident = storage.catalog().get_collection_ident("db.from");

    let opctx = storage.new_operation_context();
    let db = storage.get_database_catalog_entry("db");
    let mut wuow = WriteUnitOfWork::new(&opctx);
    db.rename_collection(&opctx, "db.from", "db.to", false).unwrap();
    wuow.commit();

    assert_eq!(storage.catalog().get_collection_ident("db.to"), ident);
    let md = storage.catalog().get_metadata(&opctx, "db.to").unwrap();
    assert_eq!(md.ns, "db.to");
    assert!(!md.options.temp);
    assert!(db.get_record_store("db.from").is_none());

    // stayTemp preserves the flag.
    let mut wuow = WriteUnitOfWork::new(&opctx);
    db.create_collection(&opctx, "db.tmp", &options).unwrap();
    db.rename_collection(&opctx, "db.tmp", "db.tmp2", true).unwrap();
    wuow.commit();
    let md = storage.catalog().get_metadata(&opctx, "db.tmp2").unwrap();
    assert!(md.options.temp);
}

#[test]
fn metadata_updates_allocate_and_preserve_index_idents() {
    let engine = HeapEngine::new();
    let storage = open_storage(&engine);
    create_collection(&storage, "db.c1");
    let opctx = storage.new_operation_context();
    let catalog = storage.catalog();
    let collection_ident = catalog.get_collection_ident("db.c1");

    let mut md = catalog.get_metadata(&opctx, "db.c1").unwrap();
    md.indexes.push(rookdb::catalog_entry::IndexMetaData {
        spec: doc! { "name": "a_1", "key": { "a": 1 } },
        ready: false,
        head: RecordId::NULL,
        multikey: false,
    });
    {
        let mut wuow = WriteUnitOfWork::new(&opctx);
        catalog.put_metadata(&opctx, "db.c1", &md).unwrap();
        wuow.commit();
    }
    let index_ident = catalog.get_index_ident(&opctx, "db.c1", "a_1");
    assert!(index_ident.starts_with(&format!("{}$a_1", collection_ident)));

    // Updating unrelated metadata keeps the mapping stable.
    md.indexes[0].ready = true;
    {
        let mut wuow = WriteUnitOfWork::new(&opctx);
        catalog.put_metadata(&opctx, "db.c1", &md).unwrap();
        wuow.commit();
    }
    assert_eq!(catalog.get_index_ident(&opctx, "db.c1", "a_1"), index_ident);
    assert_eq!(catalog.get_collection_ident("db.c1"), collection_ident);

    // Dropping the index and re-adding one under the same name allocates a
    // fresh ident.
    md.indexes.clear();
    {
        let mut wuow = WriteUnitOfWork::new(&opctx);
        catalog.put_metadata(&opctx, "db.c1", &md).unwrap();
        wuow.commit();
    }
    md.indexes.push(rookdb::catalog_entry::IndexMetaData {
        spec: doc! { "name": "a_1", "key": { "a": 1 } },
        ready: false,
        head: RecordId::NULL,
        multikey: false,
    });
    {
        let mut wuow = WriteUnitOfWork::new(&opctx);
        catalog.put_metadata(&opctx, "db.c1", &md).unwrap();
        wuow.commit();
    }
    assert_ne!(catalog.get_index_ident(&opctx, "db.c1", "a_1"), index_ident);
}

#[test]
fn catalog_record_layout_matches_contract() {
    let engine = HeapEngine::new();
    let storage = open_storage(&engine);
    create_collection(&storage, "db.c1");
    let opctx = storage.new_operation_context();

    // Read the raw catalog record store and check the field names.
    let rs = engine
        .get_record_store(&opctx, "_mdb_catalog", "_mdb_catalog", &CollectionOptions::default())
        .unwrap();
    let mut iter = rs.iterator(&opctx, None, Direction::Forward, false);
    let (_, data) = iter.next().expect("one catalog record");
    let obj: bson::Document = bson::from_slice(&data).unwrap();

    assert_eq!(obj.get_str("ns").unwrap(), "db.c1");
    let ident = obj.get_str("ident").unwrap();
    assert!(ident.starts_with("db.c1-"));
    let md = obj.get_document("md").unwrap();
    assert_eq!(md.get_str("ns").unwrap(), "db.c1");
    assert!(md.get_document("options").is_ok());
    assert!(md.get_array("indexes").is_ok());
    assert!(obj.get_document("idxIdent").is_ok());

    let parsed = CollectionMetaData::from_document(md).unwrap();
    assert_eq!(parsed.ns, "db.c1");
    assert!(parsed.indexes.is_empty());
}

#[test]
fn index_build_lifecycle_through_collection_entry() {
    let engine = HeapEngine::new();
    let storage = open_storage(&engine);
    create_collection(&storage, "db.c1");
    let opctx = storage.new_operation_context();
    let db = storage.get_database_catalog_entry("db");
    let entry = db.get_collection_catalog_entry("db.c1").unwrap();

    let descriptor = IndexDescriptor::new("ttl_1", doc! { "created": 1 });

    {
        let mut wuow = WriteUnitOfWork::new(&opctx);
        entry.prepare_for_index_build(&opctx, &descriptor).unwrap();
        wuow.commit();
    }
    let md = entry.get_metadata(&opctx).unwrap();
    assert_eq!(md.indexes.len(), 1);
    assert!(!md.indexes[0].ready);

    {
        let mut wuow = WriteUnitOfWork::new(&opctx);
        entry.index_build_success(&opctx, "ttl_1").unwrap();
        entry.set_index_head(&opctx, "ttl_1", RecordId(42)).unwrap();
        assert!(entry.set_index_is_multikey(&opctx, "ttl_1", true).unwrap());
        assert!(!entry.set_index_is_multikey(&opctx, "ttl_1", true).unwrap());
        wuow.commit();
    }
    let md = entry.get_metadata(&opctx).unwrap();
    assert!(md.indexes[0].ready);
    assert_eq!(md.indexes[0].head, RecordId(42));
    assert!(md.indexes[0].multikey);

    // The opened index handle resolves through the catalog mapping.
    assert!(entry.get_index(&opctx, "ttl_1").is_ok());

    // TTL updates require an existing expireAfterSeconds field.
    assert!(entry.update_ttl_setting(&opctx, "ttl_1", 600).is_err());

    {
        let mut wuow = WriteUnitOfWork::new(&opctx);
        entry.remove_index(&opctx, "ttl_1").unwrap();
        wuow.commit();
    }
    let md = entry.get_metadata(&opctx).unwrap();
    assert!(md.indexes.is_empty());
}

#[test]
fn drop_database_removes_every_collection() {
    let engine = HeapEngine::new();
    let storage = open_storage(&engine);
    create_collection(&storage, "db.c1");
    create_collection(&storage, "db.c2");
    create_collection(&storage, "other.c1");

    assert_eq!(storage.list_databases(), vec!["db".to_string(), "other".to_string()]);

    let opctx = storage.new_operation_context();
    {
        let mut wuow = WriteUnitOfWork::new(&opctx);
        storage.drop_database(&opctx, "db").unwrap();
        wuow.commit();
    }
    assert_eq!(storage.catalog().all_collections(), vec!["other.c1".to_string()]);
    assert_eq!(storage.list_databases(), vec!["other".to_string()]);
}

#[test]
fn catalog_map_matches_store_after_restart() {
    let engine = HeapEngine::new();
    let storage = open_storage(&engine);
    create_collection(&storage, "db.a");
    create_collection(&storage, "db.b");
    let before = storage.catalog().all_collections();

    drop(storage);
    let storage = open_storage(&engine);
    let after = storage.catalog().all_collections();
    assert_eq!(before, after);
}
