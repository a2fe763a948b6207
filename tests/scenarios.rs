//! End-to-end translation scenarios over the public engine surface.

use std::sync::Arc;

use pgqlite::config::Config;
use pgqlite::registry::Registry;
use pgqlite::rewrite::{rewrite_uncached, Rewriter, StatementKind};
use pgqlite::statement::test_support::{offline_record, inject_result};
use pgqlite::value::SqlValue;
use pgqlite::Engine;
use sqlite_interpose::abi;

fn cfg() -> Config {
    Config::from_env()
}

#[test]
fn simple_select_rewrites_binds_and_steps() {
    let engine = Engine::inert_for_tests();
    let record = offline_record("SELECT id, title FROM metadata_items WHERE id = ?");
    assert_eq!(
        record.rewritten.sql,
        "SELECT id, title FROM plex.metadata_items WHERE id = $1"
    );
    assert_eq!(
        engine.bind_value(&record, 1, SqlValue::Int(42)),
        abi::SQLITE_OK
    );

    inject_result(
        &record,
        &["id", "title"],
        vec![vec![SqlValue::Int(42), SqlValue::Text("Alien".into())]],
    );
    assert_eq!(engine.step(&record), abi::SQLITE_ROW);
    assert_eq!(engine.column_int64(&record, 0), 42);
    let title = unsafe {
        std::ffi::CStr::from_ptr(engine.column_text_ptr(&record, 1) as *const libc::c_char)
    };
    assert_eq!(title.to_str().unwrap(), "Alien");
    assert_eq!(engine.step(&record), abi::SQLITE_DONE);
}

#[test]
fn group_by_strict_completion_appends_in_select_order() {
    let rewritten = rewrite_uncached(
        &cfg(),
        "SELECT metadata_items.id, metadata_items.title, COUNT(*) FROM metadata_items GROUP BY metadata_items.id",
        false,
    );
    assert!(rewritten
        .sql
        .ends_with("GROUP BY metadata_items.id, metadata_items.title"));
}

#[test]
fn quoted_alias_is_visible_as_column_name() {
    let engine = Engine::inert_for_tests();
    let record = offline_record("select plugins.id as 'plugins_id' from plugins");
    assert!(record.rewritten.sql.contains("as \"plugins_id\""));

    // What the backend would report for that select list.
    inject_result(&record, &["plugins_id"], vec![vec![SqlValue::Int(7)]]);
    let name =
        unsafe { std::ffi::CStr::from_ptr(engine.column_name_ptr(&record, 0)) };
    assert_eq!(name.to_str().unwrap(), "plugins_id");
}

#[test]
fn metadata_before_step_keeps_first_row_for_the_real_step() {
    let engine = Engine::inert_for_tests();
    let record = offline_record("SELECT id FROM metadata_items");
    inject_result(
        &record,
        &["id"],
        vec![vec![SqlValue::Int(1)], vec![SqlValue::Int(2)]],
    );
    assert_eq!(engine.column_count(&record), 1);
    let name = unsafe { std::ffi::CStr::from_ptr(engine.column_name_ptr(&record, 0)) };
    assert_eq!(name.to_str().unwrap(), "id");
    assert_eq!(engine.step(&record), abi::SQLITE_ROW);
    assert_eq!(engine.column_int64(&record, 0), 1);
}

#[test]
fn refcount_lifecycle_across_two_caches() {
    let registry = Arc::new(Registry::new());
    let record = offline_record("SELECT 1");
    registry.register(0x9000, &record);
    registry.cache(0x9000, &record);
    assert_eq!(record.refcount(), 2);

    let reg2 = Arc::clone(&registry);
    let rec2 = Arc::clone(&record);
    let handle = std::thread::spawn(move || {
        reg2.cache(0x9000, &rec2);
        assert_eq!(rec2.refcount(), 3);
        reg2.uncache(0x9000);
    });
    handle.join().unwrap();
    assert_eq!(record.refcount(), 2);

    assert!(registry.finalize(0x9000));
    assert_eq!(record.refcount(), 0);
    assert!(record.is_destroyed());
    assert!(!registry.finalize(0x9000));
}

#[cfg(target_os = "linux")]
#[test]
fn stack_critical_refuses_ordinary_prepares_but_empties_on_deck() {
    use pgqlite::db::DbRecord;

    let mut engine = Engine::inert_for_tests();
    // A hard threshold no real thread satisfies: every prepare is critical.
    engine.config.stack_hard_kb = usize::MAX / 4096;

    let db = DbRecord::new("/data/library.db");
    let err = engine
        .prepare_redirected(std::ptr::null_mut(), &db, "SELECT 1")
        .unwrap_err();
    assert_eq!(err.code(), abi::SQLITE_NOMEM);

    // On-deck-class carousels degrade to an empty result instead of an
    // error, without touching the backend.
    let record = engine
        .prepare_redirected(
            std::ptr::null_mut(),
            &db,
            "SELECT * FROM metadata_items -- on_deck hub",
        )
        .unwrap();
    assert_eq!(engine.step(&record), abi::SQLITE_DONE);
    assert!(record.rewritten.flags.contains_on_deck_query);
}

#[test]
fn transaction_statements_classify_for_pinning() {
    let rewritten = rewrite_uncached(&cfg(), "BEGIN IMMEDIATE", false);
    assert_eq!(rewritten.sql, "BEGIN");
    assert_eq!(rewritten.kind, StatementKind::Begin);
    assert_eq!(
        rewrite_uncached(&cfg(), "COMMIT", false).kind,
        StatementKind::TxnEnd
    );
    // A bare savepoint opens the pin; releasing or rewinding one does not
    // touch it.
    assert_eq!(
        rewrite_uncached(&cfg(), "SAVEPOINT queue_write", false).kind,
        StatementKind::Savepoint
    );
    assert_eq!(
        rewrite_uncached(&cfg(), "RELEASE SAVEPOINT queue_write", false).kind,
        StatementKind::Release
    );
    assert_eq!(
        rewrite_uncached(&cfg(), "ROLLBACK TO queue_write", false).kind,
        StatementKind::Release
    );
}

#[test]
fn rewriter_cache_shares_across_statements() {
    let rewriter = Rewriter::new(64, 4096);
    let config = cfg();
    let a = rewriter.rewrite(&config, "SELECT * FROM plugins WHERE id = ?", false);
    let b = rewriter.rewrite(&config, "SELECT * FROM plugins WHERE id = ?", false);
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.sql, "SELECT * FROM plex.plugins WHERE id = $1");
}
