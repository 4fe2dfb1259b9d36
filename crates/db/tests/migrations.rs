mod support;

use rusqlite::Connection;

#[test]
fn migrate_is_idempotent() {
    let mut test = support::setup_db();
    test.db.migrate().expect("migrate again");

    let conn = Connection::open(&test.path).expect("open conn");
    let applied: i64 = conn
        .query_row("SELECT COUNT(*) FROM schema_migration", [], |row| row.get(0))
        .expect("count migrations");
    assert_eq!(applied, 2);
    for table in ["ingest_source", "usage_session", "usage_event"] {
        let found: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .expect("lookup table");
        assert_eq!(found, 1, "{table}");
    }
}
