use cetane::prelude::*;

pub fn migration() -> Migration {
    Migration::new("0002_jobs")
        .depends_on(&["0001_initial"])
        .operation(RunSql::portable().for_backend(
            "sqlite",
            r#"CREATE TABLE jobs (
    id TEXT PRIMARY KEY NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    max_tries INTEGER NOT NULL DEFAULT 3,
    backoff_secs INTEGER NOT NULL DEFAULT 60,
    timeout_secs INTEGER NOT NULL DEFAULT 300,
    available_at TEXT NOT NULL,
    reserved_at TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)"#,
        ))
        .operation(RunSql::portable().for_backend(
            "sqlite",
            "CREATE INDEX idx_jobs_claim ON jobs(status, available_at)",
        ))
}
