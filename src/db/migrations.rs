use anyhow::Context;
use rusqlite::Connection;

// Migrations ship compiled in; the ledger keeps re-runs cheap and ordered.
const MIGRATIONS: &[(&str, &str)] = &[(
    "001_core_schema",
    "CREATE TABLE IF NOT EXISTS businesses (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        phone_number TEXT NOT NULL UNIQUE,
        timezone TEXT NOT NULL,
        hours TEXT NOT NULL,
        services TEXT NOT NULL,
        slot_minutes INTEGER NOT NULL DEFAULT 60,
        notify_phone TEXT NOT NULL DEFAULT '',
        transfer_phone TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        updated_at TEXT NOT NULL DEFAULT (datetime('now'))
    );

    CREATE TABLE IF NOT EXISTS calendar_slots (
        id TEXT PRIMARY KEY,
        business_id TEXT NOT NULL,
        start_at TEXT NOT NULL,
        end_at TEXT NOT NULL,
        available INTEGER NOT NULL DEFAULT 1,
        blocked INTEGER NOT NULL DEFAULT 0,
        blocked_reason TEXT,
        created_at TEXT NOT NULL DEFAULT (datetime('now')),
        UNIQUE (business_id, start_at)
    );

    CREATE INDEX IF NOT EXISTS idx_slots_business_start
        ON calendar_slots (business_id, start_at);

    CREATE TABLE IF NOT EXISTS appointments (
        id TEXT PRIMARY KEY,
        business_id TEXT NOT NULL,
        customer_name TEXT,
        customer_phone TEXT NOT NULL,
        service_id TEXT NOT NULL,
        start_at TEXT NOT NULL,
        end_at TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'scheduled',
        source TEXT NOT NULL DEFAULT 'phone',
        call_id TEXT,
        idempotency_key TEXT UNIQUE,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_appointments_business_start
        ON appointments (business_id, start_at);

    CREATE TABLE IF NOT EXISTS call_sessions (
        call_id TEXT PRIMARY KEY,
        business_id TEXT NOT NULL,
        caller_phone TEXT NOT NULL,
        stage TEXT NOT NULL,
        data TEXT NOT NULL,
        retries INTEGER NOT NULL DEFAULT 0,
        silences INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        last_activity TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS slot_holds (
        slot_id TEXT PRIMARY KEY,
        call_id TEXT NOT NULL,
        expires_at TEXT NOT NULL
    );",
)];

pub fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .context("failed to create migrations table")?;

    for (name, sql) in MIGRATIONS {
        let already_applied: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM _migrations WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .context("failed to check migration status")?;

        if already_applied {
            continue;
        }

        conn.execute_batch(sql)
            .with_context(|| format!("failed to apply migration: {name}"))?;

        conn.execute("INSERT INTO _migrations (name) VALUES (?1)", [name])
            .with_context(|| format!("failed to record migration: {name}"))?;

        tracing::info!("applied migration: {name}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::db;

    #[test]
    fn test_migrations_are_rerunnable() {
        let conn = db::init_db(":memory:").unwrap();
        super::run_migrations(&conn).unwrap();

        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied as usize, super::MIGRATIONS.len());
    }
}
