//! Explicit, versioned schema migrations (spec Design Notes: "Schema
//! migrations" — replaces the source's best-effort `ALTER TABLE`s at
//! startup). The Store refuses to start if the on-disk version is newer
//! than any version listed here.

pub struct Migration {
    pub version: i64,
    pub sql: &'static str,
}

pub static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: "
        CREATE TABLE tasks (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            name             TEXT NOT NULL,
            schedule_time    TEXT,
            cron_expression  TEXT,
            max_retries      INTEGER NOT NULL DEFAULT 0,
            send_email       INTEGER NOT NULL DEFAULT 0,
            email_recipients TEXT NOT NULL DEFAULT '[]',
            subtasks         TEXT NOT NULL,
            status           TEXT NOT NULL,
            created_at       TEXT NOT NULL,
            started_at       TEXT,
            completed_at     TEXT,
            result           TEXT,
            error            TEXT,
            cron_fired_at    TEXT
        );

        CREATE TABLE agents (
            name                TEXT PRIMARY KEY,
            address             TEXT NOT NULL,
            capabilities        TEXT NOT NULL DEFAULT '[]',
            last_heartbeat      TEXT NOT NULL,
            last_config_update  TEXT NOT NULL,
            fingerprint         TEXT NOT NULL DEFAULT '{}',
            current_task_id     INTEGER,
            current_subtask_id  INTEGER
        );

        -- At-most-one-assignment-per-agent: a partial unique index means an
        -- agent can only ever hold one non-null (task, subtask) pair at a
        -- time (spec Design Notes).
        CREATE UNIQUE INDEX idx_agents_single_assignment
            ON agents(current_task_id, current_subtask_id)
            WHERE current_task_id IS NOT NULL;

        CREATE TABLE subtask_executions (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id            INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            subtask_name       TEXT NOT NULL,
            \"order\"          INTEGER NOT NULL,
            agent_name         TEXT NOT NULL,
            status             TEXT NOT NULL,
            started_at         TEXT,
            completed_at       TEXT,
            result             TEXT,
            error              TEXT,
            execution_seconds  REAL,
            attempt_index      INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX idx_executions_task ON subtask_executions(task_id);

        -- At-most-one-non-terminal-execution-per-(task, subtask, agent).
        CREATE UNIQUE INDEX idx_executions_nonterminal
            ON subtask_executions(task_id, subtask_name, agent_name)
            WHERE status IN ('pending', 'running');

        CREATE TABLE comm_log (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp      TEXT NOT NULL,
            agent_name     TEXT NOT NULL,
            agent_address  TEXT NOT NULL,
            action         TEXT NOT NULL,
            message        TEXT NOT NULL,
            level          TEXT NOT NULL
        );

        CREATE INDEX idx_comm_log_address ON comm_log(agent_address);
    ",
}];
