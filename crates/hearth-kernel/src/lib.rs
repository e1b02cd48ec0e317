//! Durable store for the appliance: the work queue, recurring schedules,
//! the service registry, installed resources, key/value settings, and an
//! append-only event journal, all in one SQLite database.
//!
//! Methods come in sync form plus `_async` wrappers that move the call onto
//! the blocking pool; the server only ever uses the async form. The kernel
//! is cheap to clone — each call opens its own connection against the WAL
//! database, so concurrent workers serialize through SQLite itself rather
//! than an in-process lock.

use anyhow::{anyhow, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Job lifecycle states. Waiting and delayed rows are claimable; completed
/// and failed rows are terminal and subject to retention pruning.
pub const JOB_WAITING: &str = "waiting";
pub const JOB_ACTIVE: &str = "active";
pub const JOB_DELAYED: &str = "delayed";
pub const JOB_COMPLETED: &str = "completed";
pub const JOB_FAILED: &str = "failed";

/// States that make a job "live" for dedup purposes: a second enqueue with
/// the same dedup key collapses onto a row in one of these states.
pub const LIVE_JOB_STATES: [&str; 3] = [JOB_WAITING, JOB_ACTIVE, JOB_DELAYED];

#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JobRow {
    pub id: String,
    pub queue: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub progress: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    pub backoff_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<String>,
    pub created: String,
    pub updated: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServiceRow {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub config: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<String>,
    pub hidden: bool,
    pub status: String,
    pub installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ui_location: Option<String>,
    pub metadata: serde_json::Value,
    pub created: String,
    pub updated: String,
}

/// Mutable catalog fields of a service; installation status is owned by the
/// orchestrator and deliberately not part of this struct.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub config: serde_json::Value,
    pub depends_on: Option<String>,
    pub hidden: bool,
    pub ui_location: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ResourceRow {
    pub id: String,
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub source_url: String,
    pub file_path: String,
    pub size_bytes: i64,
    pub installed_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ScheduleRow {
    pub key: String,
    pub queue: String,
    pub kind: String,
    pub cron: String,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fired: Option<String>,
    pub created: String,
    pub updated: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EventRow {
    pub id: i64,
    pub time: String,
    pub kind: String,
    pub payload: serde_json::Value,
}

fn now_str() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("hearth.sqlite");
        let need_init = !db_path.exists();
        let conn = Connection::open(&db_path)?;
        // Pragmas tuned for async server usage
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        // Busy timeout (default 5000ms; override with HEARTH_SQLITE_BUSY_MS)
        let busy_ms: u64 = std::env::var("HEARTH_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        conn.busy_timeout(std::time::Duration::from_millis(busy_ms))?;
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        if need_init {
            Self::init_schema(&conn)?;
        }
        Ok(Self { db_path })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Work queue: one row per background job; rowid is insertion order
            CREATE TABLE IF NOT EXISTS jobs (
              id TEXT PRIMARY KEY,
              queue TEXT NOT NULL,
              kind TEXT NOT NULL,
              payload TEXT NOT NULL,
              progress INTEGER NOT NULL DEFAULT 0,
              attempts INTEGER NOT NULL DEFAULT 0,
              max_attempts INTEGER NOT NULL DEFAULT 1,
              backoff_ms INTEGER NOT NULL DEFAULT 0,
              dedup_key TEXT,
              state TEXT NOT NULL,
              output TEXT,
              error TEXT,
              next_run_at TEXT,
              created TEXT NOT NULL,
              updated TEXT NOT NULL,
              completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_queue_state ON jobs(queue,state);
            CREATE INDEX IF NOT EXISTS idx_jobs_dedup ON jobs(queue,dedup_key);

            -- Recurring schedules: single active entry per key
            CREATE TABLE IF NOT EXISTS schedules (
              key TEXT PRIMARY KEY,
              queue TEXT NOT NULL,
              kind TEXT NOT NULL,
              cron TEXT NOT NULL,
              payload TEXT NOT NULL,
              last_fired TEXT,
              created TEXT NOT NULL,
              updated TEXT NOT NULL
            );

            -- Service registry: catalog of installable containerized services
            CREATE TABLE IF NOT EXISTS services (
              name TEXT PRIMARY KEY,
              image TEXT NOT NULL,
              command TEXT NOT NULL,
              config TEXT NOT NULL,
              depends_on TEXT,
              hidden INTEGER NOT NULL DEFAULT 0,
              status TEXT NOT NULL DEFAULT 'idle',
              installed INTEGER NOT NULL DEFAULT 0,
              ui_location TEXT,
              metadata TEXT NOT NULL,
              created TEXT NOT NULL,
              updated TEXT NOT NULL
            );

            -- Installed downloadable artifacts (zim | map | model)
            CREATE TABLE IF NOT EXISTS resources (
              id TEXT PRIMARY KEY,
              resource_type TEXT NOT NULL,
              collection TEXT,
              version TEXT,
              source_url TEXT NOT NULL,
              file_path TEXT NOT NULL,
              size_bytes INTEGER NOT NULL,
              installed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_resources_type ON resources(resource_type);

            -- Generic key/value settings
            CREATE TABLE IF NOT EXISTS settings (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL,
              updated TEXT NOT NULL
            );

            -- Append-only journal of published envelopes (audit only)
            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              time TEXT NOT NULL,
              kind TEXT NOT NULL,
              payload TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    // ---------------------------------------------------------------- jobs

    pub fn insert_job(
        &self,
        queue: &str,
        kind: &str,
        payload: &serde_json::Value,
        max_attempts: i64,
        backoff_ms: i64,
        dedup_key: Option<&str>,
    ) -> Result<JobRow> {
        let conn = self.conn()?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_str();
        let payload_s = serde_json::to_string(payload)?;
        conn.execute(
            "INSERT INTO jobs(id,queue,kind,payload,progress,attempts,max_attempts,backoff_ms,dedup_key,state,created,updated)
             VALUES(?,?,?,?,0,0,?,?,?,?,?,?)",
            params![
                id,
                queue,
                kind,
                payload_s,
                max_attempts.max(1),
                backoff_ms.max(0),
                dedup_key,
                JOB_WAITING,
                now,
                now
            ],
        )?;
        self.get_job(&id)?
            .ok_or_else(|| anyhow!("job {id} vanished after insert"))
    }

    /// Find a live (waiting/active/delayed) job carrying this dedup key.
    pub fn find_job_by_dedup(&self, queue: &str, dedup_key: &str) -> Result<Option<JobRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,queue,kind,payload,progress,attempts,max_attempts,backoff_ms,dedup_key,state,output,error,next_run_at,created,updated,completed_at
             FROM jobs WHERE queue=? AND dedup_key=? AND state IN ('waiting','active','delayed')
             ORDER BY rowid LIMIT 1",
        )?;
        let row = stmt
            .query_row(params![queue, dedup_key], job_from_row)
            .optional()?;
        Ok(row)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<JobRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,queue,kind,payload,progress,attempts,max_attempts,backoff_ms,dedup_key,state,output,error,next_run_at,created,updated,completed_at
             FROM jobs WHERE id=? LIMIT 1",
        )?;
        let row = stmt.query_row([id], job_from_row).optional()?;
        Ok(row)
    }

    /// List a queue's jobs in the given states, insertion order.
    pub fn list_jobs(&self, queue: &str, states: &[&str]) -> Result<Vec<JobRow>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let marks = vec!["?"; states.len()].join(",");
        let sql = format!(
            "SELECT id,queue,kind,payload,progress,attempts,max_attempts,backoff_ms,dedup_key,state,output,error,next_run_at,created,updated,completed_at
             FROM jobs WHERE queue=? AND state IN ({marks}) ORDER BY rowid"
        );
        let mut stmt = conn.prepare(&sql)?;
        let args: Vec<String> = std::iter::once(queue.to_string())
            .chain(states.iter().map(|s| s.to_string()))
            .collect();
        let mut rows = stmt.query(params_from_iter(args.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(job_from_row(row)?);
        }
        Ok(out)
    }

    /// Atomically claim the oldest eligible job on a queue: a waiting row,
    /// or a delayed row whose retry time has passed. Claiming moves the row
    /// to `active` and bumps the attempt counter in the same statement, so
    /// concurrent workers never double-claim.
    pub fn dequeue_one(&self, queue: &str) -> Result<Option<JobRow>> {
        let conn = self.conn()?;
        let now = now_str();
        let mut stmt = conn.prepare(
            "UPDATE jobs SET state='active', attempts=attempts+1, updated=?1 WHERE id = (
                 SELECT id FROM jobs
                 WHERE queue=?2 AND (state='waiting' OR (state='delayed' AND next_run_at<=?1))
                 ORDER BY rowid LIMIT 1
             )
             RETURNING id,queue,kind,payload,progress,attempts,max_attempts,backoff_ms,dedup_key,state,output,error,next_run_at,created,updated,completed_at",
        )?;
        let row = stmt
            .query_row(params![now, queue], job_from_row)
            .optional()?;
        Ok(row)
    }

    pub fn set_job_progress(&self, id: &str, progress: i64) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE jobs SET progress=?, updated=? WHERE id=?",
            params![progress.clamp(0, 100), now_str(), id],
        )?;
        Ok(n > 0)
    }

    pub fn complete_job(&self, id: &str, output: &serde_json::Value) -> Result<bool> {
        let conn = self.conn()?;
        let now = now_str();
        let out_s = serde_json::to_string(output)?;
        let n = conn.execute(
            "UPDATE jobs SET state='completed', progress=100, output=?, error=NULL, updated=?, completed_at=? WHERE id=?",
            params![out_s, now, now, id],
        )?;
        Ok(n > 0)
    }

    /// Terminal failure: no further attempts.
    pub fn fail_job(&self, id: &str, error: &str) -> Result<bool> {
        let conn = self.conn()?;
        let now = now_str();
        let n = conn.execute(
            "UPDATE jobs SET state='failed', error=?, updated=?, completed_at=? WHERE id=?",
            params![error, now, now, id],
        )?;
        Ok(n > 0)
    }

    /// Park a job for a delayed retry at `next_run_at`.
    pub fn retry_job(&self, id: &str, error: &str, next_run_at: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE jobs SET state='delayed', error=?, next_run_at=?, updated=? WHERE id=?",
            params![error, next_run_at, now_str(), id],
        )?;
        Ok(n > 0)
    }

    pub fn count_jobs_by_state(&self, queue: &str, state: &str) -> Result<i64> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT COUNT(1) FROM jobs WHERE queue=? AND state=?")?;
        let n: i64 = stmt.query_row(params![queue, state], |row| row.get(0))?;
        Ok(n)
    }

    /// Evict terminal jobs beyond the retention bounds, oldest first.
    pub fn prune_jobs(&self, queue: &str, keep_completed: i64, keep_failed: i64) -> Result<usize> {
        let conn = self.conn()?;
        let mut pruned = 0usize;
        for (state, keep) in [(JOB_COMPLETED, keep_completed), (JOB_FAILED, keep_failed)] {
            pruned += conn.execute(
                "DELETE FROM jobs WHERE queue=?1 AND state=?2 AND id NOT IN (
                     SELECT id FROM jobs WHERE queue=?1 AND state=?2 ORDER BY rowid DESC LIMIT ?3
                 )",
                params![queue, state, keep.max(0)],
            )?;
        }
        Ok(pruned)
    }

    // ----------------------------------------------------------- schedules

    pub fn upsert_schedule(
        &self,
        key: &str,
        queue: &str,
        kind: &str,
        cron: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn()?;
        let now = now_str();
        let payload_s = serde_json::to_string(payload)?;
        conn.execute(
            "INSERT INTO schedules(key,queue,kind,cron,payload,created,updated) VALUES(?,?,?,?,?,?,?)
             ON CONFLICT(key) DO UPDATE SET queue=excluded.queue, kind=excluded.kind,
               cron=excluded.cron, payload=excluded.payload, updated=excluded.updated",
            params![key, queue, kind, cron, payload_s, now, now],
        )?;
        Ok(())
    }

    pub fn list_schedules(&self) -> Result<Vec<ScheduleRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT key,queue,kind,cron,payload,last_fired,created,updated FROM schedules ORDER BY key",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            let payload_s: String = r.get(4)?;
            out.push(ScheduleRow {
                key: r.get(0)?,
                queue: r.get(1)?,
                kind: r.get(2)?,
                cron: r.get(3)?,
                payload: serde_json::from_str(&payload_s).unwrap_or(serde_json::json!({})),
                last_fired: r.get(5)?,
                created: r.get(6)?,
                updated: r.get(7)?,
            });
        }
        Ok(out)
    }

    /// Record the minute a schedule fired; returns false if another worker
    /// already claimed the same minute.
    pub fn mark_schedule_fired(&self, key: &str, minute: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE schedules SET last_fired=?1, updated=?2 WHERE key=?3
               AND (last_fired IS NULL OR last_fired<>?1)",
            params![minute, now_str(), key],
        )?;
        Ok(n > 0)
    }

    // ------------------------------------------------------------ services

    /// Insert or refresh a catalog entry. Installation status and the
    /// installed flag belong to the orchestrator and are preserved on
    /// conflict.
    pub fn upsert_service(&self, spec: &ServiceSpec) -> Result<()> {
        let conn = self.conn()?;
        let now = now_str();
        let command_s = serde_json::to_string(&spec.command)?;
        let config_s = serde_json::to_string(&spec.config)?;
        let metadata_s = serde_json::to_string(&spec.metadata)?;
        conn.execute(
            "INSERT INTO services(name,image,command,config,depends_on,hidden,status,installed,ui_location,metadata,created,updated)
             VALUES(?,?,?,?,?,?,'idle',0,?,?,?,?)
             ON CONFLICT(name) DO UPDATE SET image=excluded.image, command=excluded.command,
               config=excluded.config, depends_on=excluded.depends_on, hidden=excluded.hidden,
               ui_location=excluded.ui_location, metadata=excluded.metadata, updated=excluded.updated",
            params![
                spec.name,
                spec.image,
                command_s,
                config_s,
                spec.depends_on,
                spec.hidden as i64,
                spec.ui_location,
                metadata_s,
                now,
                now
            ],
        )?;
        Ok(())
    }

    pub fn get_service(&self, name: &str) -> Result<Option<ServiceRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name,image,command,config,depends_on,hidden,status,installed,ui_location,metadata,created,updated
             FROM services WHERE name=? LIMIT 1",
        )?;
        let row = stmt.query_row([name], service_from_row).optional()?;
        Ok(row)
    }

    pub fn list_services(&self, include_hidden: bool) -> Result<Vec<ServiceRow>> {
        let conn = self.conn()?;
        let sql = if include_hidden {
            "SELECT name,image,command,config,depends_on,hidden,status,installed,ui_location,metadata,created,updated
             FROM services ORDER BY name"
        } else {
            "SELECT name,image,command,config,depends_on,hidden,status,installed,ui_location,metadata,created,updated
             FROM services WHERE hidden=0 ORDER BY name"
        };
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            out.push(service_from_row(r)?);
        }
        Ok(out)
    }

    /// The cross-process install guard: move a service into `preflight`
    /// only if no run is currently in flight. Returns false when another
    /// request already holds the service.
    pub fn begin_install(&self, name: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE services SET status='preflight', updated=? WHERE name=?
               AND status IN ('idle','error','completed')",
            params![now_str(), name],
        )?;
        Ok(n > 0)
    }

    pub fn set_service_status(&self, name: &str, status: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE services SET status=?, updated=? WHERE name=?",
            params![status, now_str(), name],
        )?;
        Ok(n > 0)
    }

    pub fn set_service_installed(&self, name: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE services SET status='completed', installed=1, updated=? WHERE name=?",
            params![now_str(), name],
        )?;
        Ok(n > 0)
    }

    // ----------------------------------------------------------- resources

    #[allow(clippy::too_many_arguments)]
    pub fn insert_resource(
        &self,
        resource_type: &str,
        collection: Option<&str>,
        version: Option<&str>,
        source_url: &str,
        file_path: &str,
        size_bytes: i64,
    ) -> Result<ResourceRow> {
        let conn = self.conn()?;
        let id = uuid::Uuid::new_v4().to_string();
        let now = now_str();
        conn.execute(
            "INSERT INTO resources(id,resource_type,collection,version,source_url,file_path,size_bytes,installed_at)
             VALUES(?,?,?,?,?,?,?,?)",
            params![id, resource_type, collection, version, source_url, file_path, size_bytes, now],
        )?;
        Ok(ResourceRow {
            id,
            resource_type: resource_type.to_string(),
            collection: collection.map(|s| s.to_string()),
            version: version.map(|s| s.to_string()),
            source_url: source_url.to_string(),
            file_path: file_path.to_string(),
            size_bytes,
            installed_at: now,
        })
    }

    pub fn get_resource(&self, id: &str) -> Result<Option<ResourceRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id,resource_type,collection,version,source_url,file_path,size_bytes,installed_at
             FROM resources WHERE id=? LIMIT 1",
        )?;
        let row = stmt.query_row([id], resource_from_row).optional()?;
        Ok(row)
    }

    pub fn list_resources(&self, resource_type: Option<&str>) -> Result<Vec<ResourceRow>> {
        let conn = self.conn()?;
        let mut out = Vec::new();
        match resource_type {
            Some(rt) => {
                let mut stmt = conn.prepare(
                    "SELECT id,resource_type,collection,version,source_url,file_path,size_bytes,installed_at
                     FROM resources WHERE resource_type=? ORDER BY installed_at DESC",
                )?;
                let mut rows = stmt.query([rt])?;
                while let Some(r) = rows.next()? {
                    out.push(resource_from_row(r)?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id,resource_type,collection,version,source_url,file_path,size_bytes,installed_at
                     FROM resources ORDER BY installed_at DESC",
                )?;
                let mut rows = stmt.query([])?;
                while let Some(r) = rows.next()? {
                    out.push(resource_from_row(r)?);
                }
            }
        }
        Ok(out)
    }

    /// Returns false when no such resource exists; callers surface that as
    /// a not-found outcome rather than a generic error.
    pub fn delete_resource(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM resources WHERE id=?", [id])?;
        Ok(n > 0)
    }

    // ------------------------------------------------------------ settings

    pub fn get_value(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT value FROM settings WHERE key=? LIMIT 1")?;
        let value_s: Option<String> = stmt.query_row([key], |row| row.get(0)).optional()?;
        Ok(value_s.and_then(|s| serde_json::from_str(&s).ok()))
    }

    pub fn set_value(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.conn()?;
        let value_s = serde_json::to_string(value)?;
        conn.execute(
            "INSERT INTO settings(key,value,updated) VALUES(?,?,?)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated=excluded.updated",
            params![key, value_s, now_str()],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------- events

    pub fn append_event(&self, env: &hearth_events::Envelope) -> Result<i64> {
        let conn = self.conn()?;
        let payload_s = serde_json::to_string(&env.payload).unwrap_or_else(|_| "{}".to_string());
        conn.execute(
            "INSERT INTO events(time,kind,payload) VALUES(?,?,?)",
            params![env.time, env.kind, payload_s],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn recent_events(&self, limit: i64) -> Result<Vec<EventRow>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id,time,kind,payload FROM events ORDER BY id DESC LIMIT ?")?;
        let mut rows = stmt.query([limit])?;
        let mut out = Vec::new();
        while let Some(r) = rows.next()? {
            let payload_s: String = r.get(3)?;
            out.push(EventRow {
                id: r.get(0)?,
                time: r.get(1)?,
                kind: r.get(2)?,
                payload: serde_json::from_str(&payload_s).unwrap_or(serde_json::json!({})),
            });
        }
        out.reverse();
        Ok(out)
    }
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    let payload_s: String = row.get(3)?;
    let output_s: Option<String> = row.get(10)?;
    Ok(JobRow {
        id: row.get(0)?,
        queue: row.get(1)?,
        kind: row.get(2)?,
        payload: serde_json::from_str(&payload_s).unwrap_or(serde_json::json!({})),
        progress: row.get(4)?,
        attempts: row.get(5)?,
        max_attempts: row.get(6)?,
        backoff_ms: row.get(7)?,
        dedup_key: row.get(8)?,
        state: row.get(9)?,
        output: output_s.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get(11)?,
        next_run_at: row.get(12)?,
        created: row.get(13)?,
        updated: row.get(14)?,
        completed_at: row.get(15)?,
    })
}

fn service_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ServiceRow> {
    let command_s: String = row.get(2)?;
    let config_s: String = row.get(3)?;
    let metadata_s: String = row.get(9)?;
    Ok(ServiceRow {
        name: row.get(0)?,
        image: row.get(1)?,
        command: serde_json::from_str(&command_s).unwrap_or_default(),
        config: serde_json::from_str(&config_s).unwrap_or(serde_json::json!({})),
        depends_on: row.get(4)?,
        hidden: row.get::<_, i64>(5)? != 0,
        status: row.get(6)?,
        installed: row.get::<_, i64>(7)? != 0,
        ui_location: row.get(8)?,
        metadata: serde_json::from_str(&metadata_s).unwrap_or(serde_json::json!({})),
        created: row.get(10)?,
        updated: row.get(11)?,
    })
}

fn resource_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResourceRow> {
    Ok(ResourceRow {
        id: row.get(0)?,
        resource_type: row.get(1)?,
        collection: row.get(2)?,
        version: row.get(3)?,
        source_url: row.get(4)?,
        file_path: row.get(5)?,
        size_bytes: row.get(6)?,
        installed_at: row.get(7)?,
    })
}

// Async wrappers: same contract, executed on the blocking pool.
impl Kernel {
    pub async fn insert_job_async(
        &self,
        queue: &str,
        kind: &str,
        payload: &serde_json::Value,
        max_attempts: i64,
        backoff_ms: i64,
        dedup_key: Option<&str>,
    ) -> Result<JobRow> {
        let k = self.clone();
        let queue = queue.to_string();
        let kind = kind.to_string();
        let payload = payload.clone();
        let dedup = dedup_key.map(|s| s.to_string());
        tokio::task::spawn_blocking(move || {
            k.insert_job(&queue, &kind, &payload, max_attempts, backoff_ms, dedup.as_deref())
        })
        .await
        .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn find_job_by_dedup_async(
        &self,
        queue: &str,
        dedup_key: &str,
    ) -> Result<Option<JobRow>> {
        let k = self.clone();
        let queue = queue.to_string();
        let dedup = dedup_key.to_string();
        tokio::task::spawn_blocking(move || k.find_job_by_dedup(&queue, &dedup))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn get_job_async(&self, id: &str) -> Result<Option<JobRow>> {
        let k = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || k.get_job(&id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn list_jobs_async(&self, queue: &str, states: &[&str]) -> Result<Vec<JobRow>> {
        let k = self.clone();
        let queue = queue.to_string();
        let states: Vec<String> = states.iter().map(|s| s.to_string()).collect();
        tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = states.iter().map(|s| s.as_str()).collect();
            k.list_jobs(&queue, &refs)
        })
        .await
        .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn dequeue_one_async(&self, queue: &str) -> Result<Option<JobRow>> {
        let k = self.clone();
        let queue = queue.to_string();
        tokio::task::spawn_blocking(move || k.dequeue_one(&queue))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn set_job_progress_async(&self, id: &str, progress: i64) -> Result<bool> {
        let k = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || k.set_job_progress(&id, progress))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn complete_job_async(&self, id: &str, output: &serde_json::Value) -> Result<bool> {
        let k = self.clone();
        let id = id.to_string();
        let output = output.clone();
        tokio::task::spawn_blocking(move || k.complete_job(&id, &output))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn fail_job_async(&self, id: &str, error: &str) -> Result<bool> {
        let k = self.clone();
        let id = id.to_string();
        let error = error.to_string();
        tokio::task::spawn_blocking(move || k.fail_job(&id, &error))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn retry_job_async(&self, id: &str, error: &str, next_run_at: &str) -> Result<bool> {
        let k = self.clone();
        let id = id.to_string();
        let error = error.to_string();
        let next = next_run_at.to_string();
        tokio::task::spawn_blocking(move || k.retry_job(&id, &error, &next))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn prune_jobs_async(
        &self,
        queue: &str,
        keep_completed: i64,
        keep_failed: i64,
    ) -> Result<usize> {
        let k = self.clone();
        let queue = queue.to_string();
        tokio::task::spawn_blocking(move || k.prune_jobs(&queue, keep_completed, keep_failed))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn upsert_schedule_async(
        &self,
        key: &str,
        queue: &str,
        kind: &str,
        cron: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let k = self.clone();
        let key = key.to_string();
        let queue = queue.to_string();
        let kind = kind.to_string();
        let cron = cron.to_string();
        let payload = payload.clone();
        tokio::task::spawn_blocking(move || k.upsert_schedule(&key, &queue, &kind, &cron, &payload))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn list_schedules_async(&self) -> Result<Vec<ScheduleRow>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.list_schedules())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn mark_schedule_fired_async(&self, key: &str, minute: &str) -> Result<bool> {
        let k = self.clone();
        let key = key.to_string();
        let minute = minute.to_string();
        tokio::task::spawn_blocking(move || k.mark_schedule_fired(&key, &minute))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn upsert_service_async(&self, spec: &ServiceSpec) -> Result<()> {
        let k = self.clone();
        let spec = spec.clone();
        tokio::task::spawn_blocking(move || k.upsert_service(&spec))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn get_service_async(&self, name: &str) -> Result<Option<ServiceRow>> {
        let k = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || k.get_service(&name))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn list_services_async(&self, include_hidden: bool) -> Result<Vec<ServiceRow>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.list_services(include_hidden))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn begin_install_async(&self, name: &str) -> Result<bool> {
        let k = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || k.begin_install(&name))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn set_service_status_async(&self, name: &str, status: &str) -> Result<bool> {
        let k = self.clone();
        let name = name.to_string();
        let status = status.to_string();
        tokio::task::spawn_blocking(move || k.set_service_status(&name, &status))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn set_service_installed_async(&self, name: &str) -> Result<bool> {
        let k = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || k.set_service_installed(&name))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_resource_async(
        &self,
        resource_type: &str,
        collection: Option<&str>,
        version: Option<&str>,
        source_url: &str,
        file_path: &str,
        size_bytes: i64,
    ) -> Result<ResourceRow> {
        let k = self.clone();
        let rt = resource_type.to_string();
        let collection = collection.map(|s| s.to_string());
        let version = version.map(|s| s.to_string());
        let url = source_url.to_string();
        let path = file_path.to_string();
        tokio::task::spawn_blocking(move || {
            k.insert_resource(
                &rt,
                collection.as_deref(),
                version.as_deref(),
                &url,
                &path,
                size_bytes,
            )
        })
        .await
        .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn get_resource_async(&self, id: &str) -> Result<Option<ResourceRow>> {
        let k = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || k.get_resource(&id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn list_resources_async(
        &self,
        resource_type: Option<&str>,
    ) -> Result<Vec<ResourceRow>> {
        let k = self.clone();
        let rt = resource_type.map(|s| s.to_string());
        tokio::task::spawn_blocking(move || k.list_resources(rt.as_deref()))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn delete_resource_async(&self, id: &str) -> Result<bool> {
        let k = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || k.delete_resource(&id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn get_value_async(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let k = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || k.get_value(&key))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn set_value_async(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let k = self.clone();
        let key = key.to_string();
        let value = value.clone();
        tokio::task::spawn_blocking(move || k.set_value(&key, &value))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn append_event_async(&self, env: &hearth_events::Envelope) -> Result<i64> {
        let k = self.clone();
        let env = env.clone();
        tokio::task::spawn_blocking(move || k.append_event(&env))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn recent_events_async(&self, limit: i64) -> Result<Vec<EventRow>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.recent_events(limit))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kernel() -> (tempfile::TempDir, Kernel) {
        let dir = tempfile::tempdir().expect("tempdir");
        let k = Kernel::open(dir.path()).expect("open kernel");
        (dir, k)
    }

    fn spec(name: &str, depends_on: Option<&str>) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            image: format!("registry.local/{name}:latest"),
            command: vec!["serve".to_string()],
            config: json!({}),
            depends_on: depends_on.map(|s| s.to_string()),
            hidden: false,
            ui_location: None,
            metadata: json!({}),
        }
    }

    #[test]
    fn insert_and_get_job_roundtrip() {
        let (_dir, k) = kernel();
        let job = k
            .insert_job("downloads.file", "file_download", &json!({"url":"u"}), 3, 500, None)
            .unwrap();
        assert_eq!(job.state, JOB_WAITING);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        let got = k.get_job(&job.id).unwrap().expect("job present");
        assert_eq!(got.payload["url"], "u");
    }

    #[test]
    fn dedup_lookup_only_matches_live_states() {
        let (_dir, k) = kernel();
        let job = k
            .insert_job("bench", "benchmark", &json!({}), 1, 0, Some("bench-42"))
            .unwrap();
        let found = k.find_job_by_dedup("bench", "bench-42").unwrap();
        assert_eq!(found.map(|j| j.id), Some(job.id.clone()));

        k.complete_job(&job.id, &json!({})).unwrap();
        assert!(k.find_job_by_dedup("bench", "bench-42").unwrap().is_none());
    }

    #[test]
    fn dequeue_claims_oldest_and_bumps_attempts() {
        let (_dir, k) = kernel();
        let first = k
            .insert_job("downloads.file", "file_download", &json!({"n":1}), 3, 0, None)
            .unwrap();
        k.insert_job("downloads.file", "file_download", &json!({"n":2}), 3, 0, None)
            .unwrap();

        let claimed = k.dequeue_one("downloads.file").unwrap().expect("claim");
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.state, JOB_ACTIVE);
        assert_eq!(claimed.attempts, 1);

        k.dequeue_one("downloads.file").unwrap().expect("second claim");
        assert!(k.dequeue_one("downloads.file").unwrap().is_none());
    }

    #[test]
    fn delayed_job_not_claimable_until_due() {
        let (_dir, k) = kernel();
        let job = k
            .insert_job("downloads.file", "file_download", &json!({}), 3, 100, None)
            .unwrap();
        k.dequeue_one("downloads.file").unwrap().expect("claim");

        let future = (chrono::Utc::now() + chrono::Duration::hours(1))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        k.retry_job(&job.id, "transient", &future).unwrap();
        assert!(k.dequeue_one("downloads.file").unwrap().is_none());

        let past = (chrono::Utc::now() - chrono::Duration::seconds(1))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        k.retry_job(&job.id, "transient", &past).unwrap();
        let reclaimed = k.dequeue_one("downloads.file").unwrap().expect("reclaim");
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.attempts, 2);
    }

    #[test]
    fn prune_keeps_newest_terminal_jobs() {
        let (_dir, k) = kernel();
        let mut ids = Vec::new();
        for n in 0..5 {
            let job = k
                .insert_job("downloads.file", "file_download", &json!({"n":n}), 1, 0, None)
                .unwrap();
            k.complete_job(&job.id, &json!({})).unwrap();
            ids.push(job.id);
        }
        let pruned = k.prune_jobs("downloads.file", 2, 2).unwrap();
        assert_eq!(pruned, 3);
        // Oldest evicted first: only the two newest remain.
        assert!(k.get_job(&ids[0]).unwrap().is_none());
        assert!(k.get_job(&ids[3]).unwrap().is_some());
        assert!(k.get_job(&ids[4]).unwrap().is_some());
    }

    #[test]
    fn begin_install_guard_is_exclusive() {
        let (_dir, k) = kernel();
        k.upsert_service(&spec("kiwix", None)).unwrap();
        assert!(k.begin_install("kiwix").unwrap());
        // Second request while the first run is in flight loses the race.
        assert!(!k.begin_install("kiwix").unwrap());

        k.set_service_status("kiwix", "error").unwrap();
        assert!(k.begin_install("kiwix").unwrap());
    }

    #[test]
    fn upsert_service_preserves_install_state() {
        let (_dir, k) = kernel();
        k.upsert_service(&spec("kiwix", None)).unwrap();
        k.set_service_installed("kiwix").unwrap();

        let mut refreshed = spec("kiwix", None);
        refreshed.image = "registry.local/kiwix:2".to_string();
        k.upsert_service(&refreshed).unwrap();

        let row = k.get_service("kiwix").unwrap().expect("service");
        assert_eq!(row.image, "registry.local/kiwix:2");
        assert_eq!(row.status, "completed");
        assert!(row.installed);
    }

    #[test]
    fn delete_missing_resource_reports_absent() {
        let (_dir, k) = kernel();
        assert!(!k.delete_resource("no-such-id").unwrap());
        let r = k
            .insert_resource("zim", Some("wiki"), Some("2026-01"), "http://x/a.zim", "zim/a.zim", 42)
            .unwrap();
        assert!(k.delete_resource(&r.id).unwrap());
        assert!(k.get_resource(&r.id).unwrap().is_none());
    }

    #[test]
    fn settings_roundtrip() {
        let (_dir, k) = kernel();
        assert!(k.get_value("updates.available").unwrap().is_none());
        k.set_value("updates.available", &json!({"version":"1.2.3"}))
            .unwrap();
        let v = k.get_value("updates.available").unwrap().expect("value");
        assert_eq!(v["version"], "1.2.3");
    }

    #[test]
    fn schedule_fired_guard_blocks_same_minute() {
        let (_dir, k) = kernel();
        k.upsert_schedule("update-check", "maintenance", "update_check", "0 3 * * *", &json!({}))
            .unwrap();
        assert!(k.mark_schedule_fired("update-check", "2026-08-07T03:00").unwrap());
        assert!(!k.mark_schedule_fired("update-check", "2026-08-07T03:00").unwrap());
        assert!(k.mark_schedule_fired("update-check", "2026-08-08T03:00").unwrap());
    }
}
