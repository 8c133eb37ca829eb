// Copyright 2024-2025 The Tract Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The persistent store: one SQLite file holding blobs, the commit DAG,
//! refs, annotations, provenance events, compile records, and spawn
//! pointers for every tract sharing the file.
//!
//! A `Store` owns one database session and is not safe to share across
//! threads; open one handle per task. Concurrent handles against the same
//! file coordinate through SQLite's WAL (many readers, one writer at a
//! time) with a generous busy timeout.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use clru::CLruCache;
use indoc::indoc;
use rusqlite::Connection;
use rusqlite::OptionalExtension as _;
use rusqlite::params;
use sha2::Digest as _;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use crate::annotate::Annotation;
use crate::annotate::Priority;
use crate::commit::Commit;
use crate::commit::CommitData;
use crate::commit::CommitOp;
use crate::commit::GenerationUsage;
use crate::commit::MillisSinceEpoch;
use crate::config::LlmConfig;
use crate::content::Payload;
use crate::object_id::CommitId;
use crate::object_id::ContentId;
use crate::object_id::ObjectId as _;
use crate::object_id::TractId;
use crate::op_store::CompileRecord;
use crate::op_store::EventCommitRole;
use crate::op_store::EventId;
use crate::op_store::EventKind;
use crate::op_store::InheritanceMode;
use crate::op_store::OperationEvent;
use crate::op_store::RecordId;
use crate::op_store::SpawnPointer;

/// Schema version written by this build. Older stores run the forward-only
/// migration chain on open; newer stores are rejected.
const SCHEMA_VERSION: u32 = 2;

const COMMIT_CACHE_CAPACITY: usize = 100;

/// The branch a fresh tract's HEAD attaches to.
pub const DEFAULT_BRANCH: &str = "main";

const HEAD_REF: &str = "HEAD";

/// The symbolic current ref of a tract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Head {
    /// HEAD names a branch; commits advance that branch. The branch may be
    /// unborn (no ref row yet) in a fresh tract.
    Attached { branch: String },
    /// HEAD pins a commit; ref-moving mutations are rejected.
    Detached { commit: CommitId },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TractInfo {
    pub id: TractId,
    pub name: String,
    pub created_at: MillisSinceEpoch,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Blob {0} not found")]
    MissingBlob(ContentId),
    #[error("Commit {0} not found")]
    MissingCommit(CommitId),
    #[error("Parent {parent} of commit {child} not found in tract")]
    OrphanParent { child: CommitId, parent: CommitId },
    #[error("Ref {name} not found")]
    UnknownRef { name: String },
    #[error("Tract {0} not found")]
    UnknownTract(TractId),
    #[error("Operation event {0} not found")]
    UnknownEvent(EventId),
    #[error("Compile record {0} not found")]
    UnknownRecord(RecordId),
    #[error("Cycle detected in ancestry of commit {0}")]
    CycleDetected(CommitId),
    #[error("Schema version {found} is newer than supported version {supported}")]
    SchemaVersion { found: u32, supported: u32 },
    #[error("Stored object {hash} is corrupt: {reason}")]
    Corrupt { hash: String, reason: String },
    #[error("Canonical serialization failed")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One database session over the shared store file.
pub struct Store {
    path: PathBuf,
    conn: RefCell<Connection>,
    commit_cache: RefCell<CLruCache<CommitId, Arc<CommitData>>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        f.debug_struct("Store")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens the store at `path`, creating the file and schema if absent and
    /// migrating an older schema if present.
    pub fn open(path: &Path) -> StoreResult<Arc<Self>> {
        let mut conn = Self::new_connection(path)?;
        Self::migrate(&mut conn)?;
        Ok(Arc::new(Self {
            path: path.to_owned(),
            conn: RefCell::new(conn),
            commit_cache: RefCell::new(CLruCache::new(
                NonZeroUsize::new(COMMIT_CACHE_CAPACITY).unwrap(),
            )),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn new_connection(path: &Path) -> StoreResult<Connection> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.pragma_update(None, "foreign_keys", "on")?;
        conn.pragma_update(None, "synchronous", "normal")?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        Ok(conn)
    }

    fn migrate(conn: &mut Connection) -> StoreResult<()> {
        let tx = conn.transaction()?;

        let user_version: u32 = tx.pragma_query_value(None, "user_version", |r| r.get(0))?;
        if user_version > SCHEMA_VERSION {
            return Err(StoreError::SchemaVersion {
                found: user_version,
                supported: SCHEMA_VERSION,
            });
        }

        if user_version < 1 {
            debug!("migrating store schema to version 1");
            tx.execute_batch(indoc! {r#"
                create table blobs
                -- Content-addressed payloads, deduplicated across all tracts.
                (
                    content_hash text primary key,
                    payload text not null,
                    byte_size integer not null check (byte_size >= 0),
                    token_count integer not null check (token_count >= 0),
                    created_at integer not null
                ) strict;

                create table tracts
                (
                    tract_id text primary key,
                    name text not null,
                    created_at integer not null
                ) strict;

                create table commits
                (
                    commit_hash text primary key,
                    tract_id text not null,
                    content_hash text not null references blobs(content_hash),
                    operation text not null check (operation in ('append', 'edit')),
                    edit_target text,
                    token_count integer not null check (token_count >= 0),
                    timestamp integer not null,
                    message text,
                    generation_config_json text,
                    usage_json text,
                    -- EDIT commits carry a target, APPEND commits do not
                    constraint edit_target_presence check (
                        (operation = 'edit') = (edit_target is not null)
                    )
                ) strict;

                create table parents
                -- Ordered parent edges. ord 0 is the mainline parent.
                (
                    child_hash text not null references commits(commit_hash),
                    parent_hash text not null,
                    ord integer not null check (ord >= 0),
                    primary key (child_hash, parent_hash)
                ) strict;

                create table refs
                (
                    tract_id text not null references tracts(tract_id),
                    name text not null,
                    commit_hash text references commits(commit_hash),
                    symbolic_target text,
                    primary key (tract_id, name)
                ) strict;

                create table annotations
                -- Append-only priority history per target commit.
                (
                    id integer primary key,
                    tract_id text not null references tracts(tract_id),
                    target_hash text not null references commits(commit_hash),
                    priority text not null check (priority in ('skip', 'normal', 'pinned')),
                    reason text,
                    created_at integer not null
                ) strict;

                create table operation_events
                (
                    event_id integer primary key,
                    tract_id text not null references tracts(tract_id),
                    event_type text not null check (event_type in ('compress', 'reorganize', 'import')),
                    params_json text not null,
                    original_tokens integer not null check (original_tokens >= 0),
                    compressed_tokens integer not null check (compressed_tokens >= 0),
                    created_at integer not null
                ) strict;

                create table operation_commits
                -- Commits consumed/produced/carried by an event. Not a foreign
                -- key into commits: events outlive the commits they describe.
                (
                    event_id integer not null references operation_events(event_id),
                    commit_hash text not null,
                    role text not null check (role in ('source', 'result', 'preserved')),
                    primary key (event_id, commit_hash, role)
                ) strict;

                create table compile_records
                (
                    record_id integer primary key,
                    tract_id text not null references tracts(tract_id),
                    head_hash text not null,
                    branch_name text,
                    token_count integer not null check (token_count >= 0),
                    created_at integer not null,
                    triggered_by text
                ) strict;

                create table compile_effective
                -- The exact ordered commits of one compile, with resolved
                -- priorities.
                (
                    record_id integer not null references compile_records(record_id),
                    position integer not null check (position >= 0),
                    commit_hash text not null,
                    effective_priority text not null check (effective_priority in ('skip', 'normal', 'pinned')),
                    primary key (record_id, position)
                ) strict;

                create table spawn_pointers
                (
                    id integer primary key,
                    parent_tract text not null references tracts(tract_id),
                    parent_commit text,
                    child_tract text not null references tracts(tract_id),
                    inheritance_mode text not null check (inheritance_mode in ('full_clone', 'head_snapshot', 'branch')),
                    purpose text not null,
                    created_at integer not null
                ) strict;

                create table meta
                (
                    key text primary key,
                    value text not null
                ) strict;

                pragma user_version = 1;
            "#})?;
        }

        let user_version: u32 = tx.pragma_query_value(None, "user_version", |r| r.get(0))?;
        if user_version < 2 {
            debug!("migrating store schema to version 2");
            tx.execute_batch(indoc! {r#"
                create index operation_events_original_tokens
                    on operation_events(original_tokens);
                create index operation_events_compressed_tokens
                    on operation_events(compressed_tokens);
                create index commits_tract on commits(tract_id);
                create index annotations_target on annotations(tract_id, target_hash);
                create index operation_commits_commit on operation_commits(commit_hash);
                create index compile_effective_commit on compile_effective(commit_hash);

                pragma user_version = 2;
            "#})?;
        }

        tx.execute(
            "insert into meta(key, value) values ('schema_version', ?1)
             on conflict(key) do update set value = excluded.value",
            params![SCHEMA_VERSION.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn schema_version(&self) -> StoreResult<u32> {
        let conn = self.conn.borrow();
        let value: String =
            conn.query_row("select value from meta where key = 'schema_version'", [], |r| {
                r.get(0)
            })?;
        value.parse().map_err(|_| StoreError::Corrupt {
            hash: "meta:schema_version".to_string(),
            reason: format!("unparsable version {value:?}"),
        })
    }

    /// Runs `f` inside a savepoint. On error everything `f` wrote is rolled
    /// back, leaving no partial state. Savepoints nest, so operations may
    /// call operations.
    pub fn in_savepoint<T, E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        self.conn
            .borrow()
            .execute_batch("savepoint tract_op")
            .map_err(StoreError::from)?;
        match f() {
            Ok(value) => {
                self.conn
                    .borrow()
                    .execute_batch("release tract_op")
                    .map_err(StoreError::from)?;
                Ok(value)
            }
            Err(err) => {
                let _ = self
                    .conn
                    .borrow()
                    .execute_batch("rollback to tract_op; release tract_op");
                Err(err)
            }
        }
    }

    pub fn clear_caches(&self) {
        self.commit_cache.borrow_mut().clear();
    }
}

// Tract registry
impl Store {
    pub fn create_tract(&self, name: &str) -> StoreResult<TractId> {
        let id = TractId::random();
        self.in_savepoint(|| {
            let conn = self.conn.borrow();
            conn.execute(
                "insert into tracts(tract_id, name, created_at) values (?1, ?2, ?3)",
                params![id.hex(), name, MillisSinceEpoch::now().0],
            )?;
            conn.execute(
                "insert into refs(tract_id, name, commit_hash, symbolic_target)
                 values (?1, ?2, null, ?3)",
                params![id.hex(), HEAD_REF, DEFAULT_BRANCH],
            )?;
            Ok::<_, StoreError>(())
        })?;
        debug!(tract = %id, name, "created tract");
        Ok(id)
    }

    pub fn tract_exists(&self, id: &TractId) -> StoreResult<bool> {
        let conn = self.conn.borrow();
        let count: i64 = conn.query_row(
            "select count(*) from tracts where tract_id = ?1",
            params![id.hex()],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn tract_info(&self, id: &TractId) -> StoreResult<TractInfo> {
        let conn = self.conn.borrow();
        conn.query_row(
            "select name, created_at from tracts where tract_id = ?1",
            params![id.hex()],
            |r| {
                Ok(TractInfo {
                    id: id.clone(),
                    name: r.get(0)?,
                    created_at: MillisSinceEpoch(r.get(1)?),
                })
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::UnknownTract(id.clone()))
    }

    pub fn list_tracts(&self) -> StoreResult<Vec<TractInfo>> {
        let conn = self.conn.borrow();
        let mut stmt =
            conn.prepare_cached("select tract_id, name, created_at from tracts order by rowid")?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })?;
        let mut infos = Vec::new();
        for row in rows {
            let (hex, name, created_at) = row?;
            infos.push(TractInfo {
                id: tract_id_from_hex(&hex)?,
                name,
                created_at: MillisSinceEpoch(created_at),
            });
        }
        Ok(infos)
    }
}

// Blobs
impl Store {
    /// Inserts a payload, deduplicating by content hash. Idempotent.
    pub fn put_blob(&self, payload: &Payload, token_count: u64) -> StoreResult<ContentId> {
        let bytes = payload.canonical_bytes()?;
        let id = ContentId::new(Sha256::digest(&bytes).to_vec());
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare_cached(indoc! {r#"
            insert into blobs(content_hash, payload, byte_size, token_count, created_at)
            values (?1, ?2, ?3, ?4, ?5)
            on conflict do nothing
        "#})?;
        stmt.execute(params![
            id.hex(),
            std::str::from_utf8(&bytes).expect("canonical JSON is UTF-8"),
            bytes.len() as i64,
            token_count as i64,
            MillisSinceEpoch::now().0,
        ])?;
        Ok(id)
    }

    pub fn get_blob(&self, id: &ContentId) -> StoreResult<Payload> {
        let conn = self.conn.borrow();
        let mut stmt =
            conn.prepare_cached("select payload from blobs where content_hash = ?1")?;
        let text: Option<String> = stmt
            .query_row(params![id.hex()], |r| r.get(0))
            .optional()?;
        let text = text.ok_or_else(|| StoreError::MissingBlob(id.clone()))?;
        // Hash mismatch on read is fatal corruption.
        let actual = Sha256::digest(text.as_bytes());
        if actual.as_slice() != id.as_bytes() {
            return Err(StoreError::Corrupt {
                hash: id.hex(),
                reason: "content hash mismatch".to_string(),
            });
        }
        Payload::from_canonical_bytes(text.as_bytes()).map_err(|err| StoreError::Corrupt {
            hash: id.hex(),
            reason: format!("payload decode failed: {err}"),
        })
    }

    pub fn blob_exists(&self, id: &ContentId) -> StoreResult<bool> {
        let conn = self.conn.borrow();
        let count: i64 = conn.query_row(
            "select count(*) from blobs where content_hash = ?1",
            params![id.hex()],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    /// Number of commits (in any tract) referencing this blob.
    pub fn blob_refcount(&self, id: &ContentId) -> StoreResult<u64> {
        let conn = self.conn.borrow();
        let count: i64 = conn.query_row(
            "select count(*) from commits where content_hash = ?1",
            params![id.hex()],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    pub(crate) fn delete_blob_if_unreferenced(&self, id: &ContentId) -> StoreResult<bool> {
        if self.blob_refcount(id)? > 0 {
            return Ok(false);
        }
        let conn = self.conn.borrow();
        let removed = conn.execute(
            "delete from blobs where content_hash = ?1",
            params![id.hex()],
        )?;
        Ok(removed > 0)
    }
}

// Commits
impl Store {
    /// Writes a commit and its parent edges, validating that the blob and
    /// every parent exist in the same tract. Writing identical data twice is
    /// idempotent (the hash is the primary key).
    pub fn write_commit(self: &Arc<Self>, data: CommitData) -> StoreResult<Commit> {
        if !self.blob_exists(&data.content)? {
            return Err(StoreError::MissingBlob(data.content.clone()));
        }
        let id = data.id();
        for parent in &data.parents {
            let parent_tract = self.commit_tract(parent)?;
            if parent_tract.as_ref() != Some(&data.tract) {
                return Err(StoreError::OrphanParent {
                    child: id.clone(),
                    parent: parent.clone(),
                });
            }
        }
        if let Some(target) = &data.edit_target
            && !self.commit_exists(target)?
        {
            return Err(StoreError::MissingCommit(target.clone()));
        }

        self.in_savepoint(|| {
            let conn = self.conn.borrow();
            let mut stmt = conn.prepare_cached(indoc! {r#"
                insert into commits(
                    commit_hash,
                    tract_id,
                    content_hash,
                    operation,
                    edit_target,
                    token_count,
                    timestamp,
                    message,
                    generation_config_json,
                    usage_json
                ) values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                on conflict do nothing
            "#})?;
            stmt.execute(params![
                id.hex(),
                data.tract.hex(),
                data.content.hex(),
                data.op.as_str(),
                data.edit_target.as_ref().map(|t| t.hex()),
                data.token_count as i64,
                data.timestamp.0,
                data.message,
                data.generation_config
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                data.usage.as_ref().map(serde_json::to_string).transpose()?,
            ])?;
            let mut edge = conn.prepare_cached(indoc! {r#"
                insert into parents(child_hash, parent_hash, ord)
                values (?1, ?2, ?3)
                on conflict do nothing
            "#})?;
            for (ord, parent) in data.parents.iter().enumerate() {
                edge.execute(params![id.hex(), parent.hex(), ord as i64])?;
            }
            Ok::<_, StoreError>(())
        })?;

        let data = Arc::new(data);
        self.commit_cache
            .borrow_mut()
            .put(id.clone(), data.clone());
        Ok(Commit::new(self.clone(), id, data))
    }

    pub fn get_commit(self: &Arc<Self>, id: &CommitId) -> StoreResult<Commit> {
        if let Some(data) = self.commit_cache.borrow_mut().get(id).cloned() {
            return Ok(Commit::new(self.clone(), id.clone(), data));
        }
        let data = Arc::new(self.read_commit_data(id)?);
        self.commit_cache
            .borrow_mut()
            .put(id.clone(), data.clone());
        Ok(Commit::new(self.clone(), id.clone(), data))
    }

    fn read_commit_data(&self, id: &CommitId) -> StoreResult<CommitData> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare_cached(indoc! {r#"
            select
                tract_id,
                content_hash,
                operation,
                edit_target,
                token_count,
                timestamp,
                message,
                generation_config_json,
                usage_json
            from commits where commit_hash = ?1
        "#})?;
        let row = stmt
            .query_row(params![id.hex()], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, i64>(5)?,
                    r.get::<_, Option<String>>(6)?,
                    r.get::<_, Option<String>>(7)?,
                    r.get::<_, Option<String>>(8)?,
                ))
            })
            .optional()?;
        let Some((
            tract_hex,
            content_hex,
            op,
            edit_target,
            token_count,
            timestamp,
            message,
            gen_config,
            usage,
        )) = row
        else {
            return Err(StoreError::MissingCommit(id.clone()));
        };

        let mut edges = conn.prepare_cached(
            "select parent_hash from parents where child_hash = ?1 order by ord",
        )?;
        let parents = edges
            .query_map(params![id.hex()], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .iter()
            .map(|hex| commit_id_from_hex(hex))
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(CommitData {
            tract: tract_id_from_hex(&tract_hex)?,
            content: content_id_from_hex(&content_hex)?,
            parents,
            op: CommitOp::parse(&op).ok_or_else(|| StoreError::Corrupt {
                hash: id.hex(),
                reason: format!("unknown operation {op:?}"),
            })?,
            edit_target: edit_target
                .as_deref()
                .map(commit_id_from_hex)
                .transpose()?,
            token_count: token_count as u64,
            timestamp: MillisSinceEpoch(timestamp),
            message,
            generation_config: gen_config
                .as_deref()
                .map(serde_json::from_str::<LlmConfig>)
                .transpose()?,
            usage: usage
                .as_deref()
                .map(serde_json::from_str::<GenerationUsage>)
                .transpose()?,
        })
    }

    pub fn commit_exists(&self, id: &CommitId) -> StoreResult<bool> {
        Ok(self.commit_tract(id)?.is_some())
    }

    fn commit_tract(&self, id: &CommitId) -> StoreResult<Option<TractId>> {
        let conn = self.conn.borrow();
        let mut stmt =
            conn.prepare_cached("select tract_id from commits where commit_hash = ?1")?;
        let hex: Option<String> = stmt
            .query_row(params![id.hex()], |r| r.get(0))
            .optional()?;
        hex.as_deref().map(tract_id_from_hex).transpose()
    }

    pub fn parent_ids(&self, id: &CommitId) -> StoreResult<Vec<CommitId>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare_cached(
            "select parent_hash from parents where child_hash = ?1 order by ord",
        )?;
        let rows = stmt.query_map(params![id.hex()], |r| r.get::<_, String>(0))?;
        let mut parents = Vec::new();
        for row in rows {
            parents.push(commit_id_from_hex(&row?)?);
        }
        Ok(parents)
    }

    pub fn commits_in_tract(&self, tract: &TractId) -> StoreResult<Vec<CommitId>> {
        let conn = self.conn.borrow();
        let mut stmt = conn
            .prepare_cached("select commit_hash from commits where tract_id = ?1 order by rowid")?;
        let rows = stmt.query_map(params![tract.hex()], |r| r.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(commit_id_from_hex(&row?)?);
        }
        Ok(ids)
    }

    /// `(id, timestamp, token_count)` for every commit of the tract.
    pub(crate) fn commit_gc_meta(
        &self,
        tract: &TractId,
    ) -> StoreResult<Vec<(CommitId, MillisSinceEpoch, u64)>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare_cached(
            "select commit_hash, timestamp, token_count from commits where tract_id = ?1",
        )?;
        let rows = stmt.query_map(params![tract.hex()], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (hex, ts, tokens) = row?;
            out.push((
                commit_id_from_hex(&hex)?,
                MillisSinceEpoch(ts),
                tokens as u64,
            ));
        }
        Ok(out)
    }

    pub(crate) fn delete_commit(&self, id: &CommitId) -> StoreResult<ContentId> {
        let content = {
            let conn = self.conn.borrow();
            let content: String = conn.query_row(
                "select content_hash from commits where commit_hash = ?1",
                params![id.hex()],
                |r| r.get(0),
            )?;
            conn.execute("delete from annotations where target_hash = ?1", params![id.hex()])?;
            conn.execute(
                "delete from parents where child_hash = ?1 or parent_hash = ?1",
                params![id.hex()],
            )?;
            conn.execute("delete from commits where commit_hash = ?1", params![id.hex()])?;
            content
        };
        self.commit_cache.borrow_mut().pop(id);
        content_id_from_hex(&content)
    }

    /// `(commit count, token sum)` for the tract.
    pub fn tract_stats(&self, tract: &TractId) -> StoreResult<(u64, u64)> {
        let conn = self.conn.borrow();
        conn.query_row(
            "select count(*), coalesce(sum(token_count), 0) from commits where tract_id = ?1",
            params![tract.hex()],
            |r| Ok((r.get::<_, i64>(0)? as u64, r.get::<_, i64>(1)? as u64)),
        )
        .map_err(StoreError::from)
    }
}

// Refs and HEAD
impl Store {
    pub fn set_branch(&self, tract: &TractId, name: &str, commit: &CommitId) -> StoreResult<()> {
        if self.commit_tract(commit)?.as_ref() != Some(tract) {
            return Err(StoreError::MissingCommit(commit.clone()));
        }
        let conn = self.conn.borrow();
        conn.execute(
            indoc! {r#"
                insert into refs(tract_id, name, commit_hash, symbolic_target)
                values (?1, ?2, ?3, null)
                on conflict(tract_id, name) do update set
                    commit_hash = excluded.commit_hash,
                    symbolic_target = null
            "#},
            params![tract.hex(), name, commit.hex()],
        )?;
        Ok(())
    }

    pub fn branch_target(&self, tract: &TractId, name: &str) -> StoreResult<Option<CommitId>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare_cached(
            "select commit_hash from refs where tract_id = ?1 and name = ?2",
        )?;
        let hex: Option<Option<String>> = stmt
            .query_row(params![tract.hex(), name], |r| r.get(0))
            .optional()?;
        match hex {
            Some(Some(hex)) => Ok(Some(commit_id_from_hex(&hex)?)),
            _ => Ok(None),
        }
    }

    pub fn branch_exists(&self, tract: &TractId, name: &str) -> StoreResult<bool> {
        Ok(self.branch_target(tract, name)?.is_some())
    }

    pub fn delete_branch(&self, tract: &TractId, name: &str) -> StoreResult<()> {
        let conn = self.conn.borrow();
        let removed = conn.execute(
            "delete from refs where tract_id = ?1 and name = ?2 and name != ?3",
            params![tract.hex(), name, HEAD_REF],
        )?;
        if removed == 0 {
            return Err(StoreError::UnknownRef {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Branches of the tract, lexicographic, excluding the symbolic HEAD.
    pub fn list_branches(&self, tract: &TractId) -> StoreResult<Vec<(String, CommitId)>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare_cached(indoc! {r#"
            select name, commit_hash from refs
            where tract_id = ?1 and name != ?2 and commit_hash is not null
            order by name
        "#})?;
        let rows = stmt.query_map(params![tract.hex(), HEAD_REF], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        let mut branches = Vec::new();
        for row in rows {
            let (name, hex) = row?;
            branches.push((name, commit_id_from_hex(&hex)?));
        }
        Ok(branches)
    }

    pub fn head(&self, tract: &TractId) -> StoreResult<Head> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare_cached(
            "select commit_hash, symbolic_target from refs where tract_id = ?1 and name = ?2",
        )?;
        let row: Option<(Option<String>, Option<String>)> = stmt
            .query_row(params![tract.hex(), HEAD_REF], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .optional()?;
        match row {
            Some((_, Some(branch))) => Ok(Head::Attached { branch }),
            Some((Some(hex), None)) => Ok(Head::Detached {
                commit: commit_id_from_hex(&hex)?,
            }),
            Some((None, None)) | None => Err(StoreError::Corrupt {
                hash: format!("{}:HEAD", tract.hex()),
                reason: "HEAD names neither a branch nor a commit".to_string(),
            }),
        }
    }

    pub fn set_head(&self, tract: &TractId, head: &Head) -> StoreResult<()> {
        if let Head::Detached { commit } = head
            && self.commit_tract(commit)?.as_ref() != Some(tract)
        {
            return Err(StoreError::MissingCommit(commit.clone()));
        }
        let (commit_hex, symbolic) = match head {
            Head::Attached { branch } => (None, Some(branch.as_str())),
            Head::Detached { commit } => (Some(commit.hex()), None),
        };
        let conn = self.conn.borrow();
        conn.execute(
            indoc! {r#"
                insert into refs(tract_id, name, commit_hash, symbolic_target)
                values (?1, ?2, ?3, ?4)
                on conflict(tract_id, name) do update set
                    commit_hash = excluded.commit_hash,
                    symbolic_target = excluded.symbolic_target
            "#},
            params![tract.hex(), HEAD_REF, commit_hex, symbolic],
        )?;
        Ok(())
    }

    /// The commit HEAD currently resolves to, if any. An attached unborn
    /// branch resolves to `None`.
    pub fn head_commit(&self, tract: &TractId) -> StoreResult<Option<CommitId>> {
        match self.head(tract)? {
            Head::Attached { branch } => self.branch_target(tract, &branch),
            Head::Detached { commit } => Ok(Some(commit)),
        }
    }

    /// Every commit a ref (branch or detached HEAD) points at.
    pub(crate) fn ref_targets(&self, tract: &TractId) -> StoreResult<Vec<CommitId>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare_cached(
            "select commit_hash from refs where tract_id = ?1 and commit_hash is not null",
        )?;
        let rows = stmt.query_map(params![tract.hex()], |r| r.get::<_, String>(0))?;
        let mut targets = Vec::new();
        for row in rows {
            targets.push(commit_id_from_hex(&row?)?);
        }
        Ok(targets)
    }
}

// Annotations
impl Store {
    pub fn annotate(
        &self,
        tract: &TractId,
        target: &CommitId,
        priority: Priority,
        reason: Option<&str>,
    ) -> StoreResult<()> {
        if self.commit_tract(target)?.as_ref() != Some(tract) {
            return Err(StoreError::MissingCommit(target.clone()));
        }
        let conn = self.conn.borrow();
        conn.execute(
            indoc! {r#"
                insert into annotations(tract_id, target_hash, priority, reason, created_at)
                values (?1, ?2, ?3, ?4, ?5)
            "#},
            params![
                tract.hex(),
                target.hex(),
                priority.as_str(),
                reason,
                MillisSinceEpoch::now().0
            ],
        )?;
        Ok(())
    }

    pub fn priority_of(&self, tract: &TractId, target: &CommitId) -> StoreResult<Priority> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare_cached(indoc! {r#"
            select priority from annotations
            where tract_id = ?1 and target_hash = ?2
            order by id desc limit 1
        "#})?;
        let priority: Option<String> = stmt
            .query_row(params![tract.hex(), target.hex()], |r| r.get(0))
            .optional()?;
        match priority {
            Some(p) => Priority::parse(&p).ok_or_else(|| StoreError::Corrupt {
                hash: target.hex(),
                reason: format!("unknown priority {p:?}"),
            }),
            None => Ok(Priority::Normal),
        }
    }

    pub fn annotation_history(
        &self,
        tract: &TractId,
        target: &CommitId,
    ) -> StoreResult<Vec<Annotation>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare_cached(indoc! {r#"
            select priority, reason, created_at from annotations
            where tract_id = ?1 and target_hash = ?2
            order by id
        "#})?;
        let rows = stmt.query_map(params![tract.hex(), target.hex()], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })?;
        let mut history = Vec::new();
        for row in rows {
            let (priority, reason, created_at) = row?;
            history.push(Annotation {
                target: target.clone(),
                priority: Priority::parse(&priority).ok_or_else(|| StoreError::Corrupt {
                    hash: target.hex(),
                    reason: format!("unknown priority {priority:?}"),
                })?,
                reason,
                created_at: MillisSinceEpoch(created_at),
            });
        }
        Ok(history)
    }

    /// Latest non-NORMAL priority per target. Targets whose latest entry is
    /// NORMAL are omitted; they behave as never annotated.
    pub fn effective_annotations(
        &self,
        tract: &TractId,
    ) -> StoreResult<BTreeMap<CommitId, Priority>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare_cached(
            "select target_hash, priority from annotations where tract_id = ?1 order by id",
        )?;
        let rows = stmt.query_map(params![tract.hex()], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        let mut latest: BTreeMap<CommitId, Priority> = BTreeMap::new();
        for row in rows {
            let (hex, priority) = row?;
            let target = commit_id_from_hex(&hex)?;
            let priority = Priority::parse(&priority).ok_or_else(|| StoreError::Corrupt {
                hash: hex,
                reason: format!("unknown priority {priority:?}"),
            })?;
            latest.insert(target, priority);
        }
        latest.retain(|_, priority| *priority != Priority::Normal);
        Ok(latest)
    }
}

// Operation events
impl Store {
    #[allow(clippy::too_many_arguments)]
    pub fn record_event(
        &self,
        tract: &TractId,
        kind: EventKind,
        params_json: &serde_json::Value,
        original_tokens: u64,
        compressed_tokens: u64,
        sources: &[CommitId],
        results: &[CommitId],
        preserved: &[CommitId],
    ) -> StoreResult<EventId> {
        let conn = self.conn.borrow();
        conn.execute(
            indoc! {r#"
                insert into operation_events(
                    tract_id, event_type, params_json,
                    original_tokens, compressed_tokens, created_at
                ) values (?1, ?2, ?3, ?4, ?5, ?6)
            "#},
            params![
                tract.hex(),
                kind.as_str(),
                serde_json::to_string(params_json)?,
                original_tokens as i64,
                compressed_tokens as i64,
                MillisSinceEpoch::now().0
            ],
        )?;
        let event_id = EventId(conn.last_insert_rowid());
        let mut stmt = conn.prepare_cached(
            "insert into operation_commits(event_id, commit_hash, role) values (?1, ?2, ?3)",
        )?;
        for (role, ids) in [
            (EventCommitRole::Source, sources),
            (EventCommitRole::Result, results),
            (EventCommitRole::Preserved, preserved),
        ] {
            for id in ids {
                stmt.execute(params![event_id.0, id.hex(), role.as_str()])?;
            }
        }
        Ok(event_id)
    }

    pub fn event(&self, id: EventId) -> StoreResult<OperationEvent> {
        let conn = self.conn.borrow();
        let row = conn
            .query_row(
                indoc! {r#"
                    select tract_id, event_type, params_json,
                           original_tokens, compressed_tokens, created_at
                    from operation_events where event_id = ?1
                "#},
                params![id.0],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, i64>(3)?,
                        r.get::<_, i64>(4)?,
                        r.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((tract_hex, kind, params_json, original, compressed, created_at)) = row else {
            return Err(StoreError::UnknownEvent(id));
        };

        let mut stmt = conn.prepare_cached(
            "select commit_hash, role from operation_commits where event_id = ?1 order by rowid",
        )?;
        let rows = stmt.query_map(params![id.0], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        let mut sources = Vec::new();
        let mut results = Vec::new();
        let mut preserved = Vec::new();
        for row in rows {
            let (hex, role) = row?;
            let commit = commit_id_from_hex(&hex)?;
            match EventCommitRole::parse(&role) {
                Some(EventCommitRole::Source) => sources.push(commit),
                Some(EventCommitRole::Result) => results.push(commit),
                Some(EventCommitRole::Preserved) => preserved.push(commit),
                None => {
                    return Err(StoreError::Corrupt {
                        hash: hex,
                        reason: format!("unknown event role {role:?}"),
                    });
                }
            }
        }

        Ok(OperationEvent {
            id,
            tract: tract_id_from_hex(&tract_hex)?,
            kind: EventKind::parse(&kind).ok_or_else(|| StoreError::Corrupt {
                hash: format!("event:{id}"),
                reason: format!("unknown event type {kind:?}"),
            })?,
            params: serde_json::from_str(&params_json)?,
            original_tokens: original as u64,
            compressed_tokens: compressed as u64,
            created_at: MillisSinceEpoch(created_at),
            sources,
            results,
            preserved,
        })
    }

    fn events_with_role(
        &self,
        commit: &CommitId,
        role: EventCommitRole,
    ) -> StoreResult<Vec<EventId>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare_cached(indoc! {r#"
            select distinct event_id from operation_commits
            where commit_hash = ?1 and role = ?2
            order by event_id
        "#})?;
        let rows = stmt.query_map(params![commit.hex(), role.as_str()], |r| {
            r.get::<_, i64>(0)
        })?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(EventId(row?));
        }
        Ok(ids)
    }

    /// Events that consumed `commit` ("was this commit ever compressed?").
    pub fn events_for_source(&self, commit: &CommitId) -> StoreResult<Vec<OperationEvent>> {
        self.events_with_role(commit, EventCommitRole::Source)?
            .into_iter()
            .map(|id| self.event(id))
            .collect()
    }

    /// Events that produced `commit` ("what sources produced this summary?").
    pub fn events_with_result(&self, commit: &CommitId) -> StoreResult<Vec<OperationEvent>> {
        self.events_with_role(commit, EventCommitRole::Result)?
            .into_iter()
            .map(|id| self.event(id))
            .collect()
    }

    /// Whether any event references the commit in any role.
    pub fn event_references(&self, commit: &CommitId) -> StoreResult<bool> {
        let conn = self.conn.borrow();
        let count: i64 = conn.query_row(
            "select count(*) from operation_commits where commit_hash = ?1",
            params![commit.hex()],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }
}

// Compile records
impl Store {
    pub fn record_compile(
        &self,
        tract: &TractId,
        head: &CommitId,
        branch: Option<&str>,
        token_count: u64,
        triggered_by: Option<&str>,
        effective: &[(CommitId, Priority)],
    ) -> StoreResult<RecordId> {
        let conn = self.conn.borrow();
        conn.execute(
            indoc! {r#"
                insert into compile_records(
                    tract_id, head_hash, branch_name, token_count, created_at, triggered_by
                ) values (?1, ?2, ?3, ?4, ?5, ?6)
            "#},
            params![
                tract.hex(),
                head.hex(),
                branch,
                token_count as i64,
                MillisSinceEpoch::now().0,
                triggered_by
            ],
        )?;
        let record_id = RecordId(conn.last_insert_rowid());
        let mut stmt = conn.prepare_cached(indoc! {r#"
            insert into compile_effective(record_id, position, commit_hash, effective_priority)
            values (?1, ?2, ?3, ?4)
        "#})?;
        for (position, (commit, priority)) in effective.iter().enumerate() {
            stmt.execute(params![
                record_id.0,
                position as i64,
                commit.hex(),
                priority.as_str()
            ])?;
        }
        Ok(record_id)
    }

    pub fn compile_record(&self, id: RecordId) -> StoreResult<CompileRecord> {
        let conn = self.conn.borrow();
        let row = conn
            .query_row(
                indoc! {r#"
                    select tract_id, head_hash, branch_name, token_count, created_at, triggered_by
                    from compile_records where record_id = ?1
                "#},
                params![id.0],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, Option<String>>(2)?,
                        r.get::<_, i64>(3)?,
                        r.get::<_, i64>(4)?,
                        r.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((tract_hex, head_hex, branch, token_count, created_at, triggered_by)) = row
        else {
            return Err(StoreError::UnknownRecord(id));
        };

        let mut stmt = conn.prepare_cached(indoc! {r#"
            select commit_hash, effective_priority from compile_effective
            where record_id = ?1 order by position
        "#})?;
        let rows = stmt.query_map(params![id.0], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        let mut effective = Vec::new();
        for row in rows {
            let (hex, priority) = row?;
            effective.push((
                commit_id_from_hex(&hex)?,
                Priority::parse(&priority).ok_or_else(|| StoreError::Corrupt {
                    hash: hex,
                    reason: format!("unknown priority {priority:?}"),
                })?,
            ));
        }

        Ok(CompileRecord {
            id,
            tract: tract_id_from_hex(&tract_hex)?,
            head: commit_id_from_hex(&head_hex)?,
            branch,
            token_count: token_count as u64,
            created_at: MillisSinceEpoch(created_at),
            triggered_by,
            effective,
        })
    }

    pub fn latest_compile_record(&self, tract: &TractId) -> StoreResult<Option<CompileRecord>> {
        let conn = self.conn.borrow();
        let id: Option<i64> = conn
            .query_row(
                "select record_id from compile_records where tract_id = ?1
                 order by record_id desc limit 1",
                params![tract.hex()],
                |r| r.get(0),
            )
            .optional()?;
        drop(conn);
        id.map(|id| self.compile_record(RecordId(id))).transpose()
    }

    /// Every commit referenced by a compile record of the tract, as head or
    /// as an effective entry.
    pub(crate) fn compile_referenced_commits(&self, tract: &TractId) -> StoreResult<Vec<CommitId>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare_cached(indoc! {r#"
            select distinct head_hash from compile_records where tract_id = ?1
            union
            select distinct ce.commit_hash
            from compile_effective ce
            join compile_records cr on cr.record_id = ce.record_id
            where cr.tract_id = ?1
        "#})?;
        let rows = stmt.query_map(params![tract.hex()], |r| r.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(commit_id_from_hex(&row?)?);
        }
        Ok(ids)
    }

    /// Whether any compile record references the commit (as head or as an
    /// effective entry).
    pub fn compile_references(&self, commit: &CommitId) -> StoreResult<bool> {
        let conn = self.conn.borrow();
        let count: i64 = conn.query_row(
            indoc! {r#"
                select
                    (select count(*) from compile_records where head_hash = ?1)
                    + (select count(*) from compile_effective where commit_hash = ?1)
            "#},
            params![commit.hex()],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }
}

// Spawn pointers
impl Store {
    pub fn record_spawn(
        &self,
        parent_tract: &TractId,
        parent_commit: Option<&CommitId>,
        child_tract: &TractId,
        mode: InheritanceMode,
        purpose: &str,
    ) -> StoreResult<i64> {
        let conn = self.conn.borrow();
        conn.execute(
            indoc! {r#"
                insert into spawn_pointers(
                    parent_tract, parent_commit, child_tract,
                    inheritance_mode, purpose, created_at
                ) values (?1, ?2, ?3, ?4, ?5, ?6)
            "#},
            params![
                parent_tract.hex(),
                parent_commit.map(|c| c.hex()),
                child_tract.hex(),
                mode.as_str(),
                purpose,
                MillisSinceEpoch::now().0
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn spawn_rows(&self, filter_sql: &str, key: &TractId) -> StoreResult<Vec<SpawnPointer>> {
        let conn = self.conn.borrow();
        let mut stmt = conn.prepare(&format!(
            "select id, parent_tract, parent_commit, child_tract, inheritance_mode, purpose, \
             created_at from spawn_pointers where {filter_sql} order by id"
        ))?;
        let rows = stmt.query_map(params![key.hex()], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, i64>(6)?,
            ))
        })?;
        let mut pointers = Vec::new();
        for row in rows {
            let (id, parent_hex, parent_commit, child_hex, mode, purpose, created_at) = row?;
            pointers.push(SpawnPointer {
                id,
                parent_tract: tract_id_from_hex(&parent_hex)?,
                parent_commit: parent_commit
                    .as_deref()
                    .map(commit_id_from_hex)
                    .transpose()?,
                child_tract: tract_id_from_hex(&child_hex)?,
                mode: InheritanceMode::parse(&mode).ok_or_else(|| StoreError::Corrupt {
                    hash: format!("spawn:{id}"),
                    reason: format!("unknown inheritance mode {mode:?}"),
                })?,
                purpose,
                created_at: MillisSinceEpoch(created_at),
            });
        }
        Ok(pointers)
    }

    /// Pointers whose parent is the given tract (children spawned from it).
    pub fn spawns_from(&self, tract: &TractId) -> StoreResult<Vec<SpawnPointer>> {
        self.spawn_rows("parent_tract = ?1", tract)
    }

    /// Pointers whose child is the given tract.
    pub fn spawn_parents_of(&self, tract: &TractId) -> StoreResult<Vec<SpawnPointer>> {
        self.spawn_rows("child_tract = ?1", tract)
    }
}

fn commit_id_from_hex(hex: &str) -> StoreResult<CommitId> {
    CommitId::try_from_hex(hex).ok_or_else(|| StoreError::Corrupt {
        hash: hex.to_string(),
        reason: "invalid commit id hex".to_string(),
    })
}

fn content_id_from_hex(hex: &str) -> StoreResult<ContentId> {
    ContentId::try_from_hex(hex).ok_or_else(|| StoreError::Corrupt {
        hash: hex.to_string(),
        reason: "invalid content id hex".to_string(),
    })
}

fn tract_id_from_hex(hex: &str) -> StoreResult<TractId> {
    TractId::try_from_hex(hex).ok_or_else(|| StoreError::Corrupt {
        hash: hex.to_string(),
        reason: "invalid tract id hex".to_string(),
    })
}
