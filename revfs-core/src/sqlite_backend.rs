//! SQLite-backed storage
//!
//! One database file `fs.sqlite` in the repository directory, opened in WAL
//! mode. Revisions and node versions are stored as bincode blobs;
//! representations are additionally zstd-compressed.

use crate::error::{FsError, Result};
use crate::id::{NodeId, NodeVersionId};
use crate::object::{NodeRevision, Representation, Revision};
use crate::properties::PropertyMap;
use crate::storage::{check_batch_order, Backend, CommitBatch, StagedWrites};
use crate::Revnum;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const DB_FILE: &str = "fs.sqlite";

fn open_db(root: &Path) -> Result<Connection> {
    let db_path = root.join(DB_FILE);
    let conn = Connection::open(&db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", "-64000")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        ) WITHOUT ROWID;
        CREATE TABLE IF NOT EXISTS revisions (
            rev INTEGER PRIMARY KEY,
            data BLOB NOT NULL
        );
        CREATE TABLE IF NOT EXISTS nodes (
            id TEXT PRIMARY KEY,
            data BLOB NOT NULL
        ) WITHOUT ROWID;
        CREATE TABLE IF NOT EXISTS representations (
            key TEXT PRIMARY KEY,
            data BLOB NOT NULL
        ) WITHOUT ROWID;
        CREATE TABLE IF NOT EXISTS branches (
            base TEXT PRIMARY KEY,
            count INTEGER NOT NULL
        ) WITHOUT ROWID;
        CREATE TABLE IF NOT EXISTS heads (
            node TEXT PRIMARY KEY,
            id TEXT NOT NULL
        ) WITHOUT ROWID;",
    )?;
    Ok(conn)
}

fn meta_get(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM meta WHERE key=?1", params![key], |r| r.get(0))
        .optional()?)
}

fn meta_set(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO meta (key,value) VALUES (?1,?2) \
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn conn_youngest(conn: &Connection) -> Result<Option<Revnum>> {
    let max: Option<i64> = conn.query_row("SELECT MAX(rev) FROM revisions", [], |r| r.get(0))?;
    Ok(max.map(|r| r as Revnum))
}

fn conn_revision(conn: &Connection, rev: Revnum) -> Result<Option<Revision>> {
    let data: Option<Vec<u8>> = conn
        .query_row("SELECT data FROM revisions WHERE rev=?1", params![rev as i64], |r| r.get(0))
        .optional()?;
    data.map(|d| bincode::deserialize(&d).map_err(FsError::from)).transpose()
}

fn conn_set_revision_properties(conn: &Connection, rev: Revnum, props: &PropertyMap) -> Result<()> {
    let mut revision = conn_revision(conn, rev)?.ok_or(FsError::NoSuchRevision(rev))?;
    revision.props = props.clone();
    conn.execute(
        "UPDATE revisions SET data=?2 WHERE rev=?1",
        params![rev as i64, bincode::serialize(&revision)?],
    )?;
    Ok(())
}

/// Insert one batch; `reps` are the batch's representations already encoded
fn conn_insert_batch(conn: &Connection, batch: &CommitBatch, reps: &[(String, Vec<u8>)]) -> Result<()> {
    check_batch_order(conn_youngest(conn)?, batch)?;

    for node in &batch.nodes {
        let id = node.id.to_string();
        conn.execute(
            "INSERT OR REPLACE INTO nodes (id,data) VALUES (?1,?2)",
            params![id, bincode::serialize(node)?],
        )?;
        conn.execute(
            "INSERT INTO heads (node,id) VALUES (?1,?2) \
             ON CONFLICT(node) DO UPDATE SET id=excluded.id",
            params![node.id.node_id().to_string(), id],
        )?;
    }
    for (key, data) in reps {
        conn.execute(
            "INSERT OR REPLACE INTO representations (key,data) VALUES (?1,?2)",
            params![key, data],
        )?;
    }
    for (base, count) in &batch.branch_counters {
        conn.execute(
            "INSERT INTO branches (base,count) VALUES (?1,?2) \
             ON CONFLICT(base) DO UPDATE SET count=excluded.count",
            params![base.to_string(), *count as i64],
        )?;
    }
    meta_set(conn, "next_node_number", &batch.next_node_number.to_string())?;
    conn.execute(
        "INSERT INTO revisions (rev,data) VALUES (?1,?2)",
        params![batch.revision.number as i64, bincode::serialize(&batch.revision)?],
    )?;
    Ok(())
}

/// Backend persisting a repository in an SQLite database
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    compression_level: i32,
}

impl SqliteBackend {
    /// Open (creating if needed) the database under `root`
    pub fn open(root: &Path, compression_level: i32) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let conn = open_db(root)?;
        if meta_get(&conn, "uuid")?.is_none() {
            meta_set(&conn, "uuid", &uuid::Uuid::new_v4().to_string())?;
        }
        Ok(Self {
            conn: Mutex::new(conn),
            compression_level,
        })
    }

    fn encode_rep(&self, rep: &Representation) -> Result<Vec<u8>> {
        let raw = bincode::serialize(rep)?;
        Ok(zstd::stream::encode_all(&raw[..], self.compression_level)?)
    }

    fn encode_reps(&self, batch: &CommitBatch) -> Result<Vec<(String, Vec<u8>)>> {
        batch
            .representations
            .iter()
            .map(|(key, rep)| Ok((key.to_string(), self.encode_rep(rep)?)))
            .collect()
    }

    fn decode_rep(key: &NodeVersionId, data: &[u8]) -> Result<Representation> {
        let raw = zstd::stream::decode_all(data)
            .map_err(|e| FsError::corrupt(format!("representation {} does not decompress: {}", key, e)))?;
        bincode::deserialize(&raw)
            .map_err(|e| FsError::corrupt(format!("representation {} does not decode: {}", key, e)))
    }
}

impl Backend for SqliteBackend {
    fn uuid(&self) -> Result<String> {
        meta_get(&self.conn.lock(), "uuid")?.ok_or_else(|| FsError::corrupt("repository has no uuid"))
    }

    fn set_uuid(&self, uuid: &str) -> Result<()> {
        meta_set(&self.conn.lock(), "uuid", uuid)
    }

    fn youngest(&self) -> Result<Option<Revnum>> {
        conn_youngest(&self.conn.lock())
    }

    fn revision(&self, rev: Revnum) -> Result<Option<Revision>> {
        conn_revision(&self.conn.lock(), rev)
    }

    fn node(&self, id: &NodeVersionId) -> Result<Option<NodeRevision>> {
        let conn = self.conn.lock();
        let data: Option<Vec<u8>> = conn
            .query_row("SELECT data FROM nodes WHERE id=?1", params![id.to_string()], |r| r.get(0))
            .optional()?;
        data.map(|d| bincode::deserialize(&d).map_err(FsError::from)).transpose()
    }

    fn representation(&self, key: &NodeVersionId) -> Result<Option<Representation>> {
        let conn = self.conn.lock();
        let data: Option<Vec<u8>> = conn
            .query_row(
                "SELECT data FROM representations WHERE key=?1",
                params![key.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        data.map(|d| Self::decode_rep(key, &d)).transpose()
    }

    fn next_node_number(&self) -> Result<u64> {
        let value = meta_get(&self.conn.lock(), "next_node_number")?;
        match value {
            Some(v) => v
                .parse()
                .map_err(|_| FsError::corrupt(format!("bad next_node_number '{}'", v))),
            None => Ok(0),
        }
    }

    fn branch_count(&self, base: &NodeVersionId) -> Result<u64> {
        let conn = self.conn.lock();
        let count: Option<i64> = conn
            .query_row("SELECT count FROM branches WHERE base=?1", params![base.to_string()], |r| r.get(0))
            .optional()?;
        Ok(count.unwrap_or(0) as u64)
    }

    fn node_head(&self, node: &NodeId) -> Result<Option<NodeVersionId>> {
        let conn = self.conn.lock();
        let id: Option<String> = conn
            .query_row("SELECT id FROM heads WHERE node=?1", params![node.to_string()], |r| r.get(0))
            .optional()?;
        id.map(|id| NodeVersionId::parse(&id)).transpose()
    }

    fn write_batch(&self, batch: CommitBatch) -> Result<()> {
        let reps = self.encode_reps(&batch)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        conn_insert_batch(&tx, &batch, &reps)?;
        tx.commit()?;
        Ok(())
    }

    fn write_revision_properties(&self, rev: Revnum, props: &PropertyMap) -> Result<()> {
        conn_set_revision_properties(&self.conn.lock(), rev, props)
    }

    fn write_staged(&self, staged: StagedWrites) -> Result<()> {
        let encoded = staged
            .batches
            .iter()
            .map(|batch| self.encode_reps(batch))
            .collect::<Result<Vec<_>>>()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        if let Some(uuid) = &staged.uuid {
            meta_set(&tx, "uuid", uuid)?;
        }
        for (rev, props) in &staged.revision_properties {
            conn_set_revision_properties(&tx, *rev, props)?;
        }
        for (batch, reps) in staged.batches.iter().zip(&encoded) {
            conn_insert_batch(&tx, batch, reps)?;
        }
        tx.commit()?;
        Ok(())
    }
}
