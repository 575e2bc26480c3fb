// crates/db/src/blobs.rs
//! Content-addressed blob storage inside each session DB.
//!
//! Blob ids are the SHA-512/256 of the data, hex-encoded. Reference counts
//! are maintained by the message triggers in `schema.rs`; rows that reach
//! `ref_count <= 0` are deleted by the same triggers.

use rusqlite::params;
use sha2::{Digest, Sha512_256};

use crate::error::StoreResult;
use crate::handle::SessionExec;

/// Compute the blob id for a byte string.
pub fn blob_id(data: &[u8]) -> String {
    hex::encode(Sha512_256::digest(data))
}

/// Store a blob, returning its id. Re-inserting identical content is a
/// no-op; the refcount only moves when messages reference the hash.
pub fn put_blob<E: SessionExec>(exec: &E, data: &[u8]) -> StoreResult<String> {
    let id = blob_id(data);
    exec.execute(
        "INSERT INTO S.blobs (id, data, ref_count) VALUES (?1, ?2, 0)
         ON CONFLICT(id) DO NOTHING",
        params![id, data],
    )?;
    Ok(id)
}

pub fn get_blob<E: SessionExec>(exec: &E, id: &str) -> StoreResult<Option<Vec<u8>>> {
    exec.query_row_opt(
        "SELECT data FROM S.blobs WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )
}

pub fn blob_ref_count<E: SessionExec>(exec: &E, id: &str) -> StoreResult<Option<i64>> {
    exec.query_row_opt(
        "SELECT ref_count FROM S.blobs WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )
}

/// Remove blobs that were stored but never referenced by any message.
pub fn purge_orphan_blobs<E: SessionExec>(exec: &E) -> StoreResult<usize> {
    exec.execute("DELETE FROM S.blobs WHERE ref_count <= 0", params![])
}
