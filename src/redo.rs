//! Write-ahead redo log: an append-only file of crc32-framed logical
//! records, replayed through a visitor after a crash.
//!
//! Record framing: a one-byte kind, a little-endian u32 payload length, the
//! payload, and a crc32 over kind, length and payload. A truncated or
//! checksum-failing tail terminates replay cleanly; everything before it is
//! applied.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use log::{info, warn};

use crate::error::{Error, Result};

const REDO_MAGIC: [u8; 8] = *b"MRTNRD01";
const REDO_VERSION: u16 = 1;

const OP_RESET: u8 = 1;
const OP_TIMESTAMP: u8 = 2;
const OP_SHUTDOWN: u8 = 3;
const OP_CLOSE: u8 = 4;
const OP_END_FILE: u8 = 5;
const OP_STORE: u8 = 6;
const OP_STORE_NO_LOCK: u8 = 7;
const OP_DROP_INDEX: u8 = 8;
const OP_RENAME_INDEX: u8 = 9;
const OP_TXN_ENTER: u8 = 10;
const OP_TXN_ROLLBACK: u8 = 11;
const OP_TXN_ROLLBACK_FINAL: u8 = 12;
const OP_TXN_COMMIT: u8 = 13;
const OP_TXN_COMMIT_FINAL: u8 = 14;
const OP_TXN_STORE: u8 = 15;
const OP_TXN_STORE_COMMIT_FINAL: u8 = 16;

/// Replay driver callback, one method per record kind. Each returns whether
/// replay should continue.
pub trait RedoVisitor {
    fn reset(&mut self) -> Result<bool>;
    fn timestamp(&mut self, timestamp: i64) -> Result<bool>;
    fn shutdown(&mut self, timestamp: i64) -> Result<bool>;
    fn close(&mut self, timestamp: i64) -> Result<bool>;
    fn end_file(&mut self, timestamp: i64) -> Result<bool>;
    fn store(&mut self, index_id: u64, key: &[u8], value: Option<&[u8]>) -> Result<bool>;
    fn store_no_lock(&mut self, index_id: u64, key: &[u8], value: Option<&[u8]>) -> Result<bool>;
    fn drop_index(&mut self, index_id: u64) -> Result<bool>;
    fn rename_index(&mut self, index_id: u64, new_name: &[u8]) -> Result<bool>;
    fn txn_enter(&mut self, txn_id: u64) -> Result<bool>;
    fn txn_rollback(&mut self, txn_id: u64) -> Result<bool>;
    fn txn_rollback_final(&mut self, txn_id: u64) -> Result<bool>;
    fn txn_commit(&mut self, txn_id: u64) -> Result<bool>;
    fn txn_commit_final(&mut self, txn_id: u64) -> Result<bool>;
    fn txn_store(
        &mut self,
        txn_id: u64,
        index_id: u64,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool>;
    fn txn_store_commit_final(
        &mut self,
        txn_id: u64,
        index_id: u64,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<bool>;
}

/// Append side of the redo log.
pub struct RedoLog {
    path: PathBuf,
    file: File,
}

impl RedoLog {
    /// Start a fresh log file, truncating whatever was there.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut log = Self { path, file };
        log.file.write_all(&REDO_MAGIC)?;
        log.file.write_u16::<LittleEndian>(REDO_VERSION)?;
        log.timestamp()?;
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(&mut self, op: u8, payload: &[u8]) -> Result<()> {
        let mut hasher = Hasher::new();
        hasher.update(&[op]);
        hasher.update(&(payload.len() as u32).to_le_bytes());
        hasher.update(payload);

        self.file.write_u8(op)?;
        self.file.write_u32::<LittleEndian>(payload.len() as u32)?;
        self.file.write_all(payload)?;
        self.file.write_u32::<LittleEndian>(hasher.finalize())?;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn reset(&mut self) -> Result<()> {
        self.write_record(OP_RESET, &[])
    }

    pub fn timestamp(&mut self) -> Result<()> {
        self.write_record(OP_TIMESTAMP, &now_millis().to_le_bytes())
    }

    pub fn shutdown(&mut self) -> Result<()> {
        self.write_record(OP_SHUTDOWN, &now_millis().to_le_bytes())?;
        self.sync()
    }

    pub fn close_record(&mut self) -> Result<()> {
        self.write_record(OP_CLOSE, &now_millis().to_le_bytes())?;
        self.sync()
    }

    pub fn end_file(&mut self) -> Result<()> {
        self.write_record(OP_END_FILE, &now_millis().to_le_bytes())
    }

    pub fn store(&mut self, index_id: u64, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let payload = encode_store(None, index_id, key, value);
        self.write_record(OP_STORE, &payload)
    }

    pub fn store_no_lock(&mut self, index_id: u64, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        let payload = encode_store(None, index_id, key, value);
        self.write_record(OP_STORE_NO_LOCK, &payload)
    }

    pub fn drop_index(&mut self, index_id: u64) -> Result<()> {
        self.write_record(OP_DROP_INDEX, &index_id.to_le_bytes())
    }

    pub fn rename_index(&mut self, index_id: u64, new_name: &[u8]) -> Result<()> {
        let mut payload = Vec::with_capacity(8 + 4 + new_name.len());
        payload.extend_from_slice(&index_id.to_le_bytes());
        put_bytes(&mut payload, new_name);
        self.write_record(OP_RENAME_INDEX, &payload)
    }

    pub fn txn_enter(&mut self, txn_id: u64) -> Result<()> {
        self.write_record(OP_TXN_ENTER, &txn_id.to_le_bytes())
    }

    pub fn txn_rollback(&mut self, txn_id: u64) -> Result<()> {
        self.write_record(OP_TXN_ROLLBACK, &txn_id.to_le_bytes())
    }

    pub fn txn_rollback_final(&mut self, txn_id: u64) -> Result<()> {
        self.write_record(OP_TXN_ROLLBACK_FINAL, &txn_id.to_le_bytes())
    }

    pub fn txn_commit(&mut self, txn_id: u64) -> Result<()> {
        self.write_record(OP_TXN_COMMIT, &txn_id.to_le_bytes())
    }

    pub fn txn_commit_final(&mut self, txn_id: u64) -> Result<()> {
        self.write_record(OP_TXN_COMMIT_FINAL, &txn_id.to_le_bytes())?;
        self.sync()
    }

    pub fn txn_store(
        &mut self,
        txn_id: u64,
        index_id: u64,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<()> {
        let payload = encode_store(Some(txn_id), index_id, key, value);
        self.write_record(OP_TXN_STORE, &payload)
    }

    pub fn txn_store_commit_final(
        &mut self,
        txn_id: u64,
        index_id: u64,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> Result<()> {
        let payload = encode_store(Some(txn_id), index_id, key, value);
        self.write_record(OP_TXN_STORE_COMMIT_FINAL, &payload)?;
        self.sync()
    }
}

/// Replay side: decodes a log file and drives a visitor.
pub struct RedoReader {
    file: File,
}

impl RedoReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)
            .map_err(|_| Error::Storage("redo log too small for header".into()))?;
        if magic != REDO_MAGIC {
            return Err(Error::Storage("invalid redo log magic".into()));
        }
        let version = file.read_u16::<LittleEndian>()?;
        if version != REDO_VERSION {
            return Err(Error::Storage(format!(
                "unsupported redo log version: {version}"
            )));
        }
        Ok(Self { file })
    }

    /// Apply every intact record in order. Stops at the first torn or
    /// checksum-failing record (the tail of an interrupted write) or when
    /// the visitor declines to continue.
    pub fn replay(&mut self, visitor: &mut dyn RedoVisitor) -> Result<u64> {
        let mut applied = 0u64;
        loop {
            let record = match self.read_record() {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(err) => {
                    warn!("redo replay stopped at corrupt tail: {err}");
                    break;
                }
            };
            applied += 1;
            if !self.dispatch(&record, visitor)? {
                break;
            }
        }
        info!("redo replay applied {applied} records");
        Ok(applied)
    }

    fn dispatch(&self, record: &(u8, Vec<u8>), visitor: &mut dyn RedoVisitor) -> Result<bool> {
        let (op, payload) = record;
        let mut cursor = std::io::Cursor::new(payload.as_slice());
        match *op {
            OP_RESET => visitor.reset(),
            OP_TIMESTAMP => visitor.timestamp(cursor.read_i64::<LittleEndian>()?),
            OP_SHUTDOWN => visitor.shutdown(cursor.read_i64::<LittleEndian>()?),
            OP_CLOSE => visitor.close(cursor.read_i64::<LittleEndian>()?),
            OP_END_FILE => visitor.end_file(cursor.read_i64::<LittleEndian>()?),
            OP_STORE | OP_STORE_NO_LOCK => {
                let (_, index_id, key, value) = decode_store(payload, false)?;
                if *op == OP_STORE {
                    visitor.store(index_id, &key, value.as_deref())
                } else {
                    visitor.store_no_lock(index_id, &key, value.as_deref())
                }
            }
            OP_DROP_INDEX => visitor.drop_index(cursor.read_u64::<LittleEndian>()?),
            OP_RENAME_INDEX => {
                let index_id = cursor.read_u64::<LittleEndian>()?;
                let name = get_bytes(&mut cursor)?;
                visitor.rename_index(index_id, &name)
            }
            OP_TXN_ENTER => visitor.txn_enter(cursor.read_u64::<LittleEndian>()?),
            OP_TXN_ROLLBACK => visitor.txn_rollback(cursor.read_u64::<LittleEndian>()?),
            OP_TXN_ROLLBACK_FINAL => {
                visitor.txn_rollback_final(cursor.read_u64::<LittleEndian>()?)
            }
            OP_TXN_COMMIT => visitor.txn_commit(cursor.read_u64::<LittleEndian>()?),
            OP_TXN_COMMIT_FINAL => visitor.txn_commit_final(cursor.read_u64::<LittleEndian>()?),
            OP_TXN_STORE | OP_TXN_STORE_COMMIT_FINAL => {
                let (txn_id, index_id, key, value) = decode_store(payload, true)?;
                let txn_id = txn_id.unwrap_or(0);
                if *op == OP_TXN_STORE {
                    visitor.txn_store(txn_id, index_id, &key, value.as_deref())
                } else {
                    visitor.txn_store_commit_final(txn_id, index_id, &key, value.as_deref())
                }
            }
            other => Err(Error::Storage(format!("unknown redo record kind {other}"))),
        }
    }

    fn read_record(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        let op = match self.file.read_u8() {
            Ok(op) => op,
            Err(_) => return Ok(None), // clean end of file
        };
        let len = self.file.read_u32::<LittleEndian>()? as usize;
        let mut payload = vec![0u8; len];
        self.file.read_exact(&mut payload)?;
        let stored = self.file.read_u32::<LittleEndian>()?;

        let mut hasher = Hasher::new();
        hasher.update(&[op]);
        hasher.update(&(len as u32).to_le_bytes());
        hasher.update(&payload);
        if hasher.finalize() != stored {
            return Err(Error::Storage("redo record checksum mismatch".into()));
        }
        Ok(Some((op, payload)))
    }

    /// Byte offset of the read position, for diagnostics.
    pub fn position(&mut self) -> Result<u64> {
        Ok(self.file.seek(SeekFrom::Current(0))?)
    }
}

fn encode_store(txn_id: Option<u64>, index_id: u64, key: &[u8], value: Option<&[u8]>) -> Vec<u8> {
    let mut payload = Vec::with_capacity(24 + key.len() + value.map_or(0, |v| v.len()));
    if let Some(txn_id) = txn_id {
        payload.extend_from_slice(&txn_id.to_le_bytes());
    }
    payload.extend_from_slice(&index_id.to_le_bytes());
    put_bytes(&mut payload, key);
    match value {
        Some(value) => {
            payload.push(1);
            put_bytes(&mut payload, value);
        }
        // a missing value encodes a delete
        None => payload.push(0),
    }
    payload
}

type DecodedStore = (Option<u64>, u64, Vec<u8>, Option<Vec<u8>>);

fn decode_store(payload: &[u8], with_txn: bool) -> Result<DecodedStore> {
    let mut cursor = std::io::Cursor::new(payload);
    let txn_id = if with_txn {
        Some(cursor.read_u64::<LittleEndian>()?)
    } else {
        None
    };
    let index_id = cursor.read_u64::<LittleEndian>()?;
    let key = get_bytes(&mut cursor)?;
    let has_value = cursor.read_u8()? != 0;
    let value = if has_value {
        Some(get_bytes(&mut cursor)?)
    } else {
        None
    };
    Ok((txn_id, index_id, key, value))
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn get_bytes(cursor: &mut std::io::Cursor<&[u8]>) -> Result<Vec<u8>> {
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    let pos = cursor.position() as usize;
    let data = *cursor.get_ref();
    if pos + len > data.len() {
        return Err(Error::Storage("redo payload truncated".into()));
    }
    cursor.set_position((pos + len) as u64);
    Ok(data[pos..pos + len].to_vec())
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder {
        stores: Vec<(u64, Vec<u8>, Option<Vec<u8>>)>,
        txn_stores: Vec<(u64, u64, Vec<u8>, Option<Vec<u8>>)>,
        commits: Vec<u64>,
        timestamps: usize,
    }

    impl RedoVisitor for Recorder {
        fn reset(&mut self) -> Result<bool> {
            Ok(true)
        }
        fn timestamp(&mut self, _t: i64) -> Result<bool> {
            self.timestamps += 1;
            Ok(true)
        }
        fn shutdown(&mut self, _t: i64) -> Result<bool> {
            Ok(true)
        }
        fn close(&mut self, _t: i64) -> Result<bool> {
            Ok(true)
        }
        fn end_file(&mut self, _t: i64) -> Result<bool> {
            Ok(true)
        }
        fn store(&mut self, index_id: u64, key: &[u8], value: Option<&[u8]>) -> Result<bool> {
            self.stores
                .push((index_id, key.to_vec(), value.map(|v| v.to_vec())));
            Ok(true)
        }
        fn store_no_lock(
            &mut self,
            index_id: u64,
            key: &[u8],
            value: Option<&[u8]>,
        ) -> Result<bool> {
            self.store(index_id, key, value)
        }
        fn drop_index(&mut self, _index_id: u64) -> Result<bool> {
            Ok(true)
        }
        fn rename_index(&mut self, _index_id: u64, _new_name: &[u8]) -> Result<bool> {
            Ok(true)
        }
        fn txn_enter(&mut self, _txn_id: u64) -> Result<bool> {
            Ok(true)
        }
        fn txn_rollback(&mut self, _txn_id: u64) -> Result<bool> {
            Ok(true)
        }
        fn txn_rollback_final(&mut self, _txn_id: u64) -> Result<bool> {
            Ok(true)
        }
        fn txn_commit(&mut self, _txn_id: u64) -> Result<bool> {
            Ok(true)
        }
        fn txn_commit_final(&mut self, txn_id: u64) -> Result<bool> {
            self.commits.push(txn_id);
            Ok(true)
        }
        fn txn_store(
            &mut self,
            txn_id: u64,
            index_id: u64,
            key: &[u8],
            value: Option<&[u8]>,
        ) -> Result<bool> {
            self.txn_stores
                .push((txn_id, index_id, key.to_vec(), value.map(|v| v.to_vec())));
            Ok(true)
        }
        fn txn_store_commit_final(
            &mut self,
            txn_id: u64,
            index_id: u64,
            key: &[u8],
            value: Option<&[u8]>,
        ) -> Result<bool> {
            self.txn_store(txn_id, index_id, key, value)?;
            self.commits.push(txn_id);
            Ok(true)
        }
    }

    #[test]
    fn write_replay_roundtrip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("redo.log");

        let mut log = RedoLog::create(&path).unwrap();
        log.store(7, b"alpha", Some(b"one")).unwrap();
        log.txn_enter(42).unwrap();
        log.txn_store(42, 7, b"beta", Some(b"two")).unwrap();
        log.txn_store(42, 7, b"alpha", None).unwrap();
        log.txn_commit_final(42).unwrap();
        log.sync().unwrap();
        drop(log);

        let mut recorder = Recorder::default();
        RedoReader::open(&path)
            .unwrap()
            .replay(&mut recorder)
            .unwrap();

        assert_eq!(recorder.timestamps, 1);
        assert_eq!(recorder.stores.len(), 1);
        assert_eq!(recorder.stores[0].1, b"alpha");
        assert_eq!(recorder.txn_stores.len(), 2);
        assert_eq!(recorder.txn_stores[1].3, None); // delete records no value
        assert_eq!(recorder.commits, vec![42]);
    }

    #[test]
    fn torn_tail_stops_replay_cleanly() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("redo.log");

        let mut log = RedoLog::create(&path).unwrap();
        log.store(1, b"good", Some(b"record")).unwrap();
        log.store(1, b"torn", Some(b"record")).unwrap();
        log.sync().unwrap();
        drop(log);

        // chop a few bytes off the final record
        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();
        drop(file);

        let mut recorder = Recorder::default();
        let applied = RedoReader::open(&path)
            .unwrap()
            .replay(&mut recorder)
            .unwrap();
        assert_eq!(recorder.stores.len(), 1);
        assert!(applied >= 1);
    }
}
