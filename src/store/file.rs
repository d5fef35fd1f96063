use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::store::{PageId, PageStore, MAX_PAGE_ID, NO_PAGE};

const CHECKSUM_SIZE: usize = 4;
const MAGIC: [u8; 8] = *b"MRTNKV01";
const VERSION: u16 = 1;
// magic + version + page_size + free_list_head + page_count + metadata length
const HEADER_FIXED_SIZE: usize = 8 + 2 + 4 + 8 + 8 + 2;

/// Default `PageStore` over a single file.
///
/// Page 0 is the header page: a crc32-checksummed record of the file shape,
/// the free-list head and an opaque metadata blob. Page 1 is the reserved
/// stub id and is never touched. Freed pages form a linked list threaded
/// through their own first 8 bytes.
pub struct FilePageStore {
    path: PathBuf,
    page_size: usize,
    read_only: bool,
    inner: Mutex<Inner>,
}

struct Inner {
    file: File,
    free_head: PageId,
    page_count: u64,
    metadata: Vec<u8>,
}

impl FilePageStore {
    pub fn create<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() && path.metadata()?.len() > 0 {
            return Err(Error::Storage(format!("file already exists: {path:?}")));
        }
        if page_size < CHECKSUM_SIZE + HEADER_FIXED_SIZE {
            return Err(Error::Storage("page size too small for header".into()));
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let store = Self {
            path,
            page_size,
            read_only: false,
            inner: Mutex::new(Inner {
                file,
                free_head: NO_PAGE,
                // Pages 0 (header) and 1 (stub) are reserved.
                page_count: 2,
                metadata: Vec::new(),
            }),
        };
        {
            let mut inner = store.inner.lock();
            store.write_header_locked(&mut inner)?;
            inner.file.sync_all()?;
        }
        Ok(store)
    }

    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(Error::Storage(format!("file not found: {path:?}")));
        }

        let mut file = if read_only {
            OpenOptions::new().read(true).open(&path)?
        } else {
            OpenOptions::new().read(true).write(true).open(&path)?
        };

        let mut prefix = vec![0u8; CHECKSUM_SIZE + HEADER_FIXED_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut prefix)
            .map_err(|_| Error::Storage("file too small to contain header".into()))?;

        let mut rdr = std::io::Cursor::new(&prefix[CHECKSUM_SIZE..]);
        let mut magic = [0u8; 8];
        rdr.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(Error::Storage("invalid file magic".into()));
        }
        let version = rdr.read_u16::<LittleEndian>()?;
        if version != VERSION {
            return Err(Error::Storage(format!("unsupported version: {version}")));
        }
        let page_size = rdr.read_u32::<LittleEndian>()? as usize;
        if page_size < CHECKSUM_SIZE + HEADER_FIXED_SIZE {
            return Err(Error::Storage("corrupt header page size".into()));
        }

        // Re-read the whole header page to verify its checksum and pull the
        // metadata blob.
        file.seek(SeekFrom::Start(0))?;
        let mut page0 = vec![0u8; page_size];
        file.read_exact(&mut page0)
            .map_err(|_| Error::Storage("short read on header page".into()))?;

        let mut rdr = std::io::Cursor::new(&page0);
        let stored_checksum = rdr.read_u32::<LittleEndian>()?;
        if crc32(&page0[CHECKSUM_SIZE..]) != stored_checksum {
            return Err(Error::Storage("header checksum mismatch".into()));
        }
        rdr.seek(SeekFrom::Start((CHECKSUM_SIZE + 8 + 2 + 4) as u64))?;
        let free_head = rdr.read_u64::<LittleEndian>()?;
        let page_count = rdr.read_u64::<LittleEndian>()?;
        let meta_len = rdr.read_u16::<LittleEndian>()? as usize;
        let meta_start = CHECKSUM_SIZE + HEADER_FIXED_SIZE;
        if meta_start + meta_len > page_size {
            return Err(Error::Storage("corrupt header metadata length".into()));
        }
        let metadata = page0[meta_start..meta_start + meta_len].to_vec();

        Ok(Self {
            path,
            page_size,
            read_only,
            inner: Mutex::new(Inner {
                file,
                free_head,
                page_count: page_count.max(2),
                metadata,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_header_locked(&self, inner: &mut Inner) -> Result<()> {
        let mut payload = vec![0u8; self.page_size - CHECKSUM_SIZE];
        {
            let mut w = std::io::Cursor::new(&mut payload[..]);
            w.write_all(&MAGIC)?;
            w.write_u16::<LittleEndian>(VERSION)?;
            w.write_u32::<LittleEndian>(self.page_size as u32)?;
            w.write_u64::<LittleEndian>(inner.free_head)?;
            w.write_u64::<LittleEndian>(inner.page_count)?;
            let meta_cap = self.page_size - CHECKSUM_SIZE - HEADER_FIXED_SIZE;
            if inner.metadata.len() > meta_cap {
                return Err(Error::Storage(format!(
                    "metadata too large for header page: {} > {meta_cap}",
                    inner.metadata.len()
                )));
            }
            w.write_u16::<LittleEndian>(inner.metadata.len() as u16)?;
            w.write_all(&inner.metadata)?;
        }

        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_u32::<LittleEndian>(crc32(&payload))?;
        inner.file.write_all(&payload)?;
        inner.file.flush()?;
        Ok(())
    }

    fn check_id(&self, id: PageId, inner: &Inner) -> Result<()> {
        if id < 2 || id >= inner.page_count {
            return Err(Error::Storage(format!(
                "page id {id} out of range (page count {})",
                inner.page_count
            )));
        }
        Ok(())
    }
}

impl PageStore for FilePageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u64 {
        self.inner.lock().page_count
    }

    fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        let mut inner = self.inner.lock();
        self.check_id(id, &inner)?;
        let offset = id * self.page_size as u64;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner
            .file
            .read_exact(buf)
            .map_err(|_| Error::Storage(format!("short read for page {id}")))?;
        Ok(())
    }

    fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let mut inner = self.inner.lock();
        self.check_id(id, &inner)?;
        let offset = id * self.page_size as u64;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(buf)?;
        Ok(())
    }

    fn allocate_page(&self) -> Result<PageId> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let mut inner = self.inner.lock();
        if inner.free_head != NO_PAGE {
            let id = inner.free_head;
            // The freed page's first 8 bytes hold the next free id.
            let offset = id * self.page_size as u64;
            inner.file.seek(SeekFrom::Start(offset))?;
            inner.free_head = inner.file.read_u64::<LittleEndian>()?;
            return Ok(id);
        }
        let id = inner.page_count;
        if id > MAX_PAGE_ID {
            return Err(Error::Storage("page id space exhausted".into()));
        }
        inner.page_count += 1;
        // Extend the file so later reads of this page cannot hit EOF.
        let end = inner.page_count * self.page_size as u64;
        inner.file.set_len(end)?;
        Ok(id)
    }

    fn free_page(&self, id: PageId) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let mut inner = self.inner.lock();
        self.check_id(id, &inner)?;
        let offset = id * self.page_size as u64;
        let head = inner.free_head;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_u64::<LittleEndian>(head)?;
        inner.free_head = id;
        Ok(())
    }

    fn sync(&self, metadata: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if !self.read_only {
            self.write_header_locked(&mut inner)?;
        }
        if metadata {
            inner.file.sync_all()?;
        } else {
            inner.file.sync_data()?;
        }
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read_metadata(&self) -> Result<Vec<u8>> {
        Ok(self.inner.lock().metadata.clone())
    }

    fn write_metadata(&self, bytes: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let meta_cap = self.page_size - CHECKSUM_SIZE - HEADER_FIXED_SIZE;
        if bytes.len() > meta_cap {
            return Err(Error::Storage(format!(
                "metadata too large for header page: {} > {meta_cap}",
                bytes.len()
            )));
        }
        self.inner.lock().metadata = bytes.to_vec();
        Ok(())
    }
}

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}
