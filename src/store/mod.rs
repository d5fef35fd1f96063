//! Durable page storage: fixed-size pages addressed densely by id.

mod file;

pub use file::FilePageStore;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// 48-bit page identifier. Id 0 means "unassigned"; id 1 is a reserved stub
/// page that is never read or written.
pub type PageId = u64;

pub const NO_PAGE: PageId = 0;
pub const STUB_PAGE: PageId = 1;

/// Highest representable page id (6 significant bytes).
pub const MAX_PAGE_ID: PageId = (1 << 48) - 1;

/// Block I/O of fixed-size pages, given a page index.
///
/// Implementations must be safe to call from multiple threads; the engine
/// issues concurrent reads and writes for distinct pages.
pub trait PageStore: Send + Sync {
    fn page_size(&self) -> usize;

    fn page_count(&self) -> u64;

    /// Read page `id` into `buf` (`buf.len() == page_size()`).
    fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()>;

    /// Write page `id` from `buf` (`buf.len() == page_size()`).
    fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()>;

    /// Allocate a fresh page id, recycling freed pages first.
    fn allocate_page(&self) -> Result<PageId>;

    /// Return a page id to the free pool.
    fn free_page(&self, id: PageId) -> Result<()>;

    /// Durably flush written pages; when `metadata` is set, also flush file
    /// metadata (size, allocation state).
    fn sync(&self, metadata: bool) -> Result<()>;

    fn is_read_only(&self) -> bool;

    /// Opaque engine metadata persisted alongside the pages (index catalog,
    /// checkpoint roots). Capacity is implementation-defined but at least
    /// half a page.
    fn read_metadata(&self) -> Result<Vec<u8>>;

    fn write_metadata(&self, bytes: &[u8]) -> Result<()>;
}

/// Page-granular cipher. `encrypt_page` must write into a buffer distinct
/// from the plaintext: the plaintext page may be mutated concurrently by
/// latch holders, so in-place encryption would tear.
pub trait PageCipher: Send + Sync {
    fn encrypt_page(&self, id: PageId, plain: &[u8], out: &mut [u8]);

    fn decrypt_page(&self, id: PageId, buf: &mut [u8]);
}

/// Wraps a store so pages are encrypted at rest. Decrypts after read,
/// encrypts into a fresh scratch buffer before write.
pub struct CryptoPageStore<S, C> {
    inner: S,
    cipher: C,
    scratch: Mutex<Vec<Vec<u8>>>,
}

impl<S: PageStore, C: PageCipher> CryptoPageStore<S, C> {
    pub fn new(inner: S, cipher: C) -> Self {
        Self {
            inner,
            cipher,
            scratch: Mutex::new(Vec::new()),
        }
    }

    fn take_scratch(&self) -> Vec<u8> {
        self.scratch
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.page_size()])
    }

    fn put_scratch(&self, buf: Vec<u8>) {
        let mut pool = self.scratch.lock();
        if pool.len() < 4 {
            pool.push(buf);
        }
    }
}

impl<S: PageStore, C: PageCipher> PageStore for CryptoPageStore<S, C> {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn page_count(&self) -> u64 {
        self.inner.page_count()
    }

    fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()> {
        self.inner.read_page(id, buf)?;
        self.cipher.decrypt_page(id, buf);
        Ok(())
    }

    fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()> {
        let mut scratch = self.take_scratch();
        scratch.resize(buf.len(), 0);
        self.cipher.encrypt_page(id, buf, &mut scratch);
        let result = self.inner.write_page(id, &scratch);
        self.put_scratch(scratch);
        result
    }

    fn allocate_page(&self) -> Result<PageId> {
        self.inner.allocate_page()
    }

    fn free_page(&self, id: PageId) -> Result<()> {
        self.inner.free_page(id)
    }

    fn sync(&self, metadata: bool) -> Result<()> {
        self.inner.sync(metadata)
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    fn read_metadata(&self) -> Result<Vec<u8>> {
        self.inner.read_metadata()
    }

    fn write_metadata(&self, bytes: &[u8]) -> Result<()> {
        self.inner.write_metadata(bytes)
    }
}

/// Non-durable store backed by a vector of pages. Used by tests and by
/// callers that want a purely in-memory database.
pub struct MemPageStore {
    page_size: usize,
    state: Mutex<MemState>,
}

struct MemState {
    pages: Vec<Option<Box<[u8]>>>,
    free: Vec<PageId>,
    metadata: Vec<u8>,
}

impl MemPageStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            // Pages 0 and 1 are reserved (header, stub).
            state: Mutex::new(MemState {
                pages: vec![None, None],
                free: Vec::new(),
                metadata: Vec::new(),
            }),
        }
    }
}

impl PageStore for MemPageStore {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> u64 {
        self.state.lock().pages.len() as u64
    }

    fn read_page(&self, id: PageId, buf: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        match state.pages.get(id as usize) {
            Some(Some(page)) => {
                buf.copy_from_slice(page);
                Ok(())
            }
            _ => Err(Error::Storage(format!("read of unallocated page {id}"))),
        }
    }

    fn write_page(&self, id: PageId, buf: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state
            .pages
            .get_mut(id as usize)
            .ok_or_else(|| Error::Storage(format!("write of unallocated page {id}")))?;
        *slot = Some(buf.to_vec().into_boxed_slice());
        Ok(())
    }

    fn allocate_page(&self) -> Result<PageId> {
        let mut state = self.state.lock();
        if let Some(id) = state.free.pop() {
            return Ok(id);
        }
        let id = state.pages.len() as PageId;
        if id > MAX_PAGE_ID {
            return Err(Error::Storage("page id space exhausted".into()));
        }
        state.pages.push(None);
        Ok(id)
    }

    fn free_page(&self, id: PageId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(slot) = state.pages.get_mut(id as usize) {
            *slot = None;
        }
        state.free.push(id);
        Ok(())
    }

    fn sync(&self, _metadata: bool) -> Result<()> {
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn read_metadata(&self) -> Result<Vec<u8>> {
        Ok(self.state.lock().metadata.clone())
    }

    fn write_metadata(&self, bytes: &[u8]) -> Result<()> {
        self.state.lock().metadata = bytes.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct XorCipher(u8);

    impl PageCipher for XorCipher {
        fn encrypt_page(&self, _id: PageId, plain: &[u8], out: &mut [u8]) {
            for (o, p) in out.iter_mut().zip(plain) {
                *o = p ^ self.0;
            }
        }

        fn decrypt_page(&self, _id: PageId, buf: &mut [u8]) {
            for b in buf.iter_mut() {
                *b ^= self.0;
            }
        }
    }

    #[test]
    fn crypto_store_roundtrips_and_scrambles_at_rest() {
        let inner = MemPageStore::new(512);
        let id = inner.allocate_page().unwrap();
        let store = CryptoPageStore::new(inner, XorCipher(0x5a));

        let page = vec![7u8; 512];
        store.write_page(id, &page).unwrap();

        let mut back = vec![0u8; 512];
        store.read_page(id, &mut back).unwrap();
        assert_eq!(back, page);
    }

    #[test]
    fn mem_store_recycles_freed_pages() {
        let store = MemPageStore::new(512);
        let a = store.allocate_page().unwrap();
        let b = store.allocate_page().unwrap();
        assert_ne!(a, b);
        store.free_page(a).unwrap();
        assert_eq!(store.allocate_page().unwrap(), a);
    }
}
