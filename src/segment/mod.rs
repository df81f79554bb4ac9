//! Memory-mapped segment holding the header, resource pool and named objects.
//!
//! A segment is one fixed-size backing file mapped read-write by every
//! participant. Nothing inside it is addressed by pointer: every reference is
//! an offset from the base of the mapping, resolved on access, so processes
//! can map the same file at different addresses.
//!
//! # Named objects
//!
//! Objects are looked up by a name of at most 31 bytes through the
//! [`NamedObject`] trait. Lookups take `&self`: the process-local name index
//! is behind a lock, so a read-only caller can search the directory without
//! needing mutable access. Creation is serialized within the process by an
//! allocation lock and across processes by the single-owner file lock.

pub mod directory;
pub mod header;
pub mod layout;

use std::fs::{self, File, OpenOptions};
use std::io;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};

use crate::config::{validate_key, MvccConfig};
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::pool::{FreeList, ReaderToken, ResourcePool, WriterToken, READER_LIMIT, WRITER_LIMIT};
use directory::{DirEntry, Directory, DirectoryIndex};
use header::{Header, HEADER_SIZE};
use layout::{align_up, ControlBlock, Layout, CONTROL_OFFSET, REGION_ALIGN};

/// A typed object that can live under a name in the segment.
pub trait NamedObject<'a>: Sized {
    /// Construction parameters
    type Params;

    /// Tag stored in the directory, checked on every lookup.
    fn type_tag() -> u64;

    /// Bytes to allocate for a new object.
    fn size_for(params: &Self::Params) -> usize;

    /// Initializes freshly allocated, zero-filled memory at `offset`.
    fn init(segment: &'a Segment, offset: u64, params: &Self::Params) -> Result<()>;

    /// Attaches to an existing object at `offset`.
    fn attach(segment: &'a Segment, offset: u64) -> Result<Self>;
}

pub struct Segment {
    path: PathBuf,
    _file: File,
    mmap: MmapMut,
    base: NonNull<u8>,
    len: usize,
    layout: Layout,
    index: RwLock<DirectoryIndex>,
    alloc_lock: Mutex<()>,
}

// All shared state in the mapping is accessed through atomics or under the
// per-object sharable mutex.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Creates the backing file if it is absent or empty, otherwise opens and
    /// validates it. The caller proves it holds the owner lock.
    pub fn create_or_open(config: &MvccConfig, _lock: &FileLock) -> Result<Self> {
        config.validate()?;
        let path = config.path.as_path();

        let exists = match fs::metadata(path) {
            Ok(meta) => meta.len() > 0,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(Error::io(path, "stat", e)),
        };

        if exists {
            Self::open_existing(path)
        } else {
            Self::create(config)
        }
    }

    fn create(config: &MvccConfig) -> Result<Self> {
        let path = config.path.as_path();
        let layout = Layout::new(config.reader_limit, config.directory_capacity);
        if config.size < layout.min_size() {
            return Err(Error::InvalidConfig(format!(
                "size {} is below the {} bytes needed for the fixed regions",
                config.size,
                layout.min_size()
            )));
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::io(path, "create", e))?;

        file.set_len(config.size as u64)
            .map_err(|e| Error::io(path, "size", e))?;

        let mmap = unsafe { MmapMut::map_mut(&file).map_err(|e| Error::io(path, "map", e))? };
        let segment = Self::from_parts(path, file, mmap, layout);

        let control = segment.control();
        control
            .segment_size
            .store(config.size as u64, Ordering::Relaxed);
        control
            .reader_capacity
            .store(layout.reader_capacity as u64, Ordering::Relaxed);
        control
            .directory_capacity
            .store(layout.directory_capacity as u64, Ordering::Relaxed);
        control
            .heap_offset
            .store(layout.heap as u64, Ordering::Relaxed);
        control
            .alloc_cursor
            .store(layout.heap as u64, Ordering::Relaxed);
        segment.pool().init();

        // The header goes in last so a half-built file never validates
        let header = Header::new().encode()?;
        unsafe {
            std::ptr::copy_nonoverlapping(header.as_ptr(), segment.ptr(0), header.len());
        }
        segment.flush()?;

        tracing::info!(
            path = %path.display(),
            size = config.size,
            reader_limit = layout.reader_capacity,
            directory_capacity = layout.directory_capacity,
            "Created segment"
        );
        Ok(segment)
    }

    /// Opens a segment created earlier, validating its header and layout.
    /// Nothing is written to the file before validation succeeds.
    pub fn open_existing(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::io(path, "open", e))?;

        let len = file
            .metadata()
            .map_err(|e| Error::io(path, "stat", e))?
            .len() as usize;
        if len < CONTROL_OFFSET + size_of::<ControlBlock>() {
            return Err(Error::malformed(
                path,
                "segment",
                format!("file of {} bytes is too small", len),
            ));
        }

        let mmap = unsafe { MmapMut::map_mut(&file).map_err(|e| Error::io(path, "map", e))? };

        let header = Header::try_from(&mmap[..HEADER_SIZE])
            .map_err(|_| Error::malformed(path, "header", "truncated header"))?;
        header.validate(path)?;

        let control = unsafe { &*(mmap.as_ptr().add(CONTROL_OFFSET) as *const ControlBlock) };
        let reader_capacity = control.reader_capacity.load(Ordering::Acquire) as usize;
        let directory_capacity = control.directory_capacity.load(Ordering::Acquire) as usize;
        let segment_size = control.segment_size.load(Ordering::Acquire) as usize;
        let heap_offset = control.heap_offset.load(Ordering::Acquire) as usize;
        let cursor = control.alloc_cursor.load(Ordering::Acquire) as usize;

        if reader_capacity == 0 || reader_capacity > READER_LIMIT {
            return Err(Error::malformed(
                path,
                "resource pool",
                format!("reader capacity {} out of range", reader_capacity),
            ));
        }
        if directory_capacity == 0 || directory_capacity > u32::MAX as usize {
            return Err(Error::malformed(
                path,
                "directory",
                format!("directory capacity {} out of range", directory_capacity),
            ));
        }
        if segment_size != len {
            return Err(Error::malformed(
                path,
                "segment",
                format!("recorded size {} but file is {} bytes", segment_size, len),
            ));
        }
        let layout = Layout::new(reader_capacity, directory_capacity);
        if layout.heap != heap_offset || layout.heap > len {
            return Err(Error::malformed(path, "segment", "layout does not match file"));
        }
        if cursor < heap_offset || cursor > len {
            return Err(Error::malformed(path, "segment", "allocation cursor out of bounds"));
        }

        let segment = Self::from_parts(path, file, mmap, layout);
        tracing::debug!(path = %path.display(), size = len, "Opened segment");
        Ok(segment)
    }

    fn from_parts(path: &Path, file: File, mut mmap: MmapMut, layout: Layout) -> Self {
        let len = mmap.len();
        let base = NonNull::new(mmap.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Segment {
            path: path.to_path_buf(),
            _file: file,
            mmap,
            base,
            len,
            layout,
            index: RwLock::new(DirectoryIndex::default()),
            alloc_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Bytes still available to the bump allocator.
    pub fn available_space(&self) -> usize {
        let cursor = self.control().alloc_cursor.load(Ordering::Acquire) as usize;
        self.len.saturating_sub(cursor)
    }

    pub fn control(&self) -> &ControlBlock {
        unsafe { &*(self.ptr(CONTROL_OFFSET) as *const ControlBlock) }
    }

    pub fn pool(&self) -> ResourcePool<'_> {
        let layout = &self.layout;
        unsafe {
            ResourcePool {
                reader_tokens: self.slice::<ReaderToken>(layout.reader_tokens, layout.reader_capacity),
                writer_tokens: self.slice::<WriterToken>(layout.writer_tokens, WRITER_LIMIT),
                reader_free_list: FreeList::new(
                    self.slice::<AtomicU64>(
                        layout.reader_bitmap,
                        FreeList::words_for(layout.reader_capacity),
                    ),
                    layout.reader_capacity,
                ),
                writer_free_list: FreeList::new(
                    self.slice::<AtomicU64>(layout.writer_bitmap, FreeList::words_for(WRITER_LIMIT)),
                    WRITER_LIMIT,
                ),
            }
        }
    }

    pub fn directory(&self) -> Directory<'_> {
        let entries =
            unsafe { self.slice::<DirEntry>(self.layout.directory, self.layout.directory_capacity) };
        Directory::new(entries, &self.control().directory_len)
    }

    /// Looks up a named object without creating it.
    pub fn find<'a, T: NamedObject<'a>>(&'a self, name: &str) -> Result<Option<T>> {
        match self.lookup(name)? {
            Some((tag, offset)) => self.attach::<T>(name, tag, offset).map(Some),
            None => Ok(None),
        }
    }

    /// Resolves a name to its directory type tag and offset.
    pub fn lookup(&self, name: &str) -> Result<Option<(u64, u64)>> {
        validate_key(name)?;

        {
            let index = self.index.read();
            if let Some(entry) = index.get(name) {
                return Ok(Some(entry));
            }
            if index.is_current(&self.directory()) {
                return Ok(None);
            }
        }

        let mut index = self.index.write();
        index.refresh(&self.directory());
        Ok(index.get(name))
    }

    /// Looks up a named object, constructing it on first use.
    pub fn find_or_create<'a, T: NamedObject<'a>>(
        &'a self,
        name: &str,
        params: &T::Params,
    ) -> Result<T> {
        if let Some(object) = self.find::<T>(name)? {
            return Ok(object);
        }

        let _guard = self.alloc_lock.lock();
        // Re-check under the lock in case another thread created it
        if let Some(object) = self.find::<T>(name)? {
            return Ok(object);
        }

        let directory = self.directory();
        if directory.len() >= directory.capacity() {
            return Err(Error::exhausted(&self.path, "directory entries"));
        }

        let offset = self.allocate_locked(T::size_for(params), REGION_ALIGN)?;
        T::init(self, offset, params)?;
        directory
            .append(name, T::type_tag(), offset)
            .ok_or_else(|| Error::exhausted(&self.path, "directory entries"))?;
        self.index.write().refresh(&directory);

        tracing::debug!(path = %self.path.display(), name, offset, "Created named object");
        T::attach(self, offset)
    }

    fn attach<'a, T: NamedObject<'a>>(&'a self, name: &str, tag: u64, offset: u64) -> Result<T> {
        if tag != T::type_tag() {
            return Err(Error::malformed(
                &self.path,
                "directory",
                format!("object {:?} has a different type", name),
            ));
        }
        T::attach(self, offset)
    }

    /// Reserves `size` bytes from the heap.
    pub(crate) fn allocate(&self, size: usize, align: usize) -> Result<u64> {
        let _guard = self.alloc_lock.lock();
        self.allocate_locked(size, align)
    }

    fn allocate_locked(&self, size: usize, align: usize) -> Result<u64> {
        let control = self.control();
        let cursor = control.alloc_cursor.load(Ordering::Acquire) as usize;
        let start = align_up(cursor, align);
        let end = start
            .checked_add(size)
            .ok_or_else(|| Error::exhausted(&self.path, "segment space"))?;
        if end > self.len {
            tracing::warn!(
                path = %self.path.display(),
                requested = size,
                available = self.available_space(),
                "Segment out of space"
            );
            return Err(Error::exhausted(&self.path, "segment space"));
        }
        control.alloc_cursor.store(end as u64, Ordering::Release);
        Ok(start as u64)
    }

    /// Fails with `MalformedDb` unless `[offset, offset + len)` lies in the
    /// heap. Offsets read from the file go through this before use.
    pub(crate) fn check_range(&self, offset: u64, len: usize, component: &'static str) -> Result<()> {
        let start = offset as usize;
        match start.checked_add(len) {
            Some(end) if start >= self.layout.heap && end <= self.len => Ok(()),
            _ => Err(Error::malformed(
                &self.path,
                component,
                format!("offset {} length {} outside the heap", offset, len),
            )),
        }
    }

    pub(crate) fn ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.len);
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// # Safety
    /// `offset` must be aligned for `T` and the object must lie in the mapping.
    pub(crate) unsafe fn object<T>(&self, offset: u64) -> &T {
        &*(self.ptr(offset as usize) as *const T)
    }

    unsafe fn slice<T>(&self, offset: usize, count: usize) -> &[T] {
        std::slice::from_raw_parts(self.ptr(offset) as *const T, count)
    }

    /// Synchronously writes the mapping back to the backing store.
    pub fn flush(&self) -> Result<()> {
        self.mmap
            .flush()
            .map_err(|e| Error::io(&self.path, "flush", e))
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("available", &self.available_space())
            .finish()
    }
}
