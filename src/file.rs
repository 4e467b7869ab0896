use crate::fs::FsError;
use crate::param::NFILE;
use crate::spinlock::SpinLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    None,
    Console,
}

/// File metadata protected by the table-wide spinlock
#[derive(Debug, Clone, Copy)]
struct FileMeta {
    ref_count: usize,
    readable: bool,
    writeable: bool,
    r#type: FileType,
}

impl FileMeta {
    const EMPTY: Self = Self {
        ref_count: 0,
        readable: false,
        writeable: false,
        r#type: FileType::None,
    };
}

/// Open file table shared by every process
#[derive(Debug)]
pub struct FileTable {
    meta: SpinLock<[FileMeta; NFILE]>,
}

/// File handle, just an index into the [`FileTable`]
///
/// Each handle owns one reference. Copies are made with [`FileTable::dup`] and given back with
/// [`FileTable::close`].
#[derive(Debug, PartialEq, Eq)]
pub struct File {
    id: usize,
}

impl FileTable {
    pub const fn new() -> Self {
        Self {
            meta: SpinLock::new([FileMeta::EMPTY; NFILE], "filetable"),
        }
    }

    /// Allocates a file structure.
    pub fn alloc(
        &self,
        r#type: FileType,
        readable: bool,
        writeable: bool,
    ) -> Result<File, FsError> {
        let mut meta = self.meta.lock();

        for (id, meta) in meta.iter_mut().enumerate() {
            if meta.ref_count == 0 {
                *meta = FileMeta {
                    ref_count: 1,
                    readable,
                    writeable,
                    r#type,
                };

                return Ok(File { id });
            }
        }

        err!(FsError::OutOfFile)
    }

    /// Increments the reference count for the file.
    pub fn dup(&self, file: &File) -> File {
        let meta = &mut self.meta.lock()[file.id];

        assert!(meta.ref_count >= 1, "filedup");
        meta.ref_count += 1;

        File { id: file.id }
    }

    /// Decrements the reference count and closes the file if it reaches 0.
    pub fn close(&self, file: File) {
        let meta = &mut self.meta.lock()[file.id];

        assert!(meta.ref_count >= 1, "fileclose");

        meta.ref_count -= 1;
        if meta.ref_count == 0 {
            *meta = FileMeta::EMPTY;
        }
    }

    pub fn ref_count(&self, file: &File) -> usize {
        self.meta.lock()[file.id].ref_count
    }

    pub fn file_type(&self, file: &File) -> FileType {
        self.meta.lock()[file.id].r#type
    }

    pub fn is_readable(&self, file: &File) -> bool {
        self.meta.lock()[file.id].readable
    }

    pub fn is_writeable(&self, file: &File) -> bool {
        self.meta.lock()[file.id].writeable
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}
