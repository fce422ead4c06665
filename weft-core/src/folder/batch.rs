//! Buffering of index updates between flushes through a caller-supplied
//! sink.

use weft_model::FileInfo;

use crate::error::Result;

/// Flush when the buffered entry count reaches this.
pub(crate) const MAX_BATCH_FILES: usize = 1000;
/// Flush when the approximate buffered metadata weight reaches this.
pub(crate) const MAX_BATCH_BYTES: usize = 1 << 20;

/// Accumulates index entries and pushes them through `flush` in bounded
/// batches. Flush errors propagate to the caller, which must unwind the
/// producing side safely.
pub(crate) struct UpdateBatch<'a> {
    files: Vec<FileInfo>,
    bytes: usize,
    flush: Box<dyn FnMut(Vec<FileInfo>) -> Result<()> + Send + 'a>,
}

impl<'a> UpdateBatch<'a> {
    pub(crate) fn new(
        flush: impl FnMut(Vec<FileInfo>) -> Result<()> + Send + 'a,
    ) -> Self {
        Self {
            files: Vec::new(),
            bytes: 0,
            flush: Box::new(flush),
        }
    }

    pub(crate) fn append(&mut self, file: FileInfo) {
        self.bytes += file.weight();
        self.files.push(file);
    }

    fn is_full(&self) -> bool {
        self.files.len() >= MAX_BATCH_FILES || self.bytes >= MAX_BATCH_BYTES
    }

    pub(crate) fn flush_if_full(&mut self) -> Result<()> {
        if self.is_full() {
            return self.flush();
        }
        Ok(())
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        if self.files.is_empty() {
            return Ok(());
        }
        self.bytes = 0;
        (self.flush)(std::mem::take(&mut self.files))
    }
}

impl std::fmt::Debug for UpdateBatch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateBatch")
            .field("files", &self.files.len())
            .field("bytes", &self.bytes)
            .finish()
    }
}
