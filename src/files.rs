use crate::metainfo::FilePlan;
use anyhow::Context;
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// A contiguous run of bytes inside one backing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSlice {
    /// Index into the file set.
    pub file: usize,
    /// Offset within that file.
    pub offset: u64,
    pub length: u64,
}

struct Backing {
    plan: FilePlan,
    handle: File,
}

/// The logical payload range `[0, size)` mapped onto one or more files on
/// disk. Callers address the payload as a single flat range; reads and
/// writes that span file boundaries are split here.
pub struct FileSet {
    backings: Vec<Backing>,
    size: u64,
}

impl FileSet {
    /// Opens (creating as needed, intermediate directories included) every
    /// file of the plan under `download_path` and sizes it to its declared
    /// length. Allocation is sparse where the filesystem allows it.
    pub fn create(download_path: &Path, files: &[FilePlan]) -> anyhow::Result<FileSet> {
        let mut backings = Vec::with_capacity(files.len());
        for plan in files {
            let full = download_path.join(&plan.path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&full)
                .with_context(|| format!("failed to open {}", full.display()))?;
            let on_disk = handle
                .metadata()
                .with_context(|| format!("failed to stat {}", full.display()))?
                .len();
            if on_disk != plan.length {
                handle
                    .set_len(plan.length)
                    .with_context(|| format!("failed to size {}", full.display()))?;
            }
            debug!("opened {} ({} bytes)", full.display(), plan.length);
            backings.push(Backing {
                plan: plan.clone(),
                handle,
            });
        }
        let size = backings.iter().map(|b| b.plan.length).sum();
        Ok(FileSet { backings, size })
    }

    /// Total payload bytes across all files.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Splits a payload extent into per-file slices. Zero-length files never
    /// contribute a slice. The extent must lie within `[0, size)`.
    pub fn map_extent(&self, offset: u64, length: u64) -> Vec<FileSlice> {
        assert!(
            offset + length <= self.size,
            "extent {}+{} outside payload of {} bytes",
            offset,
            length,
            self.size
        );
        let mut slices = Vec::new();
        let mut remaining = length;
        let mut at = offset;
        for (index, backing) in self.backings.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            let file_start = backing.plan.offset;
            let file_end = file_start + backing.plan.length;
            if at >= file_end || backing.plan.length == 0 {
                continue;
            }
            let within = at - file_start;
            let take = remaining.min(backing.plan.length - within);
            slices.push(FileSlice {
                file: index,
                offset: within,
                length: take,
            });
            at += take;
            remaining -= take;
        }
        slices
    }

    /// Reads `length` bytes at `offset` of the flat payload range.
    pub fn read(&mut self, offset: u64, length: u64) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; length as usize];
        let mut at = 0usize;
        for slice in self.map_extent(offset, length) {
            let end = at + slice.length as usize;
            self.read_slice(&slice, &mut buf[at..end])?;
            at = end;
        }
        Ok(buf)
    }

    /// Writes `data` at `offset` of the flat payload range.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut at = 0usize;
        for slice in self.map_extent(offset, data.len() as u64) {
            let end = at + slice.length as usize;
            self.write_slice(&slice, &data[at..end])?;
            at = end;
        }
        Ok(())
    }

    /// Reads one file slice into `buf`, which must be exactly `slice.length` long.
    pub fn read_slice(&mut self, slice: &FileSlice, buf: &mut [u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len() as u64, slice.length);
        let backing = &mut self.backings[slice.file];
        backing.handle.seek(SeekFrom::Start(slice.offset))?;
        backing.handle.read_exact(buf)
    }

    /// Writes `data` at one file slice; `data` must be exactly `slice.length` long.
    pub fn write_slice(&mut self, slice: &FileSlice, data: &[u8]) -> io::Result<()> {
        debug_assert_eq!(data.len() as u64, slice.length);
        let backing = &mut self.backings[slice.file];
        backing.handle.seek(SeekFrom::Start(slice.offset))?;
        backing.handle.write_all(data)
    }
}
