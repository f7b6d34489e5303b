//! Walks a directory tree and encodes it as a tar stream.
//!
//! The walk is depth-first pre-order with siblings sorted by file name, so the same tree always
//! produces the same archive.  File content is copied straight from the file into the writer;
//! at no point is more than one entry's worth of data held in memory.

use std::{
    fs::{File, Metadata},
    io::{self, Read, Write},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use log::debug;
use tar::{Builder, EntryType, Header};
use walkdir::WalkDir;

use crate::{
    policy::{Decision, EntryPolicy},
    Error, Result,
};

/// One filesystem node as it is about to be written into the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDescriptor {
    pub absolute_path: PathBuf,
    pub emitted_name: PathBuf,
    pub is_dir: bool,
    pub size: u64,
    pub mtime: u64,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
}

impl EntryDescriptor {
    fn header(&self) -> Header {
        let mut header = Header::new_ustar();
        header.set_entry_type(if self.is_dir {
            EntryType::Directory
        } else {
            EntryType::Regular
        });
        header.set_size(self.size);
        header.set_mode(self.mode);
        header.set_mtime(self.mtime);
        header.set_uid(self.uid);
        header.set_gid(self.gid);
        header
    }
}

/// Counters reported once a tree has been encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeStats {
    /// Entries written into the archive.
    pub entries: u64,
    /// Entries dropped by the policy or skipped as unsupported.
    pub skipped: u64,
    /// Bytes of file content written (without headers and padding).
    pub content_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct TarEncoder {
    root: PathBuf,
    policy: EntryPolicy,
}

impl TarEncoder {
    /// The root is taken from the policy's base directory so the two can never disagree.
    pub fn new(policy: EntryPolicy) -> Self {
        Self {
            root: policy.base_dir().to_path_buf(),
            policy,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Encodes the whole tree into `writer`, including the end-of-archive marker, and flushes
    /// it.
    ///
    /// This blocks on filesystem reads and on `writer`, so call it from a blocking context.
    /// On error, whatever was written so far stays in `writer` and no end-of-archive marker
    /// follows it, so the archive is visibly truncated.
    pub fn encode<W: Write>(&self, writer: W) -> Result<EncodeStats> {
        let mut builder = Builder::new(TransportWriter::new(writer));
        let mut stats = EncodeStats::default();

        if let Err(err) = self.append_tree(&mut builder, &mut stats) {
            // Builder's Drop would otherwise write the end-of-archive marker.
            builder.get_mut().abandon();
            return Err(err);
        }

        let mut writer = builder
            .into_inner()
            .map_err(|err| Error::from_io(&self.root, err))?;
        writer
            .flush()
            .map_err(|err| Error::from_io(&self.root, err))?;

        Ok(stats)
    }

    fn append_tree<W: Write>(
        &self,
        builder: &mut Builder<W>,
        stats: &mut EncodeStats,
    ) -> Result<()> {
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name();

        for entry in walker {
            let entry = entry.map_err(|err| {
                let path = err.path().unwrap_or(&self.root).to_path_buf();
                Error::from_io(path, err.into())
            })?;
            let path = entry.path();
            let metadata = entry
                .metadata()
                .map_err(|err| Error::from_io(path, err.into()))?;

            let file_type = metadata.file_type();
            if !file_type.is_dir() && !file_type.is_file() {
                debug!(
                    "skipping '{}': not a regular file or directory",
                    path.display()
                );
                stats.skipped += 1;
                continue;
            }

            let Some(descriptor) = self.describe(path, &metadata) else {
                stats.skipped += 1;
                continue;
            };

            self.append(builder, &descriptor)?;
            stats.entries += 1;
            stats.content_bytes += descriptor.size;
        }

        Ok(())
    }

    /// Applies the policy to one walked entry.
    pub fn describe(&self, path: &Path, metadata: &Metadata) -> Option<EntryDescriptor> {
        let is_dir = metadata.is_dir();
        match self.policy.decide(path, is_dir, metadata.mode()) {
            Decision::Excluded => None,
            Decision::Included { emitted_name, mode } => Some(EntryDescriptor {
                absolute_path: path.to_path_buf(),
                emitted_name,
                is_dir,
                size: if is_dir { 0 } else { metadata.len() },
                mtime: metadata.mtime().max(0) as u64,
                mode,
                uid: metadata.uid().into(),
                gid: metadata.gid().into(),
            }),
        }
    }

    fn append<W: Write>(
        &self,
        builder: &mut Builder<W>,
        descriptor: &EntryDescriptor,
    ) -> Result<()> {
        let path = &descriptor.absolute_path;
        let mut header = descriptor.header();

        if descriptor.is_dir {
            return builder
                .append_data(&mut header, &descriptor.emitted_name, io::empty())
                .map_err(|err| Error::from_io(path, err));
        }

        let file = File::open(path).map_err(|err| Error::from_io(path, err))?;
        let content = ExactReader::new(file, descriptor.size);
        builder
            .append_data(&mut header, &descriptor.emitted_name, content)
            .map_err(|err| Error::from_io(path, err))
    }
}

/// Tags failures of the wrapped writer as [`Error::Transport`] so they aren't mistaken for
/// read errors once they come back out of the `tar` crate.
struct TransportWriter<W> {
    inner: W,
    abandoned: bool,
}

impl<W: Write> TransportWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            abandoned: false,
        }
    }

    /// Refuse all further writes.
    fn abandon(&mut self) {
        self.abandoned = true;
    }

    fn check<T>(&self, result: io::Result<T>) -> io::Result<T> {
        result.map_err(|err| {
            if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
                err
            } else {
                let kind = err.kind();
                Error::Transport(err).into_io(kind)
            }
        })
    }
}

impl<W: Write> Write for TransportWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.abandoned {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let result = self.inner.write(buf);
        self.check(result)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.abandoned {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let result = self.inner.flush();
        self.check(result)
    }
}

/// Yields exactly `size` bytes of `inner`.
///
/// The header is written before the content is read, so a file that grows meanwhile is cut at
/// its stat size and a file that shrinks is an error rather than a short entry that would
/// misalign the rest of the archive.
struct ExactReader<R> {
    inner: io::Take<R>,
    remaining: u64,
}

impl<R: Read> ExactReader<R> {
    fn new(inner: R, size: u64) -> Self {
        Self {
            inner: inner.take(size),
            remaining: size,
        }
    }
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && self.remaining > 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("file shrank while reading, {} bytes missing", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}
