use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Destination of the received blocks.
///
/// Writes are synchronous; the transfer loop calls into the sink between
/// datagrams and never holds it across an await.
pub trait BlockSink {
    /// Write one block payload and return how many bytes were accepted.
    /// A count below `buf.len()` means the medium is full.
    fn write_block(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn flush(&mut self) -> io::Result<()>;

    /// Make the completed upload visible under its final name.
    fn publish(&mut self) -> io::Result<()>;

    /// Drop whatever was written so far.
    fn discard(&mut self) -> io::Result<()>;
}

/// Suffix of the staging file an upload is written to before the rename.
pub const STAGING_SUFFIX: &str = ".upload";

pub fn staging_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

/// Buffered file written as `<target>.upload` and renamed to `<target>`
/// once the last block arrived.
#[derive(Debug)]
pub struct StagedFile {
    writer: Option<BufWriter<File>>,
    target: PathBuf,
    staging: PathBuf,
    keep_partial: bool,
    finished: bool,
}

impl StagedFile {
    /// Create (or truncate) the staging file for `target`.
    pub fn create(target: PathBuf, keep_partial: bool) -> io::Result<Self> {
        let staging = staging_path(&target);
        let file = File::create(&staging)?;
        debug!("Staging upload at {}", staging.display());

        Ok(Self {
            writer: Some(BufWriter::new(file)),
            target,
            staging,
            keep_partial,
            finished: false,
        })
    }

    pub fn staging(&self) -> &Path {
        &self.staging
    }

    fn writer(&mut self) -> io::Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| io::Error::other("staged file already closed"))
    }
}

impl BlockSink for StagedFile {
    fn write_block(&mut self, buf: &[u8]) -> io::Result<usize> {
        let writer = self.writer()?;
        let mut written = 0;
        while written < buf.len() {
            match writer.write(&buf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer()?.flush()
    }

    fn publish(&mut self) -> io::Result<()> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| io::Error::other("staged file already closed"))?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&self.staging, &self.target)?;
        self.finished = true;
        debug!(
            "Renamed {} to {}",
            self.staging.display(),
            self.target.display()
        );
        Ok(())
    }

    fn discard(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.writer = None;

        if self.keep_partial {
            debug!("Keeping partial upload {}", self.staging.display());
            return Ok(());
        }

        match std::fs::remove_file(&self.staging) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if let Err(e) = self.discard() {
            warn!(
                "Failed to remove staged upload {}: {}",
                self.staging.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_name_appends_suffix() {
        assert_eq!(
            staging_path(Path::new("/srv/tftp/fw.bin")),
            PathBuf::from("/srv/tftp/fw.bin.upload")
        );
    }

    #[test]
    fn publish_renames_into_place() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("a.bin");
        let mut sink = StagedFile::create(target.clone(), false)?;

        assert_eq!(sink.write_block(b"hello ")?, 6);
        assert_eq!(sink.write_block(b"world")?, 5);
        assert!(sink.staging().exists());
        assert!(!target.exists());

        sink.flush()?;
        sink.publish()?;
        drop(sink);

        assert_eq!(std::fs::read(&target)?, b"hello world");
        assert!(!staging_path(&target).exists());
        Ok(())
    }

    #[test]
    fn discard_removes_staging_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("a.bin");
        let mut sink = StagedFile::create(target.clone(), false)?;
        sink.write_block(b"partial")?;
        sink.discard()?;

        assert!(!sink.staging().exists());
        assert!(!target.exists());
        Ok(())
    }

    #[test]
    fn keep_partial_leaves_staging_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("a.bin");
        let mut sink = StagedFile::create(target.clone(), true)?;
        sink.write_block(b"partial")?;
        sink.discard()?;

        assert_eq!(std::fs::read(staging_path(&target))?, b"partial");
        Ok(())
    }

    #[test]
    fn drop_without_publish_cleans_up() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("a.bin");
        {
            let mut sink = StagedFile::create(target.clone(), false)?;
            sink.write_block(b"x")?;
        }
        assert!(!staging_path(&target).exists());
        Ok(())
    }

    #[test]
    fn writes_after_publish_fail() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let mut sink = StagedFile::create(dir.path().join("a.bin"), false)?;
        sink.publish()?;
        assert!(sink.write_block(b"late").is_err());
        Ok(())
    }
}
