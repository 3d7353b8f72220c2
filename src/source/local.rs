//! Local-file byte source: direct positioned reads.

use std::fs::File;
use std::path::{Path, PathBuf};

use super::{check_range, ByteSource};
use crate::error::Result;

pub struct LocalSource {
    file: File,
    path: PathBuf,
    size: u64,
}

impl LocalSource {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        Ok(LocalSource { file, path, size })
    }
}

impl ByteSource for LocalSource {
    #[cfg(unix)]
    fn read_at(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;
        check_range(offset, length, self.size, &self.path)?;
        let mut buf = vec![0u8; length as usize];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    #[cfg(windows)]
    fn read_at(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        use std::os::windows::fs::FileExt;
        check_range(offset, length, self.size, &self.path)?;
        let mut buf = vec![0u8; length as usize];
        let mut done = 0usize;
        while done < buf.len() {
            let n = self.file.seek_read(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            done += n;
        }
        Ok(buf)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.size)
    }
}
