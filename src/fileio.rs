use crate::netascii::{self, Decoder};
use crate::packet::TransferMode;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::mem;
use std::path::{Component, Path, PathBuf};

/// Filesystem seam between the protocol engine and the outside world.
/// `FSAdapter` is the real thing; tests substitute an in-memory map, and
/// embedders can layer buffering or quotas the same way.
pub trait IOAdapter {
    type R: Read + Sized;
    type W: Write + Sized;
    fn exists(&self, path: &Path) -> bool;
    fn open_read(&self, path: &Path) -> io::Result<(Self::R, Option<u64>)>;
    fn create_new(&mut self, path: &Path, len: Option<u64>) -> io::Result<Self::W>;
}

/// `IOAdapter` over the actual filesystem.
#[derive(Default)]
pub struct FSAdapter;

impl IOAdapter for FSAdapter {
    type R = File;
    type W = File;
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
    fn open_read(&self, path: &Path) -> io::Result<(File, Option<u64>)> {
        let f = File::open(path)?;
        let len = f.metadata().ok().map(|meta| meta.len());
        Ok((f, len))
    }
    fn create_new(&mut self, path: &Path, len: Option<u64>) -> io::Result<File> {
        let f = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        if let Some(l) = len {
            f.set_len(l)?;
        }
        Ok(f)
    }
}

/// Resolves a request filename against the server root without touching the
/// filesystem: `..` and `.` components are folded away lexically, then the
/// result must still be a descendant of the root. `root` must be absolute.
pub fn resolve_under_root(root: &Path, filename: &str) -> Option<PathBuf> {
    let joined = root.join(filename);
    let mut resolved = PathBuf::new();
    for comp in joined.components() {
        match comp {
            Component::ParentDir => {
                resolved.pop();
            }
            Component::CurDir => {}
            other => resolved.push(other),
        }
    }
    if resolved.starts_with(root) && resolved.as_path() != root {
        Some(resolved)
    } else {
        None
    }
}

/// Mode-aware block reader: "fill up to N bytes". In netascii mode the
/// expansion can overshoot the requested size; the suffix is carried and
/// prepended to the next fill, so EOF is reached only when the inner
/// reader is dry and the carry is empty.
pub struct BlockSource<R: Read> {
    inner: R,
    mode: TransferMode,
    carry: Vec<u8>,
    eof: bool,
}

impl<R: Read> BlockSource<R> {
    pub fn new(inner: R, mode: TransferMode) -> Self {
        Self {
            inner,
            mode,
            carry: Vec::new(),
            eof: false,
        }
    }

    /// Returns up to `n` bytes; strictly fewer means end of stream.
    pub fn fill(&mut self, n: usize) -> io::Result<Vec<u8>> {
        match self.mode {
            TransferMode::Octet => {
                let mut block = Vec::with_capacity(n);
                self.inner
                    .by_ref()
                    .take(n as u64)
                    .read_to_end(&mut block)?;
                Ok(block)
            }
            TransferMode::Netascii => {
                while self.carry.len() < n && !self.eof {
                    let mut raw = vec![0; n - self.carry.len()];
                    match self.inner.read(&mut raw) {
                        Ok(0) => self.eof = true,
                        Ok(amt) => {
                            for &b in &raw[..amt] {
                                netascii::encode_byte(b, &mut self.carry);
                            }
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e),
                    }
                }
                let tail = self.carry.split_off(n.min(self.carry.len()));
                Ok(mem::replace(&mut self.carry, tail))
            }
        }
    }
}

/// Mode-aware block writer. In netascii mode incoming blocks are decoded
/// back to native form; a CR split across two blocks is handled by the
/// decoder's carry.
pub struct BlockSink<W: Write> {
    inner: W,
    mode: TransferMode,
    decoder: Decoder,
}

impl<W: Write> BlockSink<W> {
    pub fn new(inner: W, mode: TransferMode) -> Self {
        Self {
            inner,
            mode,
            decoder: Decoder::new(),
        }
    }

    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match self.mode {
            TransferMode::Octet => self.inner.write_all(data),
            TransferMode::Netascii => {
                let mut native = Vec::with_capacity(data.len());
                self.decoder
                    .push(data, &mut native)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                self.inner.write_all(&native)
            }
        }
    }

    /// Flushes the sink; called once after the final block.
    pub fn finish(&mut self) -> io::Result<()> {
        self.decoder
            .finish()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn sandbox_allows_plain_names() {
        let root = Path::new("/srv/tftp");
        assert_eq!(
            resolve_under_root(root, "hello.txt"),
            Some(PathBuf::from("/srv/tftp/hello.txt"))
        );
        assert_eq!(
            resolve_under_root(root, "sub/dir/file.bin"),
            Some(PathBuf::from("/srv/tftp/sub/dir/file.bin"))
        );
    }

    #[test]
    fn sandbox_folds_dot_components() {
        let root = Path::new("/srv/tftp");
        assert_eq!(
            resolve_under_root(root, "./a/./b"),
            Some(PathBuf::from("/srv/tftp/a/b"))
        );
        assert_eq!(
            resolve_under_root(root, "a/../b.txt"),
            Some(PathBuf::from("/srv/tftp/b.txt"))
        );
    }

    #[test]
    fn sandbox_rejects_escape() {
        let root = Path::new("/srv/tftp");
        assert_eq!(resolve_under_root(root, "../etc/passwd"), None);
        assert_eq!(resolve_under_root(root, "a/../../../etc/passwd"), None);
        assert_eq!(resolve_under_root(root, ".."), None);
    }

    #[test]
    fn sandbox_rejects_foreign_absolute_paths() {
        let root = Path::new("/srv/tftp");
        assert_eq!(resolve_under_root(root, "/etc/passwd"), None);
        // absolute but inside the root is acceptable
        assert_eq!(
            resolve_under_root(root, "/srv/tftp/ok.txt"),
            Some(PathBuf::from("/srv/tftp/ok.txt"))
        );
    }

    #[test]
    fn sandbox_rejects_the_root_itself() {
        let root = Path::new("/srv/tftp");
        assert_eq!(resolve_under_root(root, "."), None);
        assert_eq!(resolve_under_root(root, "a/.."), None);
    }

    #[test]
    fn octet_source_reads_exact_blocks() {
        let mut src = BlockSource::new(Cursor::new(vec![7u8; 1024]), TransferMode::Octet);
        assert_eq!(src.fill(512).unwrap().len(), 512);
        assert_eq!(src.fill(512).unwrap().len(), 512);
        assert_eq!(src.fill(512).unwrap().len(), 0);
    }

    #[test]
    fn netascii_source_carries_overflow() {
        // 4 input bytes expand to 8 wire bytes; with a block size of 3 the
        // expansion straddles every boundary
        let mut src = BlockSource::new(Cursor::new(b"\n\n\r\r".to_vec()), TransferMode::Netascii);
        let mut wire = vec![];
        loop {
            let block = src.fill(3).unwrap();
            let len = block.len();
            wire.extend(block);
            if len < 3 {
                break;
            }
        }
        assert_eq!(wire, b"\r\n\r\n\r\0\r\0");
    }

    #[test]
    fn netascii_source_eof_requires_empty_carry() {
        let mut src = BlockSource::new(Cursor::new(b"a\n".to_vec()), TransferMode::Netascii);
        // expansion is "a\r\n": first fill of 2 leaves one byte carried
        assert_eq!(src.fill(2).unwrap(), b"a\r");
        assert_eq!(src.fill(2).unwrap(), b"\n");
    }

    #[test]
    fn netascii_sink_decodes_across_blocks() {
        let mut out = vec![];
        {
            let mut sink = BlockSink::new(&mut out, TransferMode::Netascii);
            sink.write(b"one\r").unwrap();
            sink.write(b"\ntwo\r").unwrap();
            sink.write(b"\0").unwrap();
            sink.finish().unwrap();
        }
        assert_eq!(out, b"one\ntwo\r");
    }

    #[test]
    fn netascii_sink_rejects_bare_cr() {
        let mut out = vec![];
        let mut sink = BlockSink::new(&mut out, TransferMode::Netascii);
        let err = sink.write(b"a\rb").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn netascii_sink_rejects_trailing_cr_on_finish() {
        let mut out = vec![];
        let mut sink = BlockSink::new(&mut out, TransferMode::Netascii);
        sink.write(b"a\r").unwrap();
        let err = sink.finish().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
