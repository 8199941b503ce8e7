//! File I/O primitives (open/read/write/close, plus a gzip sniff/filter),
//! implemented directly over `std::fs::File` since `DemoSource` and
//! recording cannot function without them.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};

pub fn open_read(path: &Path) -> io::Result<File> {
    File::open(path)
}

pub fn create_write(path: &Path) -> io::Result<File> {
    File::create(path)
}

/// A demo/recording input, transparently gzip-decompressed if
/// [`DemoReader::sniff_gzip`] detected the gzip magic.
pub enum DemoReader {
    Plain(File),
    Gzip(Box<GzDecoder<File>>),
}

impl DemoReader {
    /// Opens `path`, peeks its first 4 bytes, and installs a gzip filter if
    /// the low 3 bytes match the gzip magic (0x1F 0x8B 0x08), rewinding
    /// first so the filter sees the whole file.
    pub fn open_with_gzip_sniff(path: &Path) -> io::Result<Self> {
        let mut file = open_read(path)?;
        let mut probe = [0u8; 4];
        file.read_exact(&mut probe)?;
        let is_gzip = probe[0] == 0x1F && probe[1] == 0x8B && probe[2] == 0x08;
        file.seek(SeekFrom::Start(0))?;
        if is_gzip {
            Ok(Self::Gzip(Box::new(GzDecoder::new(file))))
        } else {
            Ok(Self::Plain(file))
        }
    }
}

impl Read for DemoReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(f) => f.read(buf),
            Self::Gzip(g) => g.read(buf),
        }
    }
}

/// A demo/recording output, optionally gzip-compressed.
pub enum DemoWriter {
    Plain(File),
    Gzip(Box<GzEncoder<File>>),
}

impl DemoWriter {
    pub fn create(path: &Path, gzip: bool) -> io::Result<Self> {
        let file = create_write(path)?;
        Ok(if gzip {
            Self::Gzip(Box::new(GzEncoder::new(file, Compression::default())))
        } else {
            Self::Plain(file)
        })
    }
}

impl Write for DemoWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(f) => f.write(buf),
            Self::Gzip(g) => g.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(f) => f.flush(),
            Self::Gzip(g) => g.flush(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn plain_file_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("plain.mvd2");
        {
            let mut w = DemoWriter::create(&path, false).unwrap();
            w.write_all(b"MVD2hello").unwrap();
        }
        let mut r = DemoReader::open_with_gzip_sniff(&path).unwrap();
        let mut contents = Vec::new();
        r.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"MVD2hello");
    }

    #[test]
    fn gzip_file_round_trips_transparently() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gz.mvd2.gz");
        {
            let mut w = DemoWriter::create(&path, true).unwrap();
            w.write_all(b"MVD2hello-compressed").unwrap();
        }
        let mut r = DemoReader::open_with_gzip_sniff(&path).unwrap();
        let mut contents = Vec::new();
        r.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"MVD2hello-compressed");
    }
}
