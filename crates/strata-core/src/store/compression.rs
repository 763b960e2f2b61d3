//! Transparent gzip streaming for artifacts.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

/// File extension marking a gzip-compressed artifact.
pub const GZIP_EXTENSION: &str = "gz";

/// First two bytes of every gzip member.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Whether the path carries the gzip extension.
pub fn is_gzip_path(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == GZIP_EXTENSION)
}

/// Whether the bytes start with the gzip magic number.
pub fn has_gzip_magic(bytes: &[u8]) -> bool {
    bytes.len() >= GZIP_MAGIC.len() && bytes[..GZIP_MAGIC.len()] == GZIP_MAGIC
}

/// Writer that optionally compresses what passes through it.
pub enum ArtifactWriter {
    /// Bytes land on disk unchanged.
    Plain(BufWriter<File>),
    /// Bytes are gzip-compressed on the way to disk.
    Gzip(GzEncoder<BufWriter<File>>),
}

impl ArtifactWriter {
    /// Wrap a file, compressing if requested.
    pub fn new(file: File, compressed: bool) -> Self {
        let inner = BufWriter::new(file);
        if compressed {
            ArtifactWriter::Gzip(GzEncoder::new(inner, Compression::default()))
        } else {
            ArtifactWriter::Plain(inner)
        }
    }

    /// Flush the compressor trailer and buffers, returning the file.
    pub fn finish(self) -> io::Result<File> {
        let buffered = match self {
            ArtifactWriter::Plain(w) => w,
            ArtifactWriter::Gzip(encoder) => encoder.finish()?,
        };
        buffered.into_inner().map_err(|e| e.into_error())
    }
}

impl Write for ArtifactWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ArtifactWriter::Plain(w) => w.write(buf),
            ArtifactWriter::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ArtifactWriter::Plain(w) => w.flush(),
            ArtifactWriter::Gzip(w) => w.flush(),
        }
    }
}

/// Open a reader over an artifact, decompressing when the extension or the
/// leading bytes say it is gzip.
pub fn open_reader(path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
    let mut reader = BufReader::new(File::open(path)?);
    let compressed = is_gzip_path(path) || has_gzip_magic(reader.fill_buf()?);
    if compressed {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(reader))))
    } else {
        Ok(Box::new(reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_gzip_detection() {
        assert!(is_gzip_path(Path::new("backup_1.jsonl.gz")));
        assert!(!is_gzip_path(Path::new("backup_1.jsonl")));
        assert!(has_gzip_magic(&[0x1f, 0x8b, 0x08]));
        assert!(!has_gzip_magic(b"{\"kind\""));
        assert!(!has_gzip_magic(&[0x1f]));
    }

    #[test]
    fn test_compressed_file_without_extension_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.bin");

        let mut writer = ArtifactWriter::new(File::create(&path).unwrap(), true);
        writer.write_all(b"line one\nline two\n").unwrap();
        writer.finish().unwrap();

        let raw = std::fs::read(&path).unwrap();
        assert!(has_gzip_magic(&raw));

        let mut content = String::new();
        open_reader(&path).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "line one\nline two\n");
    }

    #[test]
    fn test_plain_file_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.jsonl");

        let mut writer = ArtifactWriter::new(File::create(&path).unwrap(), false);
        writer.write_all(b"plain\n").unwrap();
        writer.finish().unwrap();

        let mut content = String::new();
        open_reader(&path).unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "plain\n");
    }
}
