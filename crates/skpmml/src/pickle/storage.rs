//! Byte sources for pickle streams.
//!
//! A [`Storage`] remembers where the bytes live and how they are compressed.
//! Compression is detected once, by probing the leading magic bytes; every
//! call to [`Storage::object`] opens a fresh, buffered, decompressing reader.
//!
//! Recognized containers: zlib, gzip, zstd and the legacy joblib `ZF` format
//! (`ZF` + 19-byte hex length + zlib data). bz2 and xz files are rejected;
//! anything else is read as a plain stream.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

#[cfg(feature = "compression")]
use flate2::read::{MultiGzDecoder, ZlibDecoder};

/// Legacy joblib container prefix.
pub const ZFILE_PREFIX: &[u8; 2] = b"ZF";

/// Width of the hex length field following [`ZFILE_PREFIX`].
pub const ZFILE_LENGTH_WIDTH: usize = 19;

const GZIP_MAGIC: &[u8; 2] = &[0x1f, 0x8b];
const ZSTD_MAGIC: &[u8; 4] = &[0x28, 0xb5, 0x2f, 0xfd];
const BZ2_MAGIC: &[u8; 3] = b"BZh";
const XZ_MAGIC: &[u8; 6] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];

/// Bytes needed to recognize every supported container.
const PROBE_LEN: usize = 8;

/// Compression of a stored stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zlib,
    Gzip,
    Zstd,
    /// joblib < 0.10 `ZF` container around zlib data.
    JoblibZfile,
}

impl Compression {
    /// Identify the container from its leading bytes.
    pub fn detect(header: &[u8]) -> Self {
        if header.starts_with(ZFILE_PREFIX) {
            Self::JoblibZfile
        } else if header.starts_with(GZIP_MAGIC) {
            Self::Gzip
        } else if header.starts_with(ZSTD_MAGIC) {
            Self::Zstd
        } else if is_zlib_header(header) {
            Self::Zlib
        } else {
            Self::None
        }
    }
}

/// RFC 1950: deflate method, 32K window (`0x78`) and a valid header checksum.
fn is_zlib_header(header: &[u8]) -> bool {
    match header {
        [cmf, flg, ..] => *cmf == 0x78 && (u16::from(*cmf) * 256 + u16::from(*flg)) % 31 == 0,
        _ => false,
    }
}

#[derive(Debug, Clone)]
enum Source {
    File(PathBuf),
    Memory(Vec<u8>),
}

/// A pickle byte source with its detected compression.
#[derive(Debug, Clone)]
pub struct Storage {
    source: Source,
    compression: Compression,
}

impl Storage {
    /// Open a file, probing its compression.
    ///
    /// The probe handle is closed before this returns. bz2 and xz containers
    /// fail with [`io::ErrorKind::Unsupported`]. Any other probe read failure
    /// treats the file as plain and leaves reopening to [`object`](Self::object).
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let compression = match probe_file(&path) {
            Ok(compression) => compression,
            Err(err)
                if matches!(err.kind(), io::ErrorKind::NotFound | io::ErrorKind::Unsupported) =>
            {
                return Err(err)
            }
            Err(err) => {
                tracing::debug!(path = %path.display(), %err, "compression probe failed, reading plain");
                Compression::None
            }
        };
        tracing::debug!(path = %path.display(), ?compression, "opened storage");
        Ok(Self {
            source: Source::File(path),
            compression,
        })
    }

    /// Wrap an in-memory buffer, probing its compression.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let compression = Compression::detect(&bytes[..bytes.len().min(PROBE_LEN)]);
        Self {
            source: Source::Memory(bytes),
            compression,
        }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Path of a file-backed storage.
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            Source::File(path) => Some(path),
            Source::Memory(_) => None,
        }
    }

    /// Open a buffered reader over the decompressed stream.
    pub fn object(&self) -> io::Result<Box<dyn Read + '_>> {
        let raw: Box<dyn Read + '_> = match &self.source {
            Source::File(path) => Box::new(File::open(path)?),
            Source::Memory(bytes) => Box::new(bytes.as_slice()),
        };
        let decoded = decompress(raw, self.compression)?;
        Ok(Box::new(BufReader::new(decoded)))
    }
}

fn probe_file(path: &Path) -> io::Result<Compression> {
    let mut file = File::open(path)?;
    let mut header = Vec::with_capacity(PROBE_LEN);
    (&mut file).take(PROBE_LEN as u64).read_to_end(&mut header)?;
    if header.starts_with(BZ2_MAGIC) || header.starts_with(XZ_MAGIC) {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "bz2 and xz containers are not supported",
        ));
    }
    Ok(Compression::detect(&header))
}

#[cfg(feature = "compression")]
fn decompress<'a>(mut raw: Box<dyn Read + 'a>, compression: Compression) -> io::Result<Box<dyn Read + 'a>> {
    Ok(match compression {
        Compression::None => raw,
        Compression::Zlib => Box::new(ZlibDecoder::new(raw)),
        Compression::Gzip => Box::new(MultiGzDecoder::new(raw)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(raw)?),
        Compression::JoblibZfile => {
            let mut header = [0u8; ZFILE_PREFIX.len() + ZFILE_LENGTH_WIDTH];
            raw.read_exact(&mut header)?;
            Box::new(ZlibDecoder::new(raw))
        }
    })
}

#[cfg(not(feature = "compression"))]
fn decompress<'a>(raw: Box<dyn Read + 'a>, compression: Compression) -> io::Result<Box<dyn Read + 'a>> {
    match compression {
        Compression::None => Ok(raw),
        other => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("{other:?} input requires the `compression` feature"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(&[0x80, 0x04, 0x95], Compression::None)]
    #[case(&[0x78, 0x9c, 0x00], Compression::Zlib)]
    #[case(&[0x78, 0x01, 0x00], Compression::Zlib)]
    #[case(&[0x78, 0x00, 0x00], Compression::None)]
    #[case(&[0x1f, 0x8b, 0x08], Compression::Gzip)]
    #[case(&[0x28, 0xb5, 0x2f, 0xfd], Compression::Zstd)]
    #[case(b"ZF0x1a", Compression::JoblibZfile)]
    #[case(&[], Compression::None)]
    fn detect_compression(#[case] header: &[u8], #[case] expected: Compression) {
        assert_eq!(Compression::detect(header), expected);
    }

    #[test]
    fn plain_memory_storage_reads_back() {
        let storage = Storage::from_bytes(b"\x80\x02N.".to_vec());
        assert_eq!(storage.compression(), Compression::None);

        let mut bytes = Vec::new();
        storage.object().unwrap().read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"\x80\x02N.");
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Storage::open(dir.path().join("absent.pkl")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[rstest]
    #[case(b"BZh91AY&SY".as_slice())]
    #[case(&[0xfd, b'7', b'z', b'X', b'Z', 0x00, 0x00, 0x04])]
    fn bz2_and_xz_files_are_unsupported(#[case] header: &[u8]) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.pkl");
        std::fs::write(&path, header).unwrap();

        let err = Storage::open(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[cfg(feature = "compression")]
    #[test]
    fn zlib_memory_storage_decompresses() {
        use std::io::Write;

        let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"\x80\x02K\x07.").unwrap();
        let storage = Storage::from_bytes(encoder.finish().unwrap());
        assert_eq!(storage.compression(), Compression::Zlib);

        let mut bytes = Vec::new();
        storage.object().unwrap().read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"\x80\x02K\x07.");
    }
}
