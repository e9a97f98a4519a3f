//! Single-segment I/O primitives: raw and gzip-compressed, both directions.
//!
//! Raw transfers loop on short reads and writes with explicit offset
//! tracking. Compressed files carry a fixed header ([`CompressedHeader`])
//! followed by a standard gzip stream over the full segment; the header is
//! rewritten after the stream so it always reflects the final size and CRC.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;

use crc32fast::Hasher;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::header::{CompressedHeader, HeaderError, SEGMENT_FILE_HEADER_LEN};

/// Chunk size for streaming through the gzip codec.
pub const CHUNK_BYTES: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("zero-length transfer")]
    ZeroLength,
    #[error("declared segment size {declared} does not match target size {expected}")]
    SizeMismatch { declared: u64, expected: u64 },
    #[error("compressed stream ended after {inflated} of {declared} bytes")]
    TruncatedStream { inflated: u64, declared: u64 },
    #[error("compressed stream continues past the declared {declared} bytes")]
    TrailingData { declared: u64 },
    #[error("stream CRC {computed:#010x} does not match header CRC {stored:#010x}")]
    CrcMismatch { computed: u32, stored: u32 },
}

/// CRC32 of a byte range, streamed in chunks.
pub fn crc32_of(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    for chunk in bytes.chunks(CHUNK_BYTES) {
        hasher.update(chunk);
    }
    hasher.finalize()
}

/// Writes a full segment to `file` starting at offset 0.
pub fn write_raw(file: &File, data: &[u8], with_crc: bool) -> Result<Option<u32>, TransferError> {
    if data.is_empty() {
        return Err(TransferError::ZeroLength);
    }
    let mut hasher = with_crc.then(Hasher::new);
    let mut offset = 0u64;
    let mut remaining = data;
    while !remaining.is_empty() {
        match file.write_at(remaining, offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(written) => {
                if let Some(hasher) = hasher.as_mut() {
                    hasher.update(&remaining[..written]);
                }
                offset += written as u64;
                remaining = &remaining[written..];
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(hasher.map(Hasher::finalize))
}

/// Reads a full segment from `file` starting at offset 0.
pub fn read_raw(file: &File, data: &mut [u8], with_crc: bool) -> Result<Option<u32>, TransferError> {
    if data.is_empty() {
        return Err(TransferError::ZeroLength);
    }
    let mut hasher = with_crc.then(Hasher::new);
    let mut offset = 0u64;
    let mut filled = 0usize;
    while filled < data.len() {
        match file.read_at(&mut data[filled..], offset) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
            Ok(read) => {
                if let Some(hasher) = hasher.as_mut() {
                    hasher.update(&data[filled..filled + read]);
                }
                offset += read as u64;
                filled += read;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(hasher.map(Hasher::finalize))
}

/// Writes a compressed segment file: fixed header, then a gzip stream over
/// the full segment. Returns the CRC32 of the uncompressed data, which is
/// also recorded in the header.
pub fn write_compressed(file: &mut File, data: &[u8]) -> Result<u32, TransferError> {
    if data.is_empty() {
        return Err(TransferError::ZeroLength);
    }
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&[0u8; SEGMENT_FILE_HEADER_LEN])?;

    let mut hasher = Hasher::new();
    let mut encoder = GzEncoder::new(BufWriter::new(&mut *file), Compression::fast());
    for chunk in data.chunks(CHUNK_BYTES) {
        hasher.update(chunk);
        encoder.write_all(chunk)?;
    }
    encoder.finish()?.flush()?;

    let crc = hasher.finalize();
    let header = CompressedHeader::new(data.len() as u64, crc);
    file.write_all_at(&header.encode(), 0)?;
    Ok(crc)
}

/// Reads a compressed segment file into `data`, which must be exactly the
/// segment size the header declares.
pub fn read_compressed(
    file: &mut File,
    data: &mut [u8],
    with_crc: bool,
) -> Result<Option<u32>, TransferError> {
    let header = read_file_header(file)?;
    if header.segment_size != data.len() as u64 {
        return Err(TransferError::SizeMismatch {
            declared: header.segment_size,
            expected: data.len() as u64,
        });
    }
    let mut decoder = GzDecoder::new(BufReader::new(&mut *file));
    let mut hasher = with_crc.then(Hasher::new);
    let mut filled = 0usize;
    while filled < data.len() {
        let window = (data.len() - filled).min(CHUNK_BYTES);
        match decoder.read(&mut data[filled..filled + window]) {
            Ok(0) => {
                return Err(TransferError::TruncatedStream {
                    inflated: filled as u64,
                    declared: header.segment_size,
                })
            }
            Ok(read) => {
                if let Some(hasher) = hasher.as_mut() {
                    hasher.update(&data[filled..filled + read]);
                }
                filled += read;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    let mut probe = [0u8; 1];
    if decoder.read(&mut probe)? != 0 {
        return Err(TransferError::TrailingData {
            declared: header.segment_size,
        });
    }
    let computed = hasher.map(Hasher::finalize);
    if let Some(computed) = computed {
        if computed != header.crc32 {
            return Err(TransferError::CrcMismatch {
                computed,
                stored: header.crc32,
            });
        }
    }
    Ok(computed)
}

/// Validates and returns the fixed header of a compressed segment file,
/// leaving the file cursor at the start of the gzip stream.
pub fn read_file_header(file: &mut File) -> Result<CompressedHeader, TransferError> {
    file.seek(SeekFrom::Start(0))?;
    let mut raw = [0u8; SEGMENT_FILE_HEADER_LEN];
    file.read_exact(&mut raw)?;
    Ok(CompressedHeader::decode(&raw)?)
}

/// Inflates at most `max_bytes` of the leading stream of a compressed
/// segment file. Used to read embedded names without inflating the whole
/// segment.
pub fn inflate_prefix(file: &mut File, max_bytes: usize) -> Result<Vec<u8>, TransferError> {
    read_file_header(file)?;
    let decoder = GzDecoder::new(BufReader::new(&mut *file));
    let mut prefix = Vec::new();
    decoder.take(max_bytes as u64).read_to_end(&mut prefix)?;
    Ok(prefix)
}

/// Applies the stored `(uid, gid, mode)` to a written segment file.
pub fn apply_file_identity(file: &File, uid: u32, gid: u32, mode: u32) -> io::Result<()> {
    let fd = file.as_raw_fd();
    if unsafe { libc::fchown(fd, uid, gid) } != 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fchmod(fd, (mode & 0o7777) as libc::mode_t) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
