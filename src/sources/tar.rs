//! Chunk source over a (possibly gzip-member) USTAR archive.
//!
//! The archive is indexed once at construction: each 512-byte header is
//! parsed for its name, octal size and typeflag, directories and the
//! reserved `LICENSE` entry are skipped, and every regular file becomes one
//! chunk. Entries whose name ends in `.gz` are gunzipped on read.

use crate::source::ChunkSource;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use tracing::{info, warn};

const TAR_BLOCK: u64 = 512;
const NAME_LEN: usize = 100;
const SIZE_OFFSET: usize = 124;
const SIZE_LEN: usize = 12;
const TYPEFLAG_OFFSET: usize = 156;

struct TarEntry {
    offset: u64,
    size: u64,
    is_gzipped: bool,
}

/// One tar archive as a chunk source; one regular file entry per chunk.
pub struct TarChunkSource {
    file: File,
    name: String,
    entries: Vec<TarEntry>,
}

impl TarChunkSource {
    /// Opens and indexes the archive. Truncated archives index the readable
    /// prefix with a warning; only failing to open the file is an error.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let entries = index_archive(&mut file, &name)?;
        info!(entries = entries.len(), archive = %name, "indexed tar archive");
        Ok(Self {
            file,
            name,
            entries,
        })
    }
}

fn index_archive(file: &mut File, archive: &str) -> io::Result<Vec<TarEntry>> {
    let file_len = file.metadata()?.len();
    let mut entries = Vec::new();
    let mut offset = 0u64;
    let mut header = [0u8; TAR_BLOCK as usize];

    loop {
        file.seek(SeekFrom::Start(offset))?;
        if file.read_exact(&mut header).is_err() {
            warn!(archive, "truncated tar archive");
            break;
        }
        if header[0] == 0 {
            break; // zero-filled name terminates the archive
        }

        let size = parse_octal(&header[SIZE_OFFSET..SIZE_OFFSET + SIZE_LEN]);
        let data_offset = offset + TAR_BLOCK;
        let next = data_offset + (size + TAR_BLOCK - 1) / TAR_BLOCK * TAR_BLOCK;
        let entry_name = header_name(&header);
        if next > file_len {
            warn!(archive, entry = %entry_name, size, "truncated tar entry");
            break;
        }
        offset = next;

        match header[TYPEFLAG_OFFSET] {
            b'5' => continue, // directory
            b'0' => {}        // regular file
            other => {
                warn!(archive, typeflag = other, "unsupported tar header type");
                continue;
            }
        }

        if Path::new(&entry_name).file_name() == Some(std::ffi::OsStr::new("LICENSE")) {
            continue;
        }
        entries.push(TarEntry {
            offset: data_offset,
            size,
            is_gzipped: entry_name.ends_with(".gz"),
        });
    }
    Ok(entries)
}

fn header_name(header: &[u8]) -> String {
    let name = &header[..NAME_LEN];
    let end = name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    String::from_utf8_lossy(&name[..end]).into_owned()
}

fn parse_octal(field: &[u8]) -> u64 {
    let mut value = 0u64;
    for &digit in field {
        match digit {
            b'0'..=b'7' => value = (value << 3) + u64::from(digit - b'0'),
            b' ' => continue,
            _ => break, // NUL padding
        }
    }
    value
}

impl ChunkSource for TarChunkSource {
    fn sort_key(&self) -> String {
        self.name.clone()
    }

    fn chunk_count(&self) -> usize {
        self.entries.len()
    }

    fn chunk_data(&mut self, index: usize) -> Option<Vec<u8>> {
        let entry = self.entries.get(index)?;
        if self.file.seek(SeekFrom::Start(entry.offset)).is_err() {
            return None;
        }
        let mut content = vec![0u8; entry.size as usize];
        if self.file.read_exact(&mut content).is_err() {
            warn!(archive = %self.name, index, "short read from tar entry");
            return None;
        }
        if entry.is_gzipped {
            let mut decoded = Vec::new();
            match GzDecoder::new(content.as_slice()).read_to_end(&mut decoded) {
                Ok(_) => Some(decoded),
                Err(_) => None,
            }
        } else {
            Some(content)
        }
    }

    fn chunk_prefix(&mut self, index: usize, max_bytes: usize) -> Option<Vec<u8>> {
        let entry = self.entries.get(index)?;
        if max_bytes == 0 {
            return Some(Vec::new());
        }
        if self.file.seek(SeekFrom::Start(entry.offset)).is_err() {
            return None;
        }

        if !entry.is_gzipped {
            let to_read = (entry.size as usize).min(max_bytes);
            let mut content = vec![0u8; to_read];
            if self.file.read_exact(&mut content).is_err() {
                return None;
            }
            return Some(content);
        }

        // Stream the decoder so only enough compressed input is consumed to
        // produce max_bytes of output.
        let limited = (&mut self.file).take(entry.size);
        let mut decoder = GzDecoder::new(limited);
        let mut out = Vec::with_capacity(max_bytes);
        let mut buf = [0u8; 16 * 1024];
        while out.len() < max_bytes {
            let want = buf.len().min(max_bytes - out.len());
            match decoder.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(read) => out.extend_from_slice(&buf[..read]),
                Err(_) => return None,
            }
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn tar_header(name: &str, size: u64, typeflag: u8) -> [u8; 512] {
        let mut header = [0u8; 512];
        header[..name.len()].copy_from_slice(name.as_bytes());
        let octal = format!("{:011o}\0", size);
        header[SIZE_OFFSET..SIZE_OFFSET + 12].copy_from_slice(octal.as_bytes());
        header[TYPEFLAG_OFFSET] = typeflag;
        header
    }

    fn append_entry(tar: &mut Vec<u8>, name: &str, data: &[u8], typeflag: u8) {
        tar.extend_from_slice(&tar_header(name, data.len() as u64, typeflag));
        tar.extend_from_slice(data);
        let padding = (512 - data.len() % 512) % 512;
        tar.extend_from_slice(&vec![0u8; padding]);
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn write_tar(tar: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(tar).unwrap();
        // End-of-archive marker: two zero blocks.
        file.write_all(&[0u8; 1024]).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_indexes_regular_files_and_skips_noise() {
        let a = b"first entry".to_vec();
        let b = b"second entry, somewhat longer".to_vec();
        let mut tar = Vec::new();
        append_entry(&mut tar, "games/", &[], b'5'); // directory
        append_entry(&mut tar, "games/a.bin", &a, b'0');
        append_entry(&mut tar, "LICENSE", b"MIT", b'0'); // reserved name
        append_entry(&mut tar, "games/b.bin", &b, b'0');
        let file = write_tar(&tar);

        let mut source = TarChunkSource::open(file.path()).unwrap();
        assert_eq!(source.chunk_count(), 2);
        assert_eq!(source.chunk_data(0).unwrap(), a);
        assert_eq!(source.chunk_data(1).unwrap(), b);
        assert!(source.chunk_data(2).is_none());
    }

    #[test]
    fn test_gzipped_entries_are_decoded() {
        let payload: Vec<u8> = (0..u8::MAX).cycle().take(5000).collect();
        let mut tar = Vec::new();
        append_entry(&mut tar, "games/c.bin.gz", &gzip(&payload), b'0');
        let file = write_tar(&tar);

        let mut source = TarChunkSource::open(file.path()).unwrap();
        assert_eq!(source.chunk_count(), 1);
        assert_eq!(source.chunk_data(0).unwrap(), payload);
    }

    #[test]
    fn test_chunk_prefix_plain_and_gzipped() {
        let payload: Vec<u8> = (0..u8::MAX).cycle().take(4096).collect();
        let mut tar = Vec::new();
        append_entry(&mut tar, "plain.bin", &payload, b'0');
        append_entry(&mut tar, "packed.bin.gz", &gzip(&payload), b'0');
        let file = write_tar(&tar);

        let mut source = TarChunkSource::open(file.path()).unwrap();
        assert_eq!(source.chunk_prefix(0, 100).unwrap(), &payload[..100]);
        assert_eq!(source.chunk_prefix(1, 100).unwrap(), &payload[..100]);
        assert_eq!(source.chunk_prefix(1, 0).unwrap(), Vec::<u8>::new());
        // Asking for more than the entry holds returns the whole entry.
        assert_eq!(source.chunk_prefix(0, 1 << 20).unwrap(), payload);
    }

    #[test]
    fn test_truncated_archive_indexes_prefix() {
        let a = b"complete".to_vec();
        let mut tar = Vec::new();
        append_entry(&mut tar, "ok.bin", &a, b'0');
        // A header promising more data than the file holds.
        tar.extend_from_slice(&tar_header("cut.bin", 4096, b'0'));
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&tar).unwrap();
        file.flush().unwrap();

        let mut source = TarChunkSource::open(file.path()).unwrap();
        assert_eq!(source.chunk_count(), 1);
        assert_eq!(source.chunk_data(0).unwrap(), a);
    }

    #[test]
    fn test_corrupt_gzip_is_unavailable() {
        let mut tar = Vec::new();
        append_entry(&mut tar, "bad.bin.gz", b"not actually gzip data", b'0');
        let file = write_tar(&tar);

        let mut source = TarChunkSource::open(file.path()).unwrap();
        assert_eq!(source.chunk_count(), 1);
        assert!(source.chunk_data(0).is_none());
    }

    #[test]
    fn test_sort_key_is_archive_file_name() {
        let file = write_tar(&Vec::new());
        let source = TarChunkSource::open(file.path()).unwrap();
        assert_eq!(
            source.sort_key(),
            file.path().file_name().unwrap().to_string_lossy()
        );
    }
}
