//! Chunking: split a file into fixed-size chunks and reassemble them.

use std::io::Write;
use std::path::Path;

use crate::protocol::MAX_CHUNK_SIZE;

/// Split bytes into `MAX_CHUNK_SIZE` chunks; the last one may be shorter. Empty input yields no chunks.
pub fn split_bytes(data: &[u8]) -> Vec<Vec<u8>> {
    data.chunks(MAX_CHUNK_SIZE).map(<[u8]>::to_vec).collect()
}

/// Read a whole file and split it.
pub fn split_file(path: &Path) -> std::io::Result<Vec<Vec<u8>>> {
    let data = std::fs::read(path)?;
    Ok(split_bytes(&data))
}

/// Write chunks in order to `out`, replacing any existing file.
pub fn reassemble<'a, I>(chunks: I, out: &Path) -> std::io::Result<u64>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::io::BufWriter::new(std::fs::File::create(out)?);
    let mut written = 0u64;
    for chunk in chunks {
        file.write_all(chunk)?;
        written += chunk.len() as u64;
    }
    file.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_150000_bytes() {
        let data = vec![7u8; 150_000];
        let chunks = split_bytes(&data);
        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![64_000, 64_000, 22_000]);
    }

    #[test]
    fn split_exact_multiple() {
        let chunks = split_bytes(&vec![0u8; MAX_CHUNK_SIZE * 2]);
        assert_eq!(chunks.len(), 2);
    }

    #[test]
    fn split_empty() {
        assert!(split_bytes(&[]).is_empty());
    }

    #[test]
    fn file_split_and_reassemble() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("in.bin");
        let data: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();
        std::fs::write(&src, &data).unwrap();

        let chunks = split_file(&src).unwrap();
        assert_eq!(chunks.len(), 2);

        let out = dir.path().join("nested/out.bin");
        let n = reassemble(chunks.iter().map(Vec::as_slice), &out).unwrap();
        assert_eq!(n, 100_000);
        assert_eq!(std::fs::read(&out).unwrap(), data);
    }

    #[test]
    fn split_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(split_file(&dir.path().join("nope")).is_err());
    }
}
