//! Chunked binary image helpers shared by every persisted file.
//!
//! Layout of each file:
//! - magic: [u8;8]
//! - version: u32
//! - chunks: tag [u8;4], len u32, payload
//! - trailing `CSUM` chunk: fingerprint of every byte before it
//!
//! Bulk payloads use the V2 chunk form (LZ4 block + uncompressed length).

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

pub const PARTITION_MAGIC: &[u8; 8] = b"NCPART01";
pub const REGION_MAP_MAGIC: &[u8; 8] = b"NCREGN01";
pub const ACTIVATION_MAGIC: &[u8; 8] = b"NCACTV01";
pub const CODEBOOK_MAGIC: &[u8; 8] = b"NCCODE01";

pub const VERSION_V1: u32 = 1;
pub const VERSION_CURRENT: u32 = VERSION_V1;

pub const TAG_CHECKSUM: [u8; 4] = *b"CSUM";
const CHECKSUM_CHUNK_LEN: usize = 4 + 4 + 8;

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    // Strict format: raw LZ4 block with external expected size.
    lz4_flex::decompress(input, expected_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "lz4 decompression failed"))
}

/// Stable 64-bit fingerprint (FNV-1a with extra avalanching).
///
/// Used for checksums, byte-identical snapshot detection and partition
/// assignment, so it must never change between releases.
#[must_use]
pub fn fingerprint64(bytes: &[u8]) -> u64 {
    let mut h = 14695981039346656037u64;
    for chunk in bytes.chunks(8) {
        let mut word = [0u8; 8];
        word[..chunk.len()].copy_from_slice(chunk);
        h = mix64(h, u64::from_le_bytes(word) ^ ((chunk.len() as u64) << 56));
    }
    mix64(h, bytes.len() as u64)
}

#[inline]
#[must_use]
pub fn mix64(mut h: u64, x: u64) -> u64 {
    // FNV-1a-ish mixing
    h ^= x;
    h = h.wrapping_mul(1099511628211);
    // extra avalanching
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h
}

/// Milliseconds since the unix epoch (0 if the clock is before 1970).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

pub fn write_u16_le<W: Write>(w: &mut W, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_u64_le<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_f32_le<W: Write>(w: &mut W, v: f32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    write_len(w, bytes.len())?;
    w.write_all(bytes)
}

pub fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_bytes(w, s.as_bytes())
}

pub fn write_uuid<W: Write>(w: &mut W, id: &Uuid) -> io::Result<()> {
    w.write_all(id.as_bytes())
}

pub fn write_f32_slice<W: Write>(w: &mut W, values: &[f32]) -> io::Result<()> {
    write_len(w, values.len())?;
    for &v in values {
        write_f32_le(w, v)?;
    }
    Ok(())
}

pub fn write_len<W: Write>(w: &mut W, len: usize) -> io::Result<()> {
    let len = u32::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length exceeds u32"))?;
    write_u32_le(w, len)
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    Ok(read_exact::<1, _>(r)?[0])
}

pub fn read_u16_le<R: Read>(r: &mut R) -> io::Result<u16> {
    Ok(u16::from_le_bytes(read_exact::<2, _>(r)?))
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_u64_le<R: Read>(r: &mut R) -> io::Result<u64> {
    Ok(u64::from_le_bytes(read_exact::<8, _>(r)?))
}

pub fn read_f32_le<R: Read>(r: &mut R) -> io::Result<f32> {
    Ok(f32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_bytes<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let n = read_u32_le(r)? as usize;
    let mut buf = Vec::new();
    // `take` guards against absurd lengths in corrupt files.
    r.take(n as u64).read_to_end(&mut buf)?;
    if buf.len() != n {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated byte string",
        ));
    }
    Ok(buf)
}

pub fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let bytes = read_bytes(r)?;
    String::from_utf8(bytes)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid utf-8 string"))
}

pub fn read_uuid<R: Read>(r: &mut R) -> io::Result<Uuid> {
    Ok(Uuid::from_bytes(read_exact::<16, _>(r)?))
}

/// Read a length-prefixed f32 vector, refusing lengths above `max_len`.
pub fn read_f32_vec<R: Read>(r: &mut R, max_len: usize) -> io::Result<Vec<f32>> {
    let n = read_u32_le(r)? as usize;
    if n > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "f32 vector length out of range",
        ));
    }
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(read_f32_le(r)?);
    }
    Ok(out)
}

pub fn write_header<W: Write>(w: &mut W, magic: &[u8; 8]) -> io::Result<()> {
    w.write_all(magic)?;
    write_u32_le(w, VERSION_CURRENT)
}

pub fn read_header<R: Read>(r: &mut R, magic: &[u8; 8]) -> io::Result<()> {
    let found = read_exact::<8, _>(r)?;
    if &found != magic {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad image magic"));
    }
    let version = read_u32_le(r)?;
    if version != VERSION_CURRENT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported image version",
        ));
    }
    Ok(())
}

pub fn write_chunk<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    w.write_all(&tag)?;
    write_len(w, payload.len())?;
    w.write_all(payload)
}

/// Write a V2 chunk: payload is LZ4-compressed and preceded by the uncompressed length (u32).
///
/// Layout:
/// - tag: [u8;4]
/// - len: u32 (bytes following, including the 4-byte uncompressed length)
/// - uncompressed_len: u32
/// - compressed payload bytes
pub fn write_chunk_v2_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let uncompressed_len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk too large"))?;
    let total_len = 4u32.saturating_add(
        u32::try_from(compressed.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "chunk too large"))?,
    );

    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, uncompressed_len)?;
    w.write_all(&compressed)
}

pub fn read_chunk_header<R: Read>(r: &mut R) -> io::Result<([u8; 4], u32)> {
    let tag = read_exact::<4, _>(r)?;
    let len = read_u32_le(r)?;
    Ok((tag, len))
}

/// Read the body of a V2 chunk whose header has already been consumed.
pub fn read_chunk_v2_lz4<R: Read>(r: &mut R, len: u32) -> io::Result<Vec<u8>> {
    let mut take = r.take(len as u64);
    let uncompressed_len = read_u32_le(&mut take)? as usize;
    let mut compressed = Vec::with_capacity((len as usize).saturating_sub(4));
    take.read_to_end(&mut compressed)?;
    if compressed.len() + 4 != len as usize {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated lz4 chunk",
        ));
    }
    decompress_lz4(&compressed, uncompressed_len)
}

/// Iterate the chunks of an unsealed image body, calling `f(tag, payload)`.
///
/// Compressed chunks are handed over already decompressed when their tag is
/// listed in `lz4_tags`. Unknown chunks are passed through for the caller to skip.
pub fn for_each_chunk<F>(body: &[u8], lz4_tags: &[[u8; 4]], mut f: F) -> io::Result<()>
where
    F: FnMut([u8; 4], &[u8]) -> io::Result<()>,
{
    let mut cursor = io::Cursor::new(body);
    loop {
        let (tag, len) = match read_chunk_header(&mut cursor) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        if lz4_tags.contains(&tag) {
            let payload = read_chunk_v2_lz4(&mut cursor, len)?;
            f(tag, &payload)?;
        } else {
            let mut payload = Vec::new();
            (&mut cursor).take(len as u64).read_to_end(&mut payload)?;
            if payload.len() != len as usize {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated chunk",
                ));
            }
            f(tag, &payload)?;
        }
    }
    Ok(())
}

/// Append the trailing checksum chunk.
pub fn seal(image: &mut Vec<u8>) -> io::Result<()> {
    let sum = fingerprint64(image);
    image.extend_from_slice(&TAG_CHECKSUM);
    write_u32_le(image, 8)?;
    write_u64_le(image, sum)
}

/// Verify the trailing checksum and return the image without it.
pub fn unseal(image: &[u8]) -> io::Result<&[u8]> {
    if image.len() < CHECKSUM_CHUNK_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "image too short for checksum",
        ));
    }
    let (body, trailer) = image.split_at(image.len() - CHECKSUM_CHUNK_LEN);
    if trailer[..4] != TAG_CHECKSUM || trailer[4..8] != 8u32.to_le_bytes() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "missing checksum chunk",
        ));
    }
    let mut sum = [0u8; 8];
    sum.copy_from_slice(&trailer[8..]);
    if u64::from_le_bytes(sum) != fingerprint64(body) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "checksum mismatch",
        ));
    }
    Ok(body)
}

/// Sibling temp path used by `write_atomic`.
#[must_use]
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write-to-temp-then-rename. A reader never observes a half-written file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Read a whole file, mapping "not found" to `Ok(None)`.
pub fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_length_sensitive() {
        assert_eq!(fingerprint64(b"cat"), fingerprint64(b"cat"));
        assert_ne!(fingerprint64(b"cat"), fingerprint64(b"cat\0"));
        assert_ne!(fingerprint64(b""), fingerprint64(b"\0"));
    }

    #[test]
    fn sealed_image_detects_flipped_byte() {
        let mut image = Vec::new();
        write_header(&mut image, PARTITION_MAGIC).unwrap();
        write_chunk_v2_lz4(&mut image, *b"DATA", &[7u8; 300]).unwrap();
        seal(&mut image).unwrap();

        assert!(unseal(&image).is_ok());

        let mut broken = image.clone();
        broken[14] ^= 0xFF;
        let err = unseal(&broken).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn chunks_are_visited_in_order_with_lz4_payloads_decoded() {
        let mut body = Vec::new();
        write_chunk(&mut body, *b"META", &[1, 2, 3]).unwrap();
        write_chunk_v2_lz4(&mut body, *b"BULK", &[9u8; 1000]).unwrap();

        let mut seen = Vec::new();
        for_each_chunk(&body, &[*b"BULK"], |tag, payload| {
            seen.push((tag, payload.len()));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![(*b"META", 3), (*b"BULK", 1000)]);
    }

    #[test]
    fn truncated_chunk_is_an_error() {
        let mut body = Vec::new();
        write_chunk(&mut body, *b"META", &[1, 2, 3, 4, 5]).unwrap();
        body.truncate(body.len() - 2);
        assert!(for_each_chunk(&body, &[], |_, _| Ok(())).is_err());
    }

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("file.bin");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert!(!temp_path(&path).exists());
        assert_eq!(read_optional(&dir.path().join("missing")).unwrap(), None);
    }
}
