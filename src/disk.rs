//! On-disk layout: the header block and positioned block I/O.
//!
//! Block `-1` is the header block at offset 0; block `k` lives at offset
//! `block_size * (k + 1)`.

use std::io::Cursor;
use std::path::Path;
use std::sync::OnceLock;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crate::error::{Error, Result};
use crate::sys::FileDesc;
use crate::uuid::Uuid;

pub const HEADER_MAGIC: [u8; 4] = *b"R5BD";
pub const HEADER_LEN: usize = 60;
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Header generations at or above this base are rebuild checkpoints; the low
/// 32 bits carry the next stripe to scan. Clean volume epochs always stay
/// below it.
pub const REBUILD_GENERATION_BASE: u64 = 1 << 32;

/// Contents of block -1.
///
/// Layout: `magic(4) | volume_uuid(16) | disk_uuid(16) | disk_index(4) |
/// disk_count(4) | block_size(4) | generation(8) | crc32(4)`, all integers
/// little-endian. The CRC covers every byte before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskHeader {
    pub volume_uuid: Uuid,
    pub disk_uuid: Uuid,
    pub disk_index: u32,
    pub disk_count: u32,
    pub block_size: u32,
    pub generation: u64,
}

impl DiskHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        {
            let mut cursor = Cursor::new(&mut buf[..]);
            use std::io::Write;

            cursor.write_all(&HEADER_MAGIC).unwrap();
            cursor.write_all(self.volume_uuid.as_bytes()).unwrap();
            cursor.write_all(self.disk_uuid.as_bytes()).unwrap();
            cursor.write_u32::<LittleEndian>(self.disk_index).unwrap();
            cursor.write_u32::<LittleEndian>(self.disk_count).unwrap();
            cursor.write_u32::<LittleEndian>(self.block_size).unwrap();
            cursor.write_u64::<LittleEndian>(self.generation).unwrap();
        }

        let crc = crc32(&buf[..HEADER_LEN - 4]);
        buf[HEADER_LEN - 4..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<DiskHeader> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::HeaderCorrupt);
        }

        if bytes[..4] != HEADER_MAGIC {
            return Err(Error::HeaderCorrupt);
        }

        let stored = u32::from_le_bytes([
            bytes[HEADER_LEN - 4],
            bytes[HEADER_LEN - 3],
            bytes[HEADER_LEN - 2],
            bytes[HEADER_LEN - 1],
        ]);
        if crc32(&bytes[..HEADER_LEN - 4]) != stored {
            return Err(Error::HeaderCorrupt);
        }

        let mut cursor = Cursor::new(&bytes[4..]);
        use std::io::Read;

        let mut volume_uuid = [0u8; 16];
        cursor.read_exact(&mut volume_uuid).map_err(|_| Error::HeaderCorrupt)?;
        let mut disk_uuid = [0u8; 16];
        cursor.read_exact(&mut disk_uuid).map_err(|_| Error::HeaderCorrupt)?;

        let disk_index = cursor.read_u32::<LittleEndian>().map_err(|_| Error::HeaderCorrupt)?;
        let disk_count = cursor.read_u32::<LittleEndian>().map_err(|_| Error::HeaderCorrupt)?;
        let block_size = cursor.read_u32::<LittleEndian>().map_err(|_| Error::HeaderCorrupt)?;
        let generation = cursor.read_u64::<LittleEndian>().map_err(|_| Error::HeaderCorrupt)?;

        if disk_count == 0 || block_size == 0 || !block_size.is_power_of_two() {
            return Err(Error::HeaderCorrupt);
        }

        Ok(DiskHeader {
            volume_uuid: Uuid::from_bytes(volume_uuid),
            disk_uuid: Uuid::from_bytes(disk_uuid),
            disk_index,
            disk_count,
            block_size,
            generation,
        })
    }

    /// The stripe a rebuild should resume from, if this header is a
    /// mid-rebuild checkpoint.
    pub fn rebuild_checkpoint(&self) -> Option<u64> {
        if self.generation >= REBUILD_GENERATION_BASE {
            Some(self.generation - REBUILD_GENERATION_BASE)
        } else {
            None
        }
    }
}

fn crc_table() -> &'static [u32; 256] {
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let mut crc = i as u32;
            for _ in 0..8 {
                crc = if crc & 1 != 0 {
                    0xedb8_8320 ^ (crc >> 1)
                } else {
                    crc >> 1
                };
            }
            *entry = crc;
        }
        table
    })
}

/// Standard CRC-32 (IEEE 802.3).
pub fn crc32(bytes: &[u8]) -> u32 {
    let table = crc_table();
    let mut crc = !0u32;
    for &b in bytes {
        crc = table[((crc ^ b as u32) & 0xff) as usize] ^ (crc >> 8);
    }
    !crc
}

/// Byte offset of `block` within the disk file. Block -1 is the header.
pub fn block_offset(block_size: u32, block: i64) -> Result<u64> {
    if block < -1 {
        return Err(Error::ProtocolMalformed);
    }
    Ok((block + 1) as u64 * block_size as u64)
}

/// A slice of a striped volume, stored as one flat local file.
#[derive(Debug)]
pub struct BlockFile {
    file: FileDesc,
    block_size: u32,
}

impl BlockFile {
    /// Opens (creating if needed) the disk file. If a valid header is
    /// already present its block size wins over `block_size`.
    pub fn open<P: AsRef<Path>>(path: P, block_size: u32) -> Result<BlockFile> {
        let file = FileDesc::open_rw(path)?;
        let mut blockfile = BlockFile { file, block_size };

        if let Ok(header) = blockfile.read_header() {
            blockfile.block_size = header.block_size;
        }

        Ok(blockfile)
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn read_block(&self, block: i64) -> Result<Vec<u8>> {
        let offset = block_offset(self.block_size, block)?;
        let mut buf = vec![0u8; self.block_size as usize];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    pub fn write_block(&self, block: i64, data: &[u8]) -> Result<()> {
        if data.len() != self.block_size as usize {
            return Err(Error::Internal(format!(
                "block write of {} bytes, block size is {}",
                data.len(),
                self.block_size
            )));
        }

        let offset = block_offset(self.block_size, block)?;
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    /// Re-reads the header and adopts its block size, after the header
    /// block was rewritten through the ordinary block path.
    pub fn refresh(&mut self) {
        if let Ok(header) = self.read_header() {
            self.block_size = header.block_size;
        }
    }

    pub fn read_header(&self) -> Result<DiskHeader> {
        let mut buf = vec![0u8; HEADER_LEN];
        self.file.read_exact_at(&mut buf, 0)?;
        DiskHeader::decode(&buf)
    }

    /// Writes the header block and flushes it to stable storage.
    pub fn write_header(&mut self, header: &DiskHeader) -> Result<()> {
        let encoded = header.encode();
        let mut block = vec![0u8; self.block_size as usize];
        block[..HEADER_LEN].copy_from_slice(&encoded);
        self.file.write_all_at(&block, 0)?;
        self.file.sync_data()?;
        self.block_size = header.block_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> DiskHeader {
        DiskHeader {
            volume_uuid: "00112233-4455-6677-8899-aabbccddeeff".parse().unwrap(),
            disk_uuid: "ffeeddcc-bbaa-9988-7766-554433221100".parse().unwrap(),
            disk_index: 2,
            disk_count: 3,
            block_size: 4096,
            generation: 7,
        }
    }

    #[test]
    fn header_roundtrip() {
        let header = sample_header();
        let encoded = header.encode();
        assert_eq!(DiskHeader::decode(&encoded).unwrap(), header);
    }

    #[test]
    fn header_flipped_byte_fails_crc() {
        let header = sample_header();
        let encoded = header.encode();

        for i in 0..HEADER_LEN {
            let mut corrupt = encoded;
            corrupt[i] ^= 0x40;
            assert!(
                DiskHeader::decode(&corrupt).is_err(),
                "flip at byte {} went unnoticed",
                i
            );
        }
    }

    #[test]
    fn checkpoint_encoding() {
        let mut header = sample_header();
        assert_eq!(header.rebuild_checkpoint(), None);

        header.generation = REBUILD_GENERATION_BASE + 129;
        assert_eq!(header.rebuild_checkpoint(), Some(129));
    }

    #[test]
    fn crc32_known_value() {
        // the classic check value for "123456789"
        assert_eq!(crc32(b"123456789"), 0xcbf4_3926);
    }

    #[test]
    fn offsets() {
        assert_eq!(block_offset(4096, -1).unwrap(), 0);
        assert_eq!(block_offset(4096, 0).unwrap(), 4096);
        assert_eq!(block_offset(4096, 9).unwrap(), 40960);
        assert!(block_offset(4096, -2).is_err());
    }

    #[test]
    fn blockfile_reads_back_and_zero_fills() {
        let path = std::env::temp_dir().join(format!("raid5d-disk-{}", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let mut blockfile = BlockFile::open(&path, 16).unwrap();

        let data = vec![0xabu8; 16];
        blockfile.write_block(3, &data).unwrap();
        assert_eq!(blockfile.read_block(3).unwrap(), data);

        // untouched block past the end of the file reads as zeroes
        assert_eq!(blockfile.read_block(100).unwrap(), vec![0u8; 16]);

        let header = DiskHeader {
            block_size: 16,
            ..sample_header()
        };
        blockfile.write_header(&header).unwrap();
        assert_eq!(blockfile.read_header().unwrap(), header);
        // header write must not clobber block 3
        assert_eq!(blockfile.read_block(3).unwrap(), data);

        let _ = std::fs::remove_file(&path);
    }
}
