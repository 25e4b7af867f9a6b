//! Record-level file IO for the tuning store: little-endian primitives
//! with a running CRC-32 per record.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Reads one CRC-protected record. Every `read_*` feeds the checksum;
/// `finish` consumes the stored CRC and reports whether it matches.
pub struct RecordReader<'a> {
    file: &'a mut File,
    hasher: crc32fast::Hasher,
}

impl<'a> RecordReader<'a> {
    pub fn new(file: &'a mut File) -> RecordReader<'a> {
        RecordReader {
            file,
            hasher: crc32fast::Hasher::new(),
        }
    }

    pub fn read_u32(&mut self) -> io::Result<u32> {
        let v = self.file.read_u32::<LittleEndian>()?;
        self.hasher.update(&v.to_le_bytes());
        Ok(v)
    }

    pub fn read_u64(&mut self) -> io::Result<u64> {
        let v = self.file.read_u64::<LittleEndian>()?;
        self.hasher.update(&v.to_le_bytes());
        Ok(v)
    }

    pub fn read_f64(&mut self) -> io::Result<f64> {
        let v = self.file.read_f64::<LittleEndian>()?;
        self.hasher.update(&v.to_le_bytes());
        Ok(v)
    }

    pub fn read_bytes(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact(buf)?;
        self.hasher.update(buf);
        Ok(())
    }

    /// Consumes the trailing CRC field; true when the record checks out.
    pub fn finish(self) -> io::Result<bool> {
        let stored = self.file.read_u32::<LittleEndian>()?;
        Ok(stored == self.hasher.finalize())
    }

}

/// Writes one CRC-protected record; `finish` appends the checksum.
pub struct RecordWriter<'a> {
    file: &'a mut File,
    hasher: crc32fast::Hasher,
}

impl<'a> RecordWriter<'a> {
    pub fn new(file: &'a mut File) -> RecordWriter<'a> {
        RecordWriter {
            file,
            hasher: crc32fast::Hasher::new(),
        }
    }

    pub fn write_u32(&mut self, v: u32) -> io::Result<()> {
        self.hasher.update(&v.to_le_bytes());
        self.file.write_u32::<LittleEndian>(v)
    }

    pub fn write_u64(&mut self, v: u64) -> io::Result<()> {
        self.hasher.update(&v.to_le_bytes());
        self.file.write_u64::<LittleEndian>(v)
    }

    pub fn write_f64(&mut self, v: f64) -> io::Result<()> {
        self.hasher.update(&v.to_le_bytes());
        self.file.write_f64::<LittleEndian>(v)
    }

    pub fn write_bytes(&mut self, buf: &[u8]) -> io::Result<()> {
        self.hasher.update(buf);
        self.file.write_all(buf)
    }

    pub fn finish(self) -> io::Result<()> {
        let crc = self.hasher.finalize();
        self.file.write_u32::<LittleEndian>(crc)
    }

}

pub fn seek_to(file: &mut File, pos: u64) -> io::Result<()> {
    file.seek(SeekFrom::Start(pos)).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.bin");

        let mut f = File::create(&path).unwrap();
        let mut w = RecordWriter::new(&mut f);
        w.write_u32(0xDEAD).unwrap();
        w.write_u64(42).unwrap();
        w.write_f64(1.5).unwrap();
        w.finish().unwrap();
        drop(f);

        let mut f = File::open(&path).unwrap();
        let mut r = RecordReader::new(&mut f);
        assert_eq!(r.read_u32().unwrap(), 0xDEAD);
        assert_eq!(r.read_u64().unwrap(), 42);
        assert_eq!(r.read_f64().unwrap(), 1.5);
        assert!(r.finish().unwrap());
    }

    #[test]
    fn flipped_byte_fails_crc() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.bin");

        let mut f = File::create(&path).unwrap();
        let mut w = RecordWriter::new(&mut f);
        w.write_u32(7).unwrap();
        w.finish().unwrap();
        drop(f);

        let mut data = std::fs::read(&path).unwrap();
        data[0] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        let mut f = File::open(&path).unwrap();
        let mut r = RecordReader::new(&mut f);
        r.read_u32().unwrap();
        assert!(!r.finish().unwrap());
    }
}
