//! Little endian read/write helpers for hand-rolled on-disk records.

use std::io::{self, Read, Write};

pub trait ReadLeExt: Read {
    fn read_le_u8(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_le_u16(&mut self) -> io::Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_le_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_le_u64(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_exact_vec(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl<R: Read + ?Sized> ReadLeExt for R {}

pub trait WriteLeExt: Write {
    fn write_le_u8(&mut self, value: u8) -> io::Result<()> {
        self.write_all(&[value])
    }

    fn write_le_u16(&mut self, value: u16) -> io::Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    fn write_le_u32(&mut self, value: u32) -> io::Result<()> {
        self.write_all(&value.to_le_bytes())
    }

    fn write_le_u64(&mut self, value: u64) -> io::Result<()> {
        self.write_all(&value.to_le_bytes())
    }
}

impl<W: Write + ?Sized> WriteLeExt for W {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut buf = Vec::new();
        buf.write_le_u8(0xab).unwrap();
        buf.write_le_u16(0x1234).unwrap();
        buf.write_le_u32(0xdeadbeef).unwrap();
        buf.write_le_u64(u64::MAX - 1).unwrap();

        let mut reader = &buf[..];
        assert_eq!(reader.read_le_u8().unwrap(), 0xab);
        assert_eq!(reader.read_le_u16().unwrap(), 0x1234);
        assert_eq!(reader.read_le_u32().unwrap(), 0xdeadbeef);
        assert_eq!(reader.read_le_u64().unwrap(), u64::MAX - 1);
        assert!(reader.read_le_u8().is_err());
    }
}
