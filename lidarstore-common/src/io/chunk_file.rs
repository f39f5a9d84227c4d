//! A container format made of typed, versioned chunks.
//!
//!  # Format description
//!
//! The file is a plain sequence of chunks, without any file level header.
//! Each chunk starts with a chunk header (all integers little endian):
//!
//!  - field 1, 4 bytes: chunk type id (usually 4 ascii characters, like `NODE`)
//!  - field 2, u8, 1 byte: major version of the chunk contents
//!  - field 3, u8, 1 byte: minor version of the chunk contents
//!  - field 4, u16 le, 2 bytes: length of the chunk header in bytes. Currently 16.
//!     Readers skip any header bytes beyond the fields they know.
//!  - field 5, u64 le, 8 bytes: total length of the chunk in bytes, including the header.
//!
//! The chunk payload follows immediately after the header.
//! Readers that do not know a chunk type skip it using the total length, so new chunk types can be
//! added without breaking old readers. A newer minor version only appends data to a payload,
//! a newer major version changes its meaning.

use super::PointIoError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use std::io::{Read, Write};

pub type ChunkType = [u8; 4];

/// Size of the chunk header as written by this implementation.
pub const CHUNK_HEADER_LEN: u16 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkVersion {
    pub major: u8,
    pub minor: u8,
}

impl ChunkVersion {
    pub const fn new(major: u8, minor: u8) -> Self {
        ChunkVersion { major, minor }
    }

    /// A reader supporting `self` can read chunks of version `other`,
    /// as long as the major versions agree.
    pub fn can_read(&self, other: ChunkVersion) -> bool {
        self.major == other.major
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_type: ChunkType,
    pub version: ChunkVersion,
    pub header_length: u16,
    pub total_length: u64,
}

impl ChunkHeader {
    pub fn payload_length(&self) -> u64 {
        self.total_length - self.header_length as u64
    }

    pub fn type_name(&self) -> String {
        String::from_utf8_lossy(&self.chunk_type).into_owned()
    }

    /// Reads a chunk header.
    /// Returns `None`, if the reader is at the end of the file.
    pub fn read(rd: &mut impl Read) -> Result<Option<ChunkHeader>, PointIoError> {
        // type id, with a clean end of file being allowed before its first byte
        let mut chunk_type = [0; 4];
        let mut filled = 0;
        while filled < chunk_type.len() {
            match rd.read(&mut chunk_type[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(PointIoError::DataFormat(
                        "Truncated chunk header.".to_string(),
                    ));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let major = rd.read_u8()?;
        let minor = rd.read_u8()?;
        let header_length = rd.read_u16::<LittleEndian>()?;
        let total_length = rd.read_u64::<LittleEndian>()?;
        if header_length < CHUNK_HEADER_LEN {
            return Err(PointIoError::DataFormat(format!(
                "Invalid chunk header length: {header_length}"
            )));
        }
        if total_length < header_length as u64 {
            return Err(PointIoError::DataFormat(format!(
                "Chunk length {total_length} is smaller than its header."
            )));
        }

        // skip header fields added by newer versions
        let extra = (header_length - CHUNK_HEADER_LEN) as u64;
        if extra > 0 {
            let skipped = std::io::copy(&mut (&mut *rd).take(extra), &mut std::io::sink())?;
            if skipped != extra {
                return Err(PointIoError::DataFormat(
                    "Truncated chunk header.".to_string(),
                ));
            }
        }

        Ok(Some(ChunkHeader {
            chunk_type,
            version: ChunkVersion::new(major, minor),
            header_length,
            total_length,
        }))
    }

    pub fn write(&self, wr: &mut impl Write) -> Result<(), PointIoError> {
        if self.header_length != CHUNK_HEADER_LEN {
            return Err(PointIoError::Unsupported(format!(
                "Can only write chunk headers of length {CHUNK_HEADER_LEN}."
            )));
        }
        wr.write_all(&self.chunk_type)?;
        wr.write_u8(self.version.major)?;
        wr.write_u8(self.version.minor)?;
        wr.write_u16::<LittleEndian>(self.header_length)?;
        wr.write_u64::<LittleEndian>(self.total_length)?;
        Ok(())
    }
}

/// Writes chunks to the underlying writer.
pub struct ChunkWriter<W> {
    wr: W,
}

impl<W: Write> ChunkWriter<W> {
    pub fn new(wr: W) -> Self {
        ChunkWriter { wr }
    }

    pub fn write_chunk(
        &mut self,
        chunk_type: ChunkType,
        version: ChunkVersion,
        payload: &[u8],
    ) -> Result<(), PointIoError> {
        let header = ChunkHeader {
            chunk_type,
            version,
            header_length: CHUNK_HEADER_LEN,
            total_length: CHUNK_HEADER_LEN as u64 + payload.len() as u64,
        };
        header.write(&mut self.wr)?;
        self.wr.write_all(payload)?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.wr
    }
}

/// Reads chunks one after another.
pub struct ChunkReader<R> {
    rd: R,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(rd: R) -> Self {
        ChunkReader { rd }
    }

    /// Reads the next chunk header, or returns `None` at the end of the file.
    /// After this, exactly one of [ChunkReader::read_payload] or [ChunkReader::skip_payload]
    /// must be called before reading the next header.
    pub fn next_header(&mut self) -> Result<Option<ChunkHeader>, PointIoError> {
        ChunkHeader::read(&mut self.rd)
    }

    pub fn read_payload(&mut self, header: &ChunkHeader) -> Result<Vec<u8>, PointIoError> {
        let len = header.payload_length();
        let mut payload = Vec::new();
        (&mut self.rd).take(len).read_to_end(&mut payload)?;
        if payload.len() as u64 != len {
            return Err(PointIoError::DataFormat(format!(
                "Truncated chunk {}: expected {len} bytes of payload, got {}.",
                header.type_name(),
                payload.len()
            )));
        }
        Ok(payload)
    }

    pub fn skip_payload(&mut self, header: &ChunkHeader) -> Result<(), PointIoError> {
        debug!("Skipping chunk {}", header.type_name());
        let len = header.payload_length();
        let skipped = std::io::copy(&mut (&mut self.rd).take(len), &mut std::io::sink())?;
        if skipped != len {
            return Err(PointIoError::DataFormat(format!(
                "Truncated chunk {}.",
                header.type_name()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> Vec<u8> {
        let mut wr = ChunkWriter::new(Vec::new());
        wr.write_chunk(*b"AAAA", ChunkVersion::new(1, 0), &[1, 2, 3])
            .unwrap();
        wr.write_chunk(*b"ZZZZ", ChunkVersion::new(7, 3), &[9; 100])
            .unwrap();
        wr.write_chunk(*b"BBBB", ChunkVersion::new(1, 2), &[])
            .unwrap();
        wr.into_inner()
    }

    #[test]
    fn read_known_and_skip_unknown() {
        let data = sample_file();
        let mut rd = ChunkReader::new(data.as_slice());
        let mut seen = Vec::new();
        while let Some(header) = rd.next_header().unwrap() {
            match &header.chunk_type {
                b"AAAA" | b"BBBB" => {
                    let payload = rd.read_payload(&header).unwrap();
                    seen.push((header.chunk_type, header.version, payload));
                }
                _ => rd.skip_payload(&header).unwrap(),
            }
        }
        assert_eq!(
            seen,
            vec![
                (*b"AAAA", ChunkVersion::new(1, 0), vec![1, 2, 3]),
                (*b"BBBB", ChunkVersion::new(1, 2), vec![]),
            ]
        );
    }

    #[test]
    fn longer_headers_are_skipped() {
        // hand-written header with 4 bytes of unknown extra header fields
        let mut data = Vec::new();
        data.extend_from_slice(b"AAAA");
        data.push(1);
        data.push(5);
        data.extend_from_slice(&20u16.to_le_bytes());
        data.extend_from_slice(&22u64.to_le_bytes());
        data.extend_from_slice(&[0xff; 4]);
        data.extend_from_slice(&[42, 43]);

        let mut rd = ChunkReader::new(data.as_slice());
        let header = rd.next_header().unwrap().unwrap();
        assert_eq!(header.payload_length(), 2);
        assert_eq!(rd.read_payload(&header).unwrap(), vec![42, 43]);
        assert!(rd.next_header().unwrap().is_none());
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut data = sample_file();
        data.truncate(data.len() - 16 - 50);
        let mut rd = ChunkReader::new(data.as_slice());
        let first = rd.next_header().unwrap().unwrap();
        rd.read_payload(&first).unwrap();
        let second = rd.next_header().unwrap().unwrap();
        assert!(rd.skip_payload(&second).is_err());
    }

    #[test]
    fn version_compatibility() {
        let supported = ChunkVersion::new(1, 0);
        assert!(supported.can_read(ChunkVersion::new(1, 4)));
        assert!(!supported.can_read(ChunkVersion::new(2, 0)));
    }
}
