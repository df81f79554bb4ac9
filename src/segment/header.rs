use std::fmt;
use std::io::{Read, Write};
use std::path::Path;

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

// 2 + 48 + 4 + 2 bytes
pub const HEADER_SIZE: usize = 56;

pub const ENDIANNESS_INDICATOR: u16 = 0x0102;

pub const FILE_TYPE_TAG_LEN: usize = 48;

pub const FILE_TYPE_TAG: &[u8] = b"mmap_mvcc::container";

pub const CURRENT_VERSION: Version = Version::new(1, 0);
pub const MIN_SUPPORTED_VERSION: Version = Version::new(1, 0);
pub const MAX_SUPPORTED_VERSION: Version = Version::new(1, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16) -> Self {
        Version { major, minor }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub endianness: u16,
    pub file_type_tag: [u8; FILE_TYPE_TAG_LEN],
    pub version: Version,
    pub header_size: u16,
}

impl Header {
    pub fn new() -> Self {
        let mut file_type_tag = [0u8; FILE_TYPE_TAG_LEN];
        file_type_tag[..FILE_TYPE_TAG.len()].copy_from_slice(FILE_TYPE_TAG);
        Header {
            endianness: ENDIANNESS_INDICATOR,
            file_type_tag,
            version: CURRENT_VERSION,
            header_size: HEADER_SIZE as u16,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        HeaderEncoder::new(&mut buf).encode(self)?;
        Ok(buf)
    }

    /// Checks every field against what this build writes. `path` only feeds
    /// the error context.
    pub fn validate(&self, path: &Path) -> Result<()> {
        if self.endianness != ENDIANNESS_INDICATOR {
            let reason = if self.endianness == ENDIANNESS_INDICATOR.swap_bytes() {
                "written with the opposite byte order".to_string()
            } else {
                format!("bad endianness indicator {:#06x}", self.endianness)
            };
            return Err(Error::malformed(path, "header", reason));
        }

        let expected = Header::new();
        if self.file_type_tag != expected.file_type_tag {
            return Err(Error::malformed(path, "header", "unrecognised file type tag"));
        }

        if self.version < MIN_SUPPORTED_VERSION || self.version > MAX_SUPPORTED_VERSION {
            return Err(Error::IncompatibleVersion {
                path: path.to_path_buf(),
                found: self.version,
                min: MIN_SUPPORTED_VERSION,
                max: MAX_SUPPORTED_VERSION,
            });
        }

        if self.header_size as usize != HEADER_SIZE {
            return Err(Error::malformed(
                path,
                "header",
                format!("header size {} expected {}", self.header_size, HEADER_SIZE),
            ));
        }

        Ok(())
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<&[u8]> for Header {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::malformed(
                Path::new(""),
                "header",
                format!("{} bytes is shorter than a header", bytes.len()),
            ));
        }

        HeaderDecoder::new(bytes).decode()
    }
}

pub struct HeaderDecoder<R: Read> {
    reader: R,
}

impl<R: Read> HeaderDecoder<R> {
    pub fn new(reader: R) -> Self {
        HeaderDecoder { reader }
    }

    pub fn decode(&mut self) -> Result<Header> {
        let endianness = self
            .reader
            .read_u16::<NativeEndian>()
            .map_err(|e| Error::io(Path::new(""), "decode endianness", e))?;

        let mut file_type_tag = [0u8; FILE_TYPE_TAG_LEN];
        self.reader
            .read_exact(&mut file_type_tag)
            .map_err(|e| Error::io(Path::new(""), "decode file type tag", e))?;

        let major = self
            .reader
            .read_u16::<NativeEndian>()
            .map_err(|e| Error::io(Path::new(""), "decode major version", e))?;

        let minor = self
            .reader
            .read_u16::<NativeEndian>()
            .map_err(|e| Error::io(Path::new(""), "decode minor version", e))?;

        let header_size = self
            .reader
            .read_u16::<NativeEndian>()
            .map_err(|e| Error::io(Path::new(""), "decode header size", e))?;

        Ok(Header {
            endianness,
            file_type_tag,
            version: Version::new(major, minor),
            header_size,
        })
    }
}

pub struct HeaderEncoder<W: Write> {
    writer: W,
}

impl<W: Write> HeaderEncoder<W> {
    pub fn new(writer: W) -> Self {
        HeaderEncoder { writer }
    }

    pub fn encode(&mut self, header: &Header) -> Result<()> {
        self.writer
            .write_u16::<NativeEndian>(header.endianness)
            .map_err(|e| Error::io(Path::new(""), "encode endianness", e))?;

        self.writer
            .write_all(&header.file_type_tag)
            .map_err(|e| Error::io(Path::new(""), "encode file type tag", e))?;

        self.writer
            .write_u16::<NativeEndian>(header.version.major)
            .map_err(|e| Error::io(Path::new(""), "encode major version", e))?;

        self.writer
            .write_u16::<NativeEndian>(header.version.minor)
            .map_err(|e| Error::io(Path::new(""), "encode minor version", e))?;

        self.writer
            .write_u16::<NativeEndian>(header.header_size)
            .map_err(|e| Error::io(Path::new(""), "encode header size", e))?;

        Ok(())
    }
}
