use bp_error::{BpResult, bp_bail, bp_err};

use crate::format::{Endianness, FormatBuffer, FormatReader};
use crate::{
    ACTIVE_FLAG_POSITION, AGGREGATOR_COUNT_POSITION, BP_MINOR_VERSION, BP_MINOR_VERSION_POSITION,
    BP_VERSION, BP_VERSION_POSITION, COLUMN_MAJOR_FLAG_POSITION, ENDIAN_FLAG_POSITION,
    FLATTEN_STEPS_POSITION, INDEX_HEADER_SIZE, VERSION_MAJOR_POSITION, VERSION_MINOR_POSITION,
    VERSION_PATCH_POSITION, VERSION_TAG_LENGTH, VERSION_TAG_PREFIX, WRITER_COUNT_POSITION,
};

/// Which file a header prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Index,
    Metadata,
}

impl FileKind {
    fn tag_suffix(self) -> &'static str {
        match self {
            Self::Index => "Index Table",
            Self::Metadata => "Metadata",
        }
    }
}

/// Library version components stamped into every header, each saturating at `u8::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LibraryVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl LibraryVersion {
    pub const CURRENT: Self = Self {
        major: version_component(env!("CARGO_PKG_VERSION_MAJOR")),
        minor: version_component(env!("CARGO_PKG_VERSION_MINOR")),
        patch: version_component(env!("CARGO_PKG_VERSION_PATCH")),
    };
}

const fn version_component(digits: &str) -> u8 {
    let digits = digits.as_bytes();
    let mut value: u32 = 0;
    let mut i = 0;
    while i < digits.len() && digits[i].is_ascii_digit() {
        value = value * 10 + (digits[i] - b'0') as u32;
        if value > u8::MAX as u32 {
            return u8::MAX;
        }
        i += 1;
    }
    value as u8
}

/// The fixed 64-byte header of `md.idx` and `md.0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexHeader {
    pub version: LibraryVersion,
    pub endianness: Endianness,
    pub bp_version: u8,
    pub bp_minor_version: u8,
    pub writer_active: bool,
    pub column_major: bool,
    pub flatten_steps: bool,
    pub writer_count: u32,
    pub aggregator_count: u32,
}

impl IndexHeader {
    /// A header describing a dataset written by this host, still open for writing.
    pub fn new(writer_count: u32, aggregator_count: u32) -> Self {
        Self {
            version: LibraryVersion::CURRENT,
            endianness: Endianness::native(),
            bp_version: BP_VERSION,
            bp_minor_version: BP_MINOR_VERSION,
            writer_active: true,
            column_major: false,
            flatten_steps: false,
            writer_count,
            aggregator_count,
        }
    }

    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    pub fn version_tag(&self, kind: FileKind) -> String {
        format!(
            "{VERSION_TAG_PREFIX}{}.{}.{} {}",
            self.version.major,
            self.version.minor,
            self.version.patch,
            kind.tag_suffix()
        )
    }

    pub fn encode(&self, kind: FileKind) -> Vec<u8> {
        let mut buffer = FormatBuffer::with_capacity(self.endianness, INDEX_HEADER_SIZE);
        buffer.put_padded(self.version_tag(kind).as_bytes(), VERSION_TAG_LENGTH);
        buffer.put_at(VERSION_MAJOR_POSITION, self.version.major);
        buffer.put_at(VERSION_MINOR_POSITION, self.version.minor);
        buffer.put_at(VERSION_PATCH_POSITION, self.version.patch);
        buffer.put_at(ENDIAN_FLAG_POSITION, self.endianness.flag());
        buffer.put_at(BP_VERSION_POSITION, self.bp_version);
        buffer.put_at(BP_MINOR_VERSION_POSITION, self.bp_minor_version);
        buffer.put_at(ACTIVE_FLAG_POSITION, u8::from(self.writer_active));
        buffer.put_at(
            COLUMN_MAJOR_FLAG_POSITION,
            if self.column_major { b'y' } else { b'n' },
        );
        buffer.put_at(FLATTEN_STEPS_POSITION, u8::from(self.flatten_steps));
        buffer.put_at(WRITER_COUNT_POSITION, self.writer_count);
        buffer.put_at(AGGREGATOR_COUNT_POSITION, self.aggregator_count);
        buffer.put_at(INDEX_HEADER_SIZE - 1, 0u8);
        buffer.into_inner()
    }

    /// Validate and decode a header. Fails with `IncompatibleFormat` on a foreign file, an
    /// unsupported bp version, or a byte order this build cannot read.
    pub fn decode(bytes: &[u8]) -> BpResult<Self> {
        if bytes.len() < INDEX_HEADER_SIZE {
            bp_bail!(
                IncompatibleFormat: "header needs {INDEX_HEADER_SIZE} bytes, found {}",
                bytes.len()
            );
        }
        if !bytes.starts_with(VERSION_TAG_PREFIX.as_bytes()) {
            bp_bail!(IncompatibleFormat: "missing {VERSION_TAG_PREFIX:?} version tag");
        }

        let endianness = Endianness::from_flag(bytes[ENDIAN_FLAG_POSITION])?;
        if !endianness.is_native() && !cfg!(feature = "endian-reverse") {
            bp_bail!(
                IncompatibleFormat: "dataset is {endianness} and this build cannot reverse byte order"
            );
        }

        let bp_version = bytes[BP_VERSION_POSITION];
        let bp_minor_version = bytes[BP_MINOR_VERSION_POSITION];
        if bp_version != BP_VERSION || bp_minor_version > BP_MINOR_VERSION {
            bp_bail!(
                IncompatibleFormat: "unsupported bp version {bp_version}.{bp_minor_version}, expected {BP_VERSION}.{BP_MINOR_VERSION}"
            );
        }

        let reader = FormatReader::new(bytes, endianness);
        Ok(Self {
            version: LibraryVersion {
                major: bytes[VERSION_MAJOR_POSITION],
                minor: bytes[VERSION_MINOR_POSITION],
                patch: bytes[VERSION_PATCH_POSITION],
            },
            endianness,
            bp_version,
            bp_minor_version,
            writer_active: bytes[ACTIVE_FLAG_POSITION] != 0,
            column_major: bytes[COLUMN_MAJOR_FLAG_POSITION] == b'y',
            flatten_steps: bytes[FLATTEN_STEPS_POSITION] != 0,
            writer_count: reader.get_at(WRITER_COUNT_POSITION)?,
            aggregator_count: reader.get_at(AGGREGATOR_COUNT_POSITION)?,
        })
    }

    /// Read only the writer-active byte of an encoded header.
    pub fn is_writer_active(bytes: &[u8]) -> BpResult<bool> {
        bytes
            .get(ACTIVE_FLAG_POSITION)
            .map(|flag| *flag != 0)
            .ok_or_else(|| bp_err!(OutOfBounds: ACTIVE_FLAG_POSITION, 0, bytes.len()))
    }

    /// Offset of the first step record, right after the writer-to-subfile map.
    pub fn step_records_offset(&self) -> u64 {
        (INDEX_HEADER_SIZE + self.writer_count as usize * size_of::<u64>()) as u64
    }
}

/// Per-dataset summary derived from the header once it is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Minifooter {
    pub version_tag: String,
    pub version: u8,
    pub endianness: Endianness,
    pub has_subfiles: bool,
    pub writer_map_offset: u64,
    pub step_records_offset: u64,
}

impl Minifooter {
    pub fn from_header(header: &IndexHeader) -> Self {
        Self {
            version_tag: header.version_tag(FileKind::Index),
            version: header.bp_version,
            endianness: header.endianness,
            has_subfiles: true,
            writer_map_offset: INDEX_HEADER_SIZE as u64,
            step_records_offset: header.step_records_offset(),
        }
    }
}

pub fn encode_writer_map(map: &[u64], endianness: Endianness) -> Vec<u8> {
    let mut buffer = FormatBuffer::with_capacity(endianness, map.len() * size_of::<u64>());
    for subfile in map {
        buffer.put(*subfile);
    }
    buffer.into_inner()
}
