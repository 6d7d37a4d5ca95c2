use nom::{
    IResult,
    bytes::complete::tag,
    number::complete::{be_u32, be_u64},
};

/// Number of bytes needed to parse any payload header version.
pub const HEADER_LEN: usize = 24;

/// Fixed-size header at the start of a Chrome OS / Android OTA `payload.bin`.
///
/// The binary layout is:
/// - Magic bytes: "CrAU" (4 bytes)
/// - File format version (8 bytes, big-endian)
/// - Manifest size (8 bytes, big-endian)
/// - [Optional] Metadata signature size (4 bytes, big-endian, only if version >= 2)
///
/// Only the header is read here; decoding the manifest and partition data is
/// left to the external dumping tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Major version of the payload file format.
    pub file_format_version: u64,

    /// Size in bytes of the manifest that follows the header.
    pub manifest_size: u64,

    /// Size of the metadata signature, present from format version 2.
    pub metadata_signature_size: Option<u32>,
}

impl PayloadHeader {
    fn parse_inner(input: &[u8]) -> IResult<&[u8], PayloadHeader> {
        let (input, _magic) = tag(&b"CrAU"[..])(input)?;
        let (input, file_format_version) = be_u64(input)?;
        let (input, manifest_size) = be_u64(input)?;

        let (input, metadata_signature_size) = if file_format_version > 1 {
            let (input, size) = be_u32(input)?;
            (input, Some(size))
        } else {
            (input, None)
        };

        Ok((
            input,
            PayloadHeader {
                file_format_version,
                manifest_size,
                metadata_signature_size,
            },
        ))
    }

    /// Parse the header from the first bytes of `payload.bin`.
    pub fn parse(bytes: &[u8]) -> Result<Self, String> {
        match Self::parse_inner(bytes) {
            Ok((_, header)) => Ok(header),
            Err(e) => Err(format!("invalid payload header: {e}")),
        }
    }

    /// Offset of the first data blob relative to the start of `payload.bin`, or
    /// `None` when the declared sizes overflow.
    pub fn data_offset(&self) -> Option<u64> {
        let fixed: u64 = if self.metadata_signature_size.is_some() { 24 } else { 20 };
        fixed
            .checked_add(self.manifest_size)?
            .checked_add(u64::from(self.metadata_signature_size.unwrap_or(0)))
    }
}
