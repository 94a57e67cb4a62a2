use std::sync::LazyLock;

use crate::error::FabricError;

/// gets the query ID from a raw message
pub fn get_query_id(packets: &[u8]) -> Result<u16, FabricError> {
    let mut pos = 0;
    read_u16(packets, &mut pos)
}

/// gets a big-endian u16 at `*pos` and advances past it
pub(crate) fn read_u16(buf: &[u8], pos: &mut usize) -> Result<u16, FabricError> {
    let bytes = buf.get(*pos..*pos + 2).ok_or_else(|| {
        FabricError::ProtocolParse(format!("ran out of bytes reading a u16 at {}", *pos))
    })?;
    let mut result_bytes = [0u8; 2];
    result_bytes.copy_from_slice(bytes);
    *pos += 2;
    Ok(u16::from_be_bytes(result_bytes))
}

/// gets a big-endian u32 at `*pos` and advances past it
pub(crate) fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32, FabricError> {
    let bytes = buf.get(*pos..*pos + 4).ok_or_else(|| {
        FabricError::ProtocolParse(format!("ran out of bytes reading a u32 at {}", *pos))
    })?;
    let mut result_bytes = [0u8; 4];
    result_bytes.copy_from_slice(bytes);
    *pos += 4;
    Ok(u32::from_be_bytes(result_bytes))
}

/// Renders a buffer as offset-prefixed hex lines for packet debugging.
pub fn hexdump(buf: &[u8]) -> String {
    let mut lines: Vec<String> = Vec::with_capacity(buf.len().div_ceil(16));
    for (index, chunk) in buf.chunks(16).enumerate() {
        lines.push(format!("{:04x}  {}", index * 16, hex::encode(chunk)));
    }
    lines.join("\n")
}

/// The process hostname, resolved once and cached for the lifetime of the
/// process.
pub fn hostname() -> &'static str {
    static HOSTNAME: LazyLock<String> =
        LazyLock::new(|| gethostname::gethostname().to_string_lossy().into_owned());
    &HOSTNAME
}
