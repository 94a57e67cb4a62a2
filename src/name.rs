//! Domain name wire format: length-prefixed labels with RFC1035 section
//! 4.1.4 message compression.

use std::collections::HashMap;
use std::fmt::Display;
use std::net::IpAddr;

use tracing::trace;

use crate::error::FabricError;
use crate::{MAX_LABEL_BYTES, MAX_NAME_BYTES};

/// Upper bound on pointer chases while decoding one name. Pointers must
/// strictly decrease, so a chain can never legitimately be longer than this.
const MAX_POINTER_JUMPS: usize = 64;

/// A domain name, normalized to lowercase with no trailing dot. The root
/// name is the empty string.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct DomainName {
    name: String,
}

impl DomainName {
    pub fn root() -> Self {
        DomainName {
            name: String::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn is_root(&self) -> bool {
        self.name.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.name.split('.').filter(|label| !label.is_empty())
    }

    /// The number of bytes this name occupies on the wire when written
    /// without compression (labels plus length octets plus the terminator).
    pub fn wire_len(&self) -> usize {
        if self.is_root() {
            return 1;
        }
        self.name.len() + 2
    }

    /// Checks the label and total-length limits before a name is emitted.
    pub fn validate(&self) -> Result<(), FabricError> {
        if self.is_root() {
            return Ok(());
        }
        if self.wire_len() > MAX_NAME_BYTES {
            return Err(FabricError::InvalidName(format!(
                "name is {} octets on the wire, limit is {MAX_NAME_BYTES}: {}",
                self.wire_len(),
                self.name
            )));
        }
        for label in self.name.split('.') {
            if label.is_empty() {
                return Err(FabricError::InvalidName(format!(
                    "empty label in {:?}",
                    self.name
                )));
            }
            if label.len() > MAX_LABEL_BYTES {
                return Err(FabricError::InvalidName(format!(
                    "label {:?} is over {MAX_LABEL_BYTES} octets",
                    label
                )));
            }
        }
        Ok(())
    }
}

impl From<&str> for DomainName {
    fn from(input: &str) -> Self {
        DomainName {
            name: input.trim_end_matches('.').to_ascii_lowercase(),
        }
    }
}

impl From<String> for DomainName {
    fn from(input: String) -> Self {
        DomainName::from(input.as_str())
    }
}

impl Display for DomainName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_root() {
            return f.write_str(".");
        }
        f.write_str(&self.name)
    }
}

/// Reads one name out of `message` starting at `*pos`, following
/// compression pointers. `*pos` ends up just past the name as it appears in
/// the stream (that is, after the first pointer if there was one).
///
/// A length octet with the top two bits set introduces a 14 bit pointer to
/// an earlier position in the same message; a length of zero terminates.
pub fn read_name(message: &[u8], pos: &mut usize) -> Result<DomainName, FabricError> {
    let mut cursor = *pos;
    let mut resume: Option<usize> = None;
    let mut jumps = 0usize;
    let mut text: Vec<u8> = Vec::new();
    // length octets plus terminator, counted as if written uncompressed
    let mut wire_len = 1usize;

    loop {
        let len = *message.get(cursor).ok_or_else(|| {
            FabricError::ProtocolParse("name runs past the end of the message".to_string())
        })? as usize;

        if len & 0xC0 == 0xC0 {
            let low = *message.get(cursor + 1).ok_or_else(|| {
                FabricError::ProtocolParse("truncated compression pointer".to_string())
            })? as usize;
            let target = ((len & 0x3F) << 8) | low;
            if resume.is_none() {
                resume = Some(cursor + 2);
            }
            // pointers may only reach backwards, anything else is a loop
            if target >= cursor {
                return Err(FabricError::ProtocolParse(format!(
                    "compression pointer at {cursor} points forward to {target}"
                )));
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(FabricError::ProtocolParse(
                    "compression pointer loop".to_string(),
                ));
            }
            cursor = target;
            continue;
        }
        if len & 0xC0 != 0 {
            return Err(FabricError::ProtocolParse(format!(
                "reserved label length bits 0x{len:02x} at {cursor}"
            )));
        }
        if len == 0 {
            cursor += 1;
            break;
        }

        let label = message.get(cursor + 1..cursor + 1 + len).ok_or_else(|| {
            FabricError::ProtocolParse(format!(
                "label length {len} at {cursor} overruns the message"
            ))
        })?;
        wire_len += len + 1;
        if wire_len > MAX_NAME_BYTES {
            return Err(FabricError::ProtocolParse(format!(
                "decoded name exceeds {MAX_NAME_BYTES} octets"
            )));
        }
        if !text.is_empty() {
            text.push(b'.');
        }
        text.extend(label.iter().map(|byte| byte.to_ascii_lowercase()));
        cursor += len + 1;
    }

    *pos = resume.unwrap_or(cursor);
    let name = std::str::from_utf8(&text)?.to_string();
    trace!("read name {name:?}, stream resumes at {}", *pos);
    Ok(DomainName { name })
}

/// Emits names into a message under construction, compressing repeats with
/// pointers. Offsets are tracked per message, so pointers can never reach
/// into unrelated messages.
#[derive(Default)]
pub struct NameWriter {
    offsets: HashMap<String, u16>,
}

impl NameWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `name` at the current end of `out`, reusing an earlier
    /// occurrence of the name or any of its parent suffixes where possible.
    pub fn write(&mut self, out: &mut Vec<u8>, name: &DomainName) -> Result<(), FabricError> {
        name.validate()?;
        let mut remaining = name.name.as_str();
        loop {
            if remaining.is_empty() {
                out.push(0);
                return Ok(());
            }
            if let Some(&offset) = self.offsets.get(remaining) {
                out.extend((0xC000u16 | offset).to_be_bytes());
                return Ok(());
            }
            let here = out.len();
            // targets past the 14 bit range just don't get registered
            if here < 0x4000 {
                self.offsets.insert(remaining.to_string(), here as u16);
            }
            let (label, rest) = match remaining.split_once('.') {
                Some((label, rest)) => (label, rest),
                None => (remaining, ""),
            };
            out.push(label.len() as u8);
            out.extend(label.as_bytes());
            remaining = rest;
        }
    }

    /// Writes `name` without looking up or registering compression targets.
    /// SRV targets go out this way, per RFC2782.
    pub fn write_uncompressed(
        &mut self,
        out: &mut Vec<u8>,
        name: &DomainName,
    ) -> Result<(), FabricError> {
        name.validate()?;
        for label in name.labels() {
            out.push(label.len() as u8);
            out.extend(label.as_bytes());
        }
        out.push(0);
        Ok(())
    }
}

/// The PTR lookup name for an address, eg `4.4.8.8.in-addr.arpa` or the
/// nibble-reversed `ip6.arpa` form.
pub fn reverse_name(addr: IpAddr) -> DomainName {
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            DomainName::from(format!(
                "{}.{}.{}.{}.in-addr.arpa",
                octets[3], octets[2], octets[1], octets[0]
            ))
        }
        IpAddr::V6(v6) => {
            let mut parts: Vec<String> = Vec::with_capacity(32);
            for byte in v6.octets().iter().rev() {
                parts.push(format!("{:x}", byte & 0x0F));
                parts.push(format!("{:x}", byte >> 4));
            }
            DomainName::from(format!("{}.ip6.arpa", parts.join(".")))
        }
    }
}

#[cfg(test)]
mod test {
    use super::{DomainName, NameWriter, read_name, reverse_name};

    #[test]
    fn test_name_roundtrip_uncompressed() {
        let mut out = vec![];
        let mut writer = NameWriter::new();
        writer
            .write(&mut out, &DomainName::from("example.com"))
            .expect("Failed to write example.com");
        assert_eq!(
            out,
            [7, 101, 120, 97, 109, 112, 108, 101, 3, 99, 111, 109, 0]
        );

        let mut pos = 0;
        let name = read_name(&out, &mut pos).expect("Failed to read name back");
        assert_eq!(name, DomainName::from("example.com"));
        assert_eq!(pos, out.len());
    }

    #[test]
    fn test_root_name() {
        let mut pos = 0;
        let name = read_name(&[0u8], &mut pos).expect("Failed to read the root name");
        assert_eq!(name, DomainName::root());
        assert!(name.is_root());
        assert_eq!(name.to_string(), ".");

        let mut out = vec![];
        NameWriter::new()
            .write(&mut out, &name)
            .expect("Failed to write the root name");
        assert_eq!(out, [0]);
    }

    #[test]
    fn test_pointer_loop_rejected() {
        // pointer at offset 0 pointing at itself
        let buf = [0xC0u8, 0x00];
        let mut pos = 0;
        assert!(read_name(&buf, &mut pos).is_err());
    }

    #[test]
    fn test_reverse_name_v4() {
        let name = reverse_name("192.0.2.1".parse().expect("Failed to parse address"));
        assert_eq!(name.as_str(), "1.2.0.192.in-addr.arpa");
    }
}
