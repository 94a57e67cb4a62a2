use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::BufMut;

use crate::enums::{RecordClass, RecordType};
use crate::error::FabricError;
use crate::name::{DomainName, NameWriter, read_name};
use crate::utils::{read_u16, read_u32};

/// <character-string> is a single length octet followed by that number of
/// characters, up to 256 octets in length including the length octet.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct CharacterString {
    pub data: Vec<u8>,
}

impl From<&str> for CharacterString {
    fn from(input: &str) -> Self {
        CharacterString { data: input.into() }
    }
}

impl CharacterString {
    /// Length octet then the string, truncated to the 255 byte payload cap.
    pub fn as_bytes(&self) -> Vec<u8> {
        let payload = &self.data[..self.data.len().min(255)];
        let mut res: Vec<u8> = vec![payload.len() as u8];
        res.extend(payload);
        res
    }

    fn decode(message: &[u8], pos: &mut usize, end: usize) -> Result<Self, FabricError> {
        let len = *message
            .get(*pos)
            .ok_or_else(|| FabricError::ProtocolParse("missing character-string length".into()))?
            as usize;
        if *pos + 1 + len > end {
            return Err(FabricError::ProtocolParse(format!(
                "character-string length {len} overruns the record data"
            )));
        }
        let data = message[*pos + 1..*pos + 1 + len].to_vec();
        *pos += 1 + len;
        Ok(CharacterString { data })
    }
}

/// Typed RDATA. Anything without a first-class decoder here is carried in
/// [RecordData::Unknown] with its bytes untouched.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RecordData {
    /// A single host address
    A(Ipv4Addr),
    /// IPv6 host address <https://www.rfc-editor.org/rfc/rfc3596#section-2.1>
    AAAA(Ipv6Addr),
    /// An authoritative name server
    NS(DomainName),
    /// The canonical name for an alias
    CNAME(DomainName),
    /// A domain name pointer
    PTR(DomainName),
    MX {
        /// Lower values are preferred
        preference: u16,
        /// A host willing to act as a mail exchange for the owner name
        exchange: DomainName,
    },
    /// One or more character-strings; readers usually want them concatenated
    TXT(Vec<CharacterString>),
    SOA {
        /// The name server that was the original or primary source of data for this zone
        mname: DomainName,
        /// The mailbox of the person responsible for this zone, eg `dns.example.com` is actually `dns@example.com`
        rname: DomainName,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    /// Service location <https://www.rfc-editor.org/rfc/rfc2782>
    SRV {
        priority: u16,
        weight: u16,
        port: u16,
        target: DomainName,
    },
    /// Host information
    HINFO {
        cpu: CharacterString,
        os: CharacterString,
    },
    Unknown {
        rrtype: u16,
        data: Vec<u8>,
    },
}

impl RecordData {
    pub fn record_type(&self) -> RecordType {
        match self {
            RecordData::A(_) => RecordType::A,
            RecordData::AAAA(_) => RecordType::AAAA,
            RecordData::NS(_) => RecordType::NS,
            RecordData::CNAME(_) => RecordType::CNAME,
            RecordData::PTR(_) => RecordType::PTR,
            RecordData::MX { .. } => RecordType::MX,
            RecordData::TXT(_) => RecordType::TXT,
            RecordData::SOA { .. } => RecordType::SOA,
            RecordData::SRV { .. } => RecordType::SRV,
            RecordData::HINFO { .. } => RecordType::HINFO,
            RecordData::Unknown { rrtype, .. } => RecordType::Unknown(*rrtype),
        }
    }

    /// Decodes RDATA in place. `pos` sits at the first RDATA byte on entry
    /// and must land exactly on `pos + rdlen` for the known types.
    pub(crate) fn decode(
        rrtype: u16,
        message: &[u8],
        pos: &mut usize,
        rdlen: usize,
    ) -> Result<Self, FabricError> {
        let end = *pos + rdlen;
        if end > message.len() {
            return Err(FabricError::ProtocolParse(format!(
                "declared rdata length {rdlen} exceeds the remaining buffer"
            )));
        }

        let data = match RecordType::from(rrtype) {
            RecordType::A => {
                if rdlen != 4 {
                    return Err(FabricError::ProtocolParse(format!(
                        "A rdata must be 4 octets, got {rdlen}"
                    )));
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&message[*pos..end]);
                *pos = end;
                RecordData::A(Ipv4Addr::from(octets))
            }
            RecordType::AAAA => {
                if rdlen != 16 {
                    return Err(FabricError::ProtocolParse(format!(
                        "AAAA rdata must be 16 octets, got {rdlen}"
                    )));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&message[*pos..end]);
                *pos = end;
                RecordData::AAAA(Ipv6Addr::from(octets))
            }
            RecordType::NS => RecordData::NS(read_name(message, pos)?),
            RecordType::CNAME => RecordData::CNAME(read_name(message, pos)?),
            RecordType::PTR => RecordData::PTR(read_name(message, pos)?),
            RecordType::MX => {
                let preference = read_u16(message, pos)?;
                let exchange = read_name(message, pos)?;
                RecordData::MX {
                    preference,
                    exchange,
                }
            }
            RecordType::TXT => {
                let mut strings = Vec::new();
                while *pos < end {
                    strings.push(CharacterString::decode(message, pos, end)?);
                }
                if strings.is_empty() {
                    return Err(FabricError::ProtocolParse(
                        "TXT rdata with no character-strings".into(),
                    ));
                }
                RecordData::TXT(strings)
            }
            RecordType::SOA => {
                let mname = read_name(message, pos)?;
                let rname = read_name(message, pos)?;
                RecordData::SOA {
                    mname,
                    rname,
                    serial: read_u32(message, pos)?,
                    refresh: read_u32(message, pos)?,
                    retry: read_u32(message, pos)?,
                    expire: read_u32(message, pos)?,
                    minimum: read_u32(message, pos)?,
                }
            }
            RecordType::SRV => {
                let priority = read_u16(message, pos)?;
                let weight = read_u16(message, pos)?;
                let port = read_u16(message, pos)?;
                let target = read_name(message, pos)?;
                RecordData::SRV {
                    priority,
                    weight,
                    port,
                    target,
                }
            }
            RecordType::HINFO => {
                let cpu = CharacterString::decode(message, pos, end)?;
                let os = CharacterString::decode(message, pos, end)?;
                RecordData::HINFO { cpu, os }
            }
            _ => {
                let data = message[*pos..end].to_vec();
                *pos = end;
                RecordData::Unknown { rrtype, data }
            }
        };

        if *pos != end {
            return Err(FabricError::ProtocolParse(format!(
                "rdata for type {rrtype} stopped {} octets short of its declared length",
                end - *pos
            )));
        }
        Ok(data)
    }

    pub(crate) fn encode(
        &self,
        out: &mut Vec<u8>,
        names: &mut NameWriter,
    ) -> Result<(), FabricError> {
        match self {
            RecordData::A(address) => out.extend(address.octets()),
            RecordData::AAAA(address) => out.extend(address.octets()),
            RecordData::NS(name) | RecordData::CNAME(name) | RecordData::PTR(name) => {
                names.write(out, name)?
            }
            RecordData::MX {
                preference,
                exchange,
            } => {
                out.put_u16(*preference);
                names.write(out, exchange)?;
            }
            RecordData::TXT(strings) => {
                for string in strings {
                    out.extend(string.as_bytes());
                }
            }
            RecordData::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                names.write(out, mname)?;
                names.write(out, rname)?;
                out.put_u32(*serial);
                out.put_u32(*refresh);
                out.put_u32(*retry);
                out.put_u32(*expire);
                out.put_u32(*minimum);
            }
            RecordData::SRV {
                priority,
                weight,
                port,
                target,
            } => {
                out.put_u16(*priority);
                out.put_u16(*weight);
                out.put_u16(*port);
                // SRV targets MUST NOT be compressed, RFC2782
                names.write_uncompressed(out, target)?;
            }
            RecordData::HINFO { cpu, os } => {
                out.extend(cpu.as_bytes());
                out.extend(os.as_bytes());
            }
            RecordData::Unknown { data, .. } => out.extend(data),
        }
        Ok(())
    }
}

/// The answer, authority, and additional sections all share the same
/// format: a variable number of resource records.
///
/// Ref [RFC1035 Section 4.1.3](https://www.rfc-editor.org/rfc/rfc1035.html#section-4.1.3)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRecord {
    /// The domain name to which this resource record pertains
    pub name: DomainName,
    /// The class of the data in the RDATA field
    pub class: RecordClass,
    /// How long the record may be cached, in seconds. Zero means
    /// "this transaction only".
    pub ttl: u32,
    pub data: RecordData,
}

impl ResourceRecord {
    pub fn record_type(&self) -> RecordType {
        self.data.record_type()
    }

    pub fn is_type(&self, rrtype: RecordType) -> bool {
        self.record_type() == rrtype
    }

    pub(crate) fn decode(message: &[u8], pos: &mut usize) -> Result<Self, FabricError> {
        let name = read_name(message, pos)?;
        let rrtype = read_u16(message, pos)?;
        let class = RecordClass::from(read_u16(message, pos)?);
        let ttl = read_u32(message, pos)?;
        let rdlen = read_u16(message, pos)? as usize;
        let data = RecordData::decode(rrtype, message, pos, rdlen)?;
        Ok(ResourceRecord {
            name,
            class,
            ttl,
            data,
        })
    }

    pub(crate) fn encode(
        &self,
        out: &mut Vec<u8>,
        names: &mut NameWriter,
    ) -> Result<(), FabricError> {
        names.write(out, &self.name)?;
        out.put_u16(self.record_type().value());
        out.put_u16(self.class.value());
        out.put_u32(self.ttl);
        let rdlen_at = out.len();
        out.put_u16(0);
        self.data.encode(out, names)?;
        let rdlen = out.len() - rdlen_at - 2;
        if rdlen > u16::MAX as usize {
            return Err(FabricError::ProtocolParse(format!(
                "rdata of {rdlen} octets does not fit a u16 length"
            )));
        }
        out[rdlen_at..rdlen_at + 2].copy_from_slice(&(rdlen as u16).to_be_bytes());
        Ok(())
    }
}
