//! netfabric - an asynchronous TCP/UDP client & server fabric with an
//! RFC 1035 stub resolver, built on tokio.
//!
//! The three load-bearing pieces are the TCP fabric ([tcp]), the UDP fabric
//! ([udp]) and the DNS resolver ([resolver]) with its wire codec
//! ([message], [resourcerecord], [name]).

use packed_struct::prelude::*;
use std::fmt::Display;

use crate::enums::*;
use crate::error::FabricError;
use crate::name::{DomainName, NameWriter, read_name};
use crate::utils::read_u16;

/// Configuration surfaces for every fabric piece
pub mod config;
pub mod enums;
pub mod error;
pub mod events;
pub mod fifo;
pub mod logging;
pub mod message;
pub mod name;
/// The stub resolver: queries over UDP and TCP with retries and fan-out
pub mod resolver;
pub mod resourcerecord;
pub mod tcp;
#[cfg(test)]
mod tests;
pub mod udp;
pub mod utils;

pub use crate::error::FabricError as Error;

/// The size of a DNS message header
pub const HEADER_BYTES: usize = 12;
/// Receive buffer for the datagram fabrics
pub const UDP_BUFFER_SIZE: usize = 2048;
/// The maximum safe DNS payload in a UDP datagram <https://dnsflagday.net/2020/#dns-flag-day-2020>
pub const DNS_UDP_PAYLOAD: usize = 1232;
/// Wire-format ceiling for a whole domain name
pub const MAX_NAME_BYTES: usize = 255;
/// Wire-format ceiling for a single label
pub const MAX_LABEL_BYTES: usize = 63;

/// The header of a DNS transmission, either a Query or Reply. Ref
/// [RFC1035](https://www.rfc-editor.org/rfc/rfc1035#section-4.1.1) section 4.1.1.
#[derive(Debug, PackedStruct, PartialEq, Eq, Clone)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "12")]
pub struct Header {
    /// The query ID
    #[packed_field(bits = "0..=15", endian = "msb")]
    pub id: u16,
    /// Is it a query or response
    #[packed_field(bits = "16", ty = "enum")]
    pub qr: PacketType,
    #[packed_field(bits = "17..=20", ty = "enum")]
    pub opcode: OpCode,
    #[packed_field(bits = "21")]
    pub authoritative: bool,
    /// TC - the response did not fit and was cut short; callers retry over TCP
    #[packed_field(bits = "22")]
    pub truncated: bool,
    /// RD - Recursion Desired - set in a query and copied into the response.
    /// If RD is set, it directs the name server to pursue the query recursively.
    #[packed_field(bits = "23")]
    pub recursion_desired: bool,
    #[packed_field(bits = "24")]
    pub recursion_available: bool,
    /// reserved, must be 0
    #[packed_field(bits = "25")]
    pub z: bool,
    /// AD - authentic data (DNSSEC, RFC4035)
    #[packed_field(bits = "26")]
    pub ad: bool,
    /// CD - checking disabled (DNSSEC, RFC4035)
    #[packed_field(bits = "27")]
    pub cd: bool,
    #[packed_field(bits = "28..=31", ty = "enum")]
    pub rcode: Rcode,
    /// number of entries in the question section
    #[packed_field(bits = "32..=47", endian = "msb")]
    pub qdcount: u16,
    /// number of entries in the answer section
    #[packed_field(bits = "48..=63", endian = "msb")]
    pub ancount: u16,
    /// number of name server resource records in the authority section
    #[packed_field(bits = "64..=79", endian = "msb")]
    pub nscount: u16,
    /// number of resource records in the additional records section
    #[packed_field(bits = "80..=95", endian = "msb")]
    pub arcount: u16,
}

impl Default for Header {
    fn default() -> Self {
        Header {
            id: 0,
            qr: PacketType::Query,
            opcode: OpCode::Query,
            authoritative: false,
            truncated: false,
            recursion_desired: false,
            recursion_available: false,
            z: false,
            ad: false,
            cd: false,
            rcode: Rcode::NoError,
            qdcount: 0,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }
}

impl Header {
    pub(crate) fn unpack_from(buf: &[u8]) -> Result<Self, FabricError> {
        if buf.len() < HEADER_BYTES {
            return Err(FabricError::ProtocolParse(format!(
                "message of {} bytes is shorter than a DNS header",
                buf.len()
            )));
        }
        let mut split_header: [u8; HEADER_BYTES] = [0; HEADER_BYTES];
        split_header.copy_from_slice(&buf[0..HEADER_BYTES]);
        Ok(Header::unpack(&split_header)?)
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "id={} qr={:?} opcode={:?} rcode={:?} qd={} an={} ns={} ar={}",
            self.id,
            self.qr,
            self.opcode,
            self.rcode,
            self.qdcount,
            self.ancount,
            self.nscount,
            self.arcount
        ))
    }
}

/// A DNS Question section entry, from Ref
/// [RFC1035](https://www.rfc-editor.org/rfc/rfc1035#section-4.1.2) section 4.1.2.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Question {
    /// The name which is being queried
    pub qname: DomainName,
    /// The Record type that is being requested, eg A, NS, MX, TXT etc.
    pub qtype: RecordType,
    /// The class, (typically IN for "Internet")
    pub qclass: RecordClass,
}

impl Display for Question {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "QNAME={} QTYPE={} QCLASS={}",
            self.qname, self.qtype, self.qclass,
        ))
    }
}

impl Question {
    /// Reads one question out of `message` starting at `*pos`. Question
    /// names go through the compression-aware reader, a surprising number
    /// of resolvers point them at each other in multi-question messages.
    pub(crate) fn decode(message: &[u8], pos: &mut usize) -> Result<Self, FabricError> {
        let qname = read_name(message, pos)?;
        let qtype = RecordType::from(read_u16(message, pos)?);
        let qclass = RecordClass::from(read_u16(message, pos)?);
        Ok(Question {
            qname,
            qtype,
            qclass,
        })
    }

    pub(crate) fn encode(
        &self,
        out: &mut Vec<u8>,
        names: &mut NameWriter,
    ) -> Result<(), FabricError> {
        names.write(out, &self.qname)?;
        out.extend(self.qtype.value().to_be_bytes());
        out.extend(self.qclass.value().to_be_bytes());
        Ok(())
    }

    /// Whether a response question matches this query's question. Names are
    /// lowercase-normalized at parse time so this is effectively
    /// case-insensitive.
    pub fn matches(&self, other: &Question) -> bool {
        self.qname == other.qname
            && self.qtype.value() == other.qtype.value()
            && self.qclass.value() == other.qclass.value()
    }
}
