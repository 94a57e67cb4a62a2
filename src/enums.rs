use enum_iterator::Sequence;
use packed_struct::prelude::*;
use std::fmt::Display;

#[derive(Debug, PrimitiveEnum_u8, Clone, Copy, Eq, PartialEq)]
pub enum PacketType {
    Query = 0,
    Answer = 1,
}

impl From<bool> for PacketType {
    fn from(input: bool) -> Self {
        match input {
            false => Self::Query,
            true => Self::Answer,
        }
    }
}

#[derive(Debug, Eq, PartialEq, PrimitiveEnum_u8, Copy, Clone)]
/// A four bit field that specifies kind of query in this message.
/// This value is set by the originator of a query and copied into the response.
pub enum OpCode {
    /// A standard query (QUERY)
    Query = 0,
    // IQuery = 1, an inverse query (IQUERY) - obsolete in https://www.rfc-editor.org/rfc/rfc3425
    /// Server status request (STATUS)
    Status = 2,
    /// Zone change notification <https://www.rfc-editor.org/rfc/rfc1996>
    Notify = 4,
    /// Dynamic update <https://www.rfc-editor.org/rfc/rfc2136>
    Update = 5,
    /// reserved for future use
    Reserved = 15,
}

impl From<u8> for OpCode {
    fn from(input: u8) -> Self {
        match input {
            0 => Self::Query,
            2 => Self::Status,
            4 => Self::Notify,
            5 => Self::Update,
            _ => Self::Reserved,
        }
    }
}

#[derive(PrimitiveEnum_u8, Clone, Copy, Debug, Eq, PartialEq)]
/// Response code, things like NOERROR, FORMATERROR, SERVFAIL etc.
pub enum Rcode {
    /// No error condition
    NoError = 0,
    /// Format error - The name server was unable to interpret the query.
    FormatError = 1,
    /// Server failure - The name server was unable to process this query due to a problem with the name server.
    ServFail = 2,
    /// Name Error - Meaningful only for responses from an authoritative name server, this code signifies that the domain name referenced in the query does not exist.
    NameError = 3,
    /// Not Implemented - The name server does not support the requested kind of query.
    NotImplemented = 4,
    /// Refused - The name server refuses to perform the specified operation for policy reasons.
    Refused = 5,
    /// Name exists when it should not <https://www.rfc-editor.org/rfc/rfc2136>
    YxDomain = 6,
    /// RR set exists when it should not
    YxRrSet = 7,
    /// RR set that should exist does not
    NxRrSet = 8,
    /// Server not authoritative for the zone
    NotAuth = 9,
    /// Name not contained in zone
    NotZone = 10,
    /// 11..15 - Reserved for future use
    Reserved = 15,
}

impl From<u8> for Rcode {
    fn from(input: u8) -> Self {
        match input {
            0 => Self::NoError,
            1 => Self::FormatError,
            2 => Self::ServFail,
            3 => Self::NameError,
            4 => Self::NotImplemented,
            5 => Self::Refused,
            6 => Self::YxDomain,
            7 => Self::YxRrSet,
            8 => Self::NxRrSet,
            9 => Self::NotAuth,
            10 => Self::NotZone,
            _ => Self::Reserved,
        }
    }
}

#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Sequence)]
/// RRType, eg A, NS, MX, etc
pub enum RecordType {
    /// A host address
    A,
    /// Authoritative name server
    NS,
    /// The canonical name for an alias
    CNAME,
    /// Marks the start of a zone of authority
    SOA,
    /// A domain name pointer
    PTR,
    /// Host information
    HINFO,
    /// Mail exchange
    MX,
    /// Text strings
    TXT,
    /// IPv6 host address <https://www.rfc-editor.org/rfc/rfc3596#section-2.1>
    AAAA,
    /// Service location <https://www.rfc-editor.org/rfc/rfc2782>
    SRV,
    /// A request for a transfer of an entire zone
    AXFR,
    /// A request for all records (*)
    ANY,
    /// Anything we don't have a first-class decoder for, kept verbatim
    Unknown(u16),
}

impl RecordType {
    /// The wire value of the type code
    pub fn value(self) -> u16 {
        match self {
            Self::A => 1,
            Self::NS => 2,
            Self::CNAME => 5,
            Self::SOA => 6,
            Self::PTR => 12,
            Self::HINFO => 13,
            Self::MX => 15,
            Self::TXT => 16,
            Self::AAAA => 28,
            Self::SRV => 33,
            Self::AXFR => 252,
            Self::ANY => 255,
            Self::Unknown(value) => value,
        }
    }

    /// The types this fabric decodes into typed rdata
    pub fn supported(self) -> bool {
        !matches!(self, Self::Unknown(_) | Self::AXFR)
    }
}

impl From<u16> for RecordType {
    fn from(input: u16) -> Self {
        match input {
            1 => Self::A,
            2 => Self::NS,
            5 => Self::CNAME,
            6 => Self::SOA,
            12 => Self::PTR,
            13 => Self::HINFO,
            15 => Self::MX,
            16 => Self::TXT,
            28 => Self::AAAA, // https://www.rfc-editor.org/rfc/rfc3596#section-2.1
            33 => Self::SRV,
            252 => Self::AXFR,
            255 => Self::ANY,
            other => Self::Unknown(other),
        }
    }
}

impl From<&str> for RecordType {
    fn from(input: &str) -> Self {
        match input {
            "A" => Self::A,
            "AAAA" => Self::AAAA,
            "ANY" => Self::ANY,
            "AXFR" => Self::AXFR,
            "CNAME" => Self::CNAME,
            "HINFO" => Self::HINFO,
            "MX" => Self::MX,
            "NS" => Self::NS,
            "PTR" => Self::PTR,
            "SOA" => Self::SOA,
            "SRV" => Self::SRV,
            "TXT" => Self::TXT,
            _ => Self::Unknown(0),
        }
    }
}

impl Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::NS => write!(f, "NS"),
            Self::CNAME => write!(f, "CNAME"),
            Self::SOA => write!(f, "SOA"),
            Self::PTR => write!(f, "PTR"),
            Self::HINFO => write!(f, "HINFO"),
            Self::MX => write!(f, "MX"),
            Self::TXT => write!(f, "TXT"),
            Self::AAAA => write!(f, "AAAA"),
            Self::SRV => write!(f, "SRV"),
            Self::AXFR => write!(f, "AXFR"),
            Self::ANY => write!(f, "ANY"),
            Self::Unknown(value) => write!(f, "TYPE{value}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// CLASS fields appear in resource records, most entries should be IN.
/// Unknown classes are carried through verbatim. Ref RFC1035 3.2.4.
pub enum RecordClass {
    /// IN - Internet
    Internet,
    /// CS - CSNET class (Obsolete - used only for examples in some obsolete RFCs)
    CsNet,
    /// CH - Chaos
    Chaos,
    /// Hesiod [Dyer 87]
    Hesiod,
    /// QCLASS * - any class
    Any,
    /// Whatever the peer sent, re-emitted unchanged
    Other(u16),
}

impl RecordClass {
    pub fn value(self) -> u16 {
        match self {
            Self::Internet => 1,
            Self::CsNet => 2,
            Self::Chaos => 3,
            Self::Hesiod => 4,
            Self::Any => 255,
            Self::Other(value) => value,
        }
    }
}

impl From<u16> for RecordClass {
    fn from(input: u16) -> Self {
        match input {
            1 => Self::Internet,
            2 => Self::CsNet,
            3 => Self::Chaos,
            4 => Self::Hesiod,
            255 => Self::Any,
            other => Self::Other(other),
        }
    }
}

impl Display for RecordClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordClass::Internet => write!(f, "IN"),
            RecordClass::CsNet => write!(f, "CS"),
            RecordClass::Chaos => write!(f, "CHAOS"),
            RecordClass::Hesiod => write!(f, "HESIOD"),
            RecordClass::Any => write!(f, "ANY"),
            RecordClass::Other(value) => write!(f, "CLASS{value}"),
        }
    }
}
