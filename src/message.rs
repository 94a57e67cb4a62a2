use std::net::IpAddr;

use packed_struct::prelude::*;
use tracing::trace;

use crate::enums::{PacketType, Rcode, RecordClass, RecordType};
use crate::error::FabricError;
use crate::name::{DomainName, NameWriter};
use crate::resourcerecord::{RecordData, ResourceRecord};
use crate::{HEADER_BYTES, Header, Question};

/// A whole DNS message: header plus the question, answer, authority and
/// additional sections. Immutable once parsed; parse failures never yield a
/// partial message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additionals: Vec<ResourceRecord>,
}

impl Message {
    /// A recursion-desired query for `name` with the given transaction id.
    pub fn query(id: u16, qname: DomainName, qtype: RecordType) -> Self {
        Message {
            header: Header {
                id,
                recursion_desired: true,
                qdcount: 1,
                ..Header::default()
            },
            questions: vec![Question {
                qname,
                qtype,
                qclass: RecordClass::Internet,
            }],
            answers: vec![],
            authorities: vec![],
            additionals: vec![],
        }
    }

    /// An empty answer skeleton for `query`: id, opcode and RD copied over,
    /// question echoed back.
    pub fn response_to(query: &Message, rcode: Rcode) -> Self {
        Message {
            header: Header {
                id: query.header.id,
                qr: PacketType::Answer,
                opcode: query.header.opcode,
                recursion_desired: query.header.recursion_desired,
                rcode,
                qdcount: query.questions.len() as u16,
                ..Header::default()
            },
            questions: query.questions.clone(),
            answers: vec![],
            authorities: vec![],
            additionals: vec![],
        }
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, FabricError> {
        let header = Header::unpack_from(buf)?;
        trace!("parsed header: {header}");

        let mut pos = HEADER_BYTES;
        let mut questions = Vec::with_capacity(header.qdcount as usize);
        for _ in 0..header.qdcount {
            questions.push(Question::decode(buf, &mut pos)?);
        }
        let mut sections: [Vec<ResourceRecord>; 3] = [
            Vec::with_capacity(header.ancount as usize),
            Vec::with_capacity(header.nscount as usize),
            Vec::with_capacity(header.arcount as usize),
        ];
        for (section, count) in sections
            .iter_mut()
            .zip([header.ancount, header.nscount, header.arcount])
        {
            for _ in 0..count {
                section.push(ResourceRecord::decode(buf, &mut pos)?);
            }
        }
        let [answers, authorities, additionals] = sections;

        Ok(Message {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    /// Serializes the message; the emitted counts always reflect the actual
    /// section lengths. Names are compressed against earlier occurrences in
    /// this message only.
    pub fn to_bytes(&self) -> Result<Vec<u8>, FabricError> {
        let mut header = self.header.clone();
        header.qdcount = self.questions.len() as u16;
        header.ancount = self.answers.len() as u16;
        header.nscount = self.authorities.len() as u16;
        header.arcount = self.additionals.len() as u16;

        let mut out: Vec<u8> = header.pack()?.to_vec();
        let mut names = NameWriter::new();
        for question in &self.questions {
            question.encode(&mut out, &mut names)?;
        }
        for record in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            record.encode(&mut out, &mut names)?;
        }
        Ok(out)
    }

    /// TC - the peer could not fit the whole response in a datagram
    pub fn is_truncated(&self) -> bool {
        self.header.truncated
    }

    pub fn rcode(&self) -> Rcode {
        self.header.rcode
    }

    pub fn first_question(&self) -> Option<&Question> {
        self.questions.first()
    }

    /// Every A and AAAA address in the answer section, in answer order.
    pub fn addresses(&self) -> Vec<IpAddr> {
        self.answers
            .iter()
            .filter_map(|record| match &record.data {
                RecordData::A(address) => Some(IpAddr::V4(*address)),
                RecordData::AAAA(address) => Some(IpAddr::V6(*address)),
                _ => None,
            })
            .collect()
    }

    /// CNAME targets in the answer section, eg the alias chain for a
    /// queried name.
    pub fn canonical_names(&self) -> Vec<DomainName> {
        self.answers
            .iter()
            .filter_map(|record| match &record.data {
                RecordData::CNAME(target) => Some(target.clone()),
                _ => None,
            })
            .collect()
    }
}
