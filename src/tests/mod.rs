mod tcp;
pub mod test_harness;
mod udp;

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::enums::{OpCode, PacketType, Rcode, RecordClass, RecordType};
use crate::message::Message;
use crate::name::DomainName;
use crate::resourcerecord::{CharacterString, RecordData, ResourceRecord};
use crate::{HEADER_BYTES, Header, Question};

#[test]
fn test_encode_iana_org_a_query() {
    let query = Message::query(0xa370, DomainName::from("iana.org"), RecordType::A);
    let bytes = query.to_bytes().expect("Failed to encode query");
    let expected_bytes = [
        /* header - 12 bytes, RD set */
        0xa3, 0x70, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        /* question - 14 bytes */
        0x04, 0x69, 0x61, 0x6e, 0x61, 0x03, 0x6f, 0x72, 0x67, 0x00, 0x00, 0x01, 0x00, 0x01,
    ];
    assert_eq!(bytes, expected_bytes);
}

#[test]
fn test_decode_iana_org_a_reply() {
    // answer as a real recursive resolver sends it: the answer's owner name
    // is a pointer back to the question name at offset 12
    let reply_bytes = [
        /* header */
        0xa3, 0x70, 0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
        /* question */
        0x04, 0x69, 0x61, 0x6e, 0x61, 0x03, 0x6f, 0x72, 0x67, 0x00, 0x00, 0x01, 0x00, 0x01,
        /* answer */
        0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x01, 0x5e, 0x00, 0x04, 0xc0, 0x00,
        0x2b, 0x08,
    ];
    let reply = Message::from_bytes(&reply_bytes).expect("Failed to decode reply");

    assert_eq!(reply.header.id, 0xa370);
    assert_eq!(reply.header.qr, PacketType::Answer);
    assert_eq!(reply.header.opcode, OpCode::Query);
    assert!(reply.header.recursion_desired);
    assert!(reply.header.recursion_available);
    assert_eq!(reply.rcode(), Rcode::NoError);

    let question = reply.first_question().expect("Reply without a question");
    assert_eq!(question.qname, DomainName::from("iana.org"));
    assert_eq!(question.qtype, RecordType::A);

    assert_eq!(reply.answers.len(), 1);
    let answer = &reply.answers[0];
    assert_eq!(answer.name, DomainName::from("iana.org"));
    assert_eq!(answer.ttl, 350);
    assert_eq!(
        answer.data,
        RecordData::A(Ipv4Addr::new(192, 0, 43, 8))
    );
}

#[test]
fn test_roundtrip_all_record_types() {
    let header = Header {
        id: 4321,
        qr: PacketType::Answer,
        authoritative: true,
        recursion_desired: true,
        qdcount: 1,
        ancount: 9,
        nscount: 1,
        arcount: 1,
        ..Header::default()
    };
    let message = Message {
        header,
        questions: vec![Question {
            qname: DomainName::from("hello.goat"),
            qtype: RecordType::ANY,
            qclass: RecordClass::Internet,
        }],
        answers: vec![
            record("hello.goat", RecordData::A(Ipv4Addr::new(192, 0, 2, 1))),
            record(
                "hello.goat",
                RecordData::AAAA(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
            ),
            record("hello.goat", RecordData::NS(DomainName::from("ns1.hello.goat"))),
            record(
                "www.hello.goat",
                RecordData::CNAME(DomainName::from("hello.goat")),
            ),
            record(
                "hello.goat",
                RecordData::MX {
                    preference: 10,
                    exchange: DomainName::from("mail.hello.goat"),
                },
            ),
            record(
                "hello.goat",
                RecordData::TXT(vec![
                    CharacterString::from("v=spf1 -all"),
                    CharacterString::from("second string"),
                ]),
            ),
            record(
                "_dns._udp.hello.goat",
                RecordData::SRV {
                    priority: 0,
                    weight: 5,
                    port: 53,
                    target: DomainName::from("ns1.hello.goat"),
                },
            ),
            record(
                "hello.goat",
                RecordData::HINFO {
                    cpu: CharacterString::from("RISC-V"),
                    os: CharacterString::from("linux"),
                },
            ),
            ResourceRecord {
                name: DomainName::from("weird.hello.goat"),
                class: RecordClass::Other(42),
                ttl: 1,
                data: RecordData::Unknown {
                    rrtype: 999,
                    data: vec![0xde, 0xad, 0xbe, 0xef],
                },
            },
        ],
        authorities: vec![record(
            "hello.goat",
            RecordData::SOA {
                mname: DomainName::from("ns1.hello.goat"),
                rname: DomainName::from("dns.hello.goat"),
                serial: 2024010101,
                refresh: 7200,
                retry: 3600,
                expire: 604800,
                minimum: 300,
            },
        )],
        additionals: vec![record(
            "4.4.8.8.in-addr.arpa",
            RecordData::PTR(DomainName::from("dns.google")),
        )],
    };

    let bytes = message.to_bytes().expect("Failed to encode message");
    let decoded = Message::from_bytes(&bytes).expect("Failed to decode message");
    assert_eq!(decoded, message);
    assert!(decoded.answers[0].is_type(RecordType::A));
    assert!(decoded.authorities[0].is_type(RecordType::SOA));
}

#[test]
fn test_compression_pointer_emitted_for_repeated_name() {
    let mut message = Message::query(7, DomainName::from("example.com"), RecordType::A);
    message.header.qr = PacketType::Answer;
    message.header.ancount = 1;
    message
        .answers
        .push(record("example.com", RecordData::A(Ipv4Addr::new(192, 0, 2, 7))));
    let bytes = message.to_bytes().expect("Failed to encode message");

    // question name sits at offset 12, the answer's owner name must be a
    // two byte pointer back to it
    let answer_name_at = HEADER_BYTES + 13 + 4;
    assert_eq!(bytes[answer_name_at], 0xc0);
    assert_eq!(bytes[answer_name_at + 1], HEADER_BYTES as u8);
}

#[test]
fn test_uppercase_names_normalize() {
    let wire = [
        0u8, 1, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, /* IANA.ORG */
        0x04, 0x49, 0x41, 0x4e, 0x41, 0x03, 0x4f, 0x52, 0x47, 0x00, 0x00, 0x01, 0x00, 0x01,
    ];
    let decoded = Message::from_bytes(&wire).expect("Failed to decode query");
    let question = decoded.first_question().expect("missing question");
    assert_eq!(question.qname, DomainName::from("iana.org"));

    let lowercase = Question {
        qname: DomainName::from("iana.org"),
        qtype: RecordType::A,
        qclass: RecordClass::Internet,
    };
    assert!(lowercase.matches(question));
}

#[test]
fn test_rdata_length_past_buffer_rejected() {
    let mut bytes = Message::query(3, DomainName::from("example.com"), RecordType::A)
        .to_bytes()
        .expect("Failed to encode query");
    // hand-append an answer whose declared RDLENGTH overruns the buffer
    bytes[7] = 1; // ancount
    bytes.extend([
        0xc0, 0x0c, /* name pointer */
        0x00, 0x01, /* type A */
        0x00, 0x01, /* class IN */
        0x00, 0x00, 0x00, 0x3c, /* ttl */
        0x00, 0x64, /* rdlength=100, but only 4 bytes follow */
        1, 2, 3, 4,
    ]);
    let result = Message::from_bytes(&bytes);
    assert!(matches!(result, Err(crate::error::FabricError::ProtocolParse(_))));
}

#[test]
fn test_short_header_rejected() {
    assert!(Message::from_bytes(&[0x13, 0x37, 0x00]).is_err());
}

#[test]
fn test_record_type_wire_values_roundtrip() {
    for value in [1u16, 2, 5, 6, 12, 13, 15, 16, 28, 33, 252, 255] {
        assert_eq!(RecordType::from(value).value(), value);
    }
    // unknown types carry their wire value through verbatim
    assert_eq!(RecordType::from(4711u16), RecordType::Unknown(4711));
    assert_eq!(RecordType::Unknown(4711).value(), 4711);
    assert_eq!(RecordClass::from(4242u16).value(), 4242);
}

#[test]
fn test_txt_strings_survive_roundtrip() {
    let long_text = "x".repeat(255);
    let data = RecordData::TXT(vec![
        CharacterString::from(long_text.as_str()),
        CharacterString::from(""),
    ]);
    let mut message = Message::query(99, DomainName::from("txt.example.com"), RecordType::TXT);
    message.header.qr = PacketType::Answer;
    message.answers.push(record("txt.example.com", data.clone()));
    let bytes = message.to_bytes().expect("Failed to encode TXT answer");
    let decoded = Message::from_bytes(&bytes).expect("Failed to decode TXT answer");
    assert_eq!(decoded.answers[0].data, data);
}

#[test]
fn test_supported_record_types() {
    assert!(RecordType::A.supported());
    assert!(RecordType::SRV.supported());
    assert!(!RecordType::AXFR.supported());
    assert!(!RecordType::Unknown(999).supported());
}

#[test]
fn test_hostname_cache_is_stable() {
    let first = crate::utils::hostname();
    let second = crate::utils::hostname();
    assert!(!first.is_empty());
    // same cached allocation every time
    assert!(std::ptr::eq(first, second));
}

#[test]
fn test_hexdump_layout() {
    let dump = crate::utils::hexdump(&[0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(dump, "0000  deadbeef");
}

#[test]
fn test_errors_convert_to_io() {
    let err: std::io::Error =
        crate::error::FabricError::Timeout(std::time::Duration::from_secs(1)).into();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

    let inner = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope");
    let err: std::io::Error = crate::error::FabricError::Transport(inner).into();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
}

fn record(name: &str, data: RecordData) -> ResourceRecord {
    ResourceRecord {
        name: DomainName::from(name),
        class: RecordClass::Internet,
        ttl: 350,
        data,
    }
}
