//! Deserialisation of DNS messages from the network.  See the `types`
//! module for details of the format.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::protocol::types::*;

impl Message {
    /// Parse a whole datagram.
    pub fn from_octets(octets: &[u8]) -> Result<Self, Error> {
        Self::deserialise(&mut ConsumableBuffer::new(octets))
    }

    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let header = Header::deserialise(buffer)?;
        let id = header.id;

        let mut questions = Vec::with_capacity(header.qdcount.into());
        let mut answers = Vec::with_capacity(header.ancount.into());
        let mut authority = Vec::with_capacity(header.nscount.into());
        let mut additional = Vec::with_capacity(header.arcount.into());

        for _ in 0..header.qdcount {
            questions.push(Question::deserialise(id, buffer)?);
        }
        for _ in 0..header.ancount {
            answers.push(ResourceRecord::deserialise(id, buffer)?);
        }
        for _ in 0..header.nscount {
            authority.push(ResourceRecord::deserialise(id, buffer)?);
        }
        for _ in 0..header.arcount {
            additional.push(ResourceRecord::deserialise(id, buffer)?);
        }

        Ok(Self {
            header,
            questions,
            answers,
            authority,
            additional,
        })
    }
}

impl Header {
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let id = buffer.next_u16().ok_or(Error::CompletelyBusted)?;
        let flags = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let qdcount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let ancount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let nscount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;
        let arcount = buffer.next_u16().ok_or(Error::HeaderTooShort(id))?;

        Ok(Self {
            id,
            flags,
            qdcount,
            ancount,
            nscount,
            arcount,
        })
    }
}

impl Question {
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let qtype = buffer
            .next_u16()
            .ok_or(Error::QuestionTooShort(id))
            .and_then(|value| {
                RecordType::try_from(value).map_err(|_| Error::UnsupportedRecordType(id))
            })?;
        let qclass = buffer
            .next_u16()
            .ok_or(Error::QuestionTooShort(id))
            .and_then(|value| {
                RecordClass::try_from(value).map_err(|_| Error::UnsupportedRecordClass(id))
            })?;

        Ok(Self {
            name,
            qtype,
            qclass,
        })
    }
}

impl ResourceRecord {
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let name = DomainName::deserialise(id, buffer)?;
        let rtype = buffer
            .next_u16()
            .ok_or(Error::ResourceRecordTooShort(id))
            .and_then(|value| {
                RecordType::try_from(value).map_err(|_| Error::UnsupportedRecordType(id))
            })?;
        let rclass = buffer
            .next_u16()
            .ok_or(Error::ResourceRecordTooShort(id))
            .and_then(|value| {
                RecordClass::try_from(value).map_err(|_| Error::UnsupportedRecordClass(id))
            })?;
        let ttl = buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?;
        let rdlength = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;

        // A and AAAA have a fixed rdata size.  For NS and PTR the
        // rdlength is advisory only: the rdata is a name which may be
        // compressed, so the cursor advances by the actual wire
        // length.
        let rdata = match rtype {
            RecordType::A => {
                if rdlength != 4 {
                    return Err(Error::ResourceRecordInvalid(id));
                }
                RecordData::A(Ipv4Addr::from(
                    buffer.next_u32().ok_or(Error::ResourceRecordTooShort(id))?,
                ))
            }
            RecordType::AAAA => {
                if rdlength != 16 {
                    return Err(Error::ResourceRecordInvalid(id));
                }
                let mut groups = [0u16; 8];
                for group in &mut groups {
                    *group = buffer.next_u16().ok_or(Error::ResourceRecordTooShort(id))?;
                }
                let [a, b, c, d, e, f, g, h] = groups;
                RecordData::Aaaa(Ipv6Addr::new(a, b, c, d, e, f, g, h))
            }
            RecordType::NS => RecordData::Ns(DomainName::deserialise(id, buffer)?),
            RecordType::PTR => RecordData::Ptr(DomainName::deserialise(id, buffer)?),
        };

        Ok(Self {
            name,
            rdata,
            rclass,
            ttl,
        })
    }
}

impl DomainName {
    /// Decode a name, following compression pointers.
    ///
    /// This uses a two-cursor discipline: when the first pointer is
    /// met, the position just after it is remembered, and the buffer
    /// cursor is moved back to the pointer target.  Once the zero
    /// terminator is reached the cursor resumes from the remembered
    /// position (or just past the zero, if no pointer was met).
    ///
    /// Pointers may only reach strictly backwards from the position
    /// of the pointer octet, which both enforces RFC 1035 section
    /// 4.1.4 and, together with the total length bound, guarantees
    /// termination.
    pub fn deserialise(id: u16, buffer: &mut ConsumableBuffer) -> Result<Self, Error> {
        let mut octets = Vec::<u8>::with_capacity(DOMAINNAME_MAX_LEN);
        let mut labels = Vec::<Vec<u8>>::with_capacity(5);
        let mut return_position = None;

        loop {
            let position = buffer.position();
            let size = buffer.next_u8().ok_or(Error::NameTooShort(id))?;

            if size == 0 {
                octets.push(0);
                labels.push(Vec::new());
                break;
            } else if usize::from(size) <= LABEL_MAX_LEN {
                octets.push(size);
                let os = buffer
                    .take(usize::from(size))
                    .ok_or(Error::NameTooShort(id))?;
                let mut label = Vec::<u8>::with_capacity(os.len());
                for o in os {
                    if !o.is_ascii() {
                        return Err(Error::LabelInvalid(id));
                    }
                    let o = o.to_ascii_lowercase();
                    label.push(o);
                    octets.push(o);
                }
                labels.push(label);

                if octets.len() > DOMAINNAME_MAX_LEN {
                    return Err(Error::NameTooLong(id));
                }
            } else if size & 0b1100_0000 == 0b1100_0000 {
                let hi = size & 0b0011_1111;
                let lo = buffer.next_u8().ok_or(Error::NameTooShort(id))?;
                let target = usize::from(u16::from_be_bytes([hi, lo]));

                if target >= position {
                    return Err(Error::PointerInvalid(id));
                }

                if return_position.is_none() {
                    return_position = Some(buffer.position());
                }
                buffer.seek(target);
            } else {
                // length octets with top bits 01 or 10
                return Err(Error::LabelInvalid(id));
            }
        }

        if let Some(position) = return_position {
            buffer.seek(position);
        }

        Ok(DomainName { octets, labels })
    }
}

/// Errors encountered when parsing a datagram.  In all the errors
/// which have a `u16` parameter, that is the ID from the header - so
/// that an error response can be sent.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// The datagram is not even 2 octets long, so it doesn't even
    /// contain a valid ID.  An error cannot be sent back to the
    /// client in this case as, without an ID, it cannot be linked
    /// with the correct query.
    CompletelyBusted,

    /// The header is missing one or more required fields.
    HeaderTooShort(u16),

    /// A question ends with an incomplete field.
    QuestionTooShort(u16),

    /// A resource record ends with an incomplete field.
    ResourceRecordTooShort(u16),

    /// A resource record's rdata does not have the size its type
    /// demands.
    ResourceRecordInvalid(u16),

    /// A name is incomplete, or a label crosses the end of the
    /// packet.
    NameTooShort(u16),

    /// A name is over 255 octets in size.
    NameTooLong(u16),

    /// A compression pointer does not point strictly backwards.
    PointerInvalid(u16),

    /// A length octet has its top two bits set to 01 or 10, or a
    /// label contains a non-ASCII octet.
    LabelInvalid(u16),

    /// A type field holds anything other than A, NS, PTR, or AAAA.
    UnsupportedRecordType(u16),

    /// A class field holds anything other than IN.
    UnsupportedRecordClass(u16),
}

impl Error {
    pub fn id(self) -> Option<u16> {
        match self {
            Error::CompletelyBusted => None,
            Error::HeaderTooShort(id) => Some(id),
            Error::QuestionTooShort(id) => Some(id),
            Error::ResourceRecordTooShort(id) => Some(id),
            Error::ResourceRecordInvalid(id) => Some(id),
            Error::NameTooShort(id) => Some(id),
            Error::NameTooLong(id) => Some(id),
            Error::PointerInvalid(id) => Some(id),
            Error::LabelInvalid(id) => Some(id),
            Error::UnsupportedRecordType(id) => Some(id),
            Error::UnsupportedRecordClass(id) => Some(id),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CompletelyBusted => write!(f, "datagram too short to hold an ID"),
            Error::HeaderTooShort(_) => write!(f, "header too short"),
            Error::QuestionTooShort(_) => write!(f, "question too short"),
            Error::ResourceRecordTooShort(_) => write!(f, "resource record too short"),
            Error::ResourceRecordInvalid(_) => write!(f, "resource record rdata has the wrong size"),
            Error::NameTooShort(_) => write!(f, "name crosses the end of the packet"),
            Error::NameTooLong(_) => write!(f, "name over 255 octets"),
            Error::PointerInvalid(_) => write!(f, "compression pointer does not point backwards"),
            Error::LabelInvalid(_) => write!(f, "malformed label"),
            Error::UnsupportedRecordType(_) => write!(f, "unsupported record type"),
            Error::UnsupportedRecordClass(_) => write!(f, "unsupported record class"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which will be consumed by the parsing process.  Reads
/// never advance the cursor past the end of the underlying octets.
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self {
            octets,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        if self.octets.len() > self.position {
            let a = self.octets[self.position];
            self.position += 1;
            Some(a)
        } else {
            None
        }
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        if self.octets.len() > self.position + 1 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            self.position += 2;
            Some(u16::from_be_bytes([a, b]))
        } else {
            None
        }
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        if self.octets.len() > self.position + 3 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            let c = self.octets[self.position + 2];
            let d = self.octets[self.position + 3];
            self.position += 4;
            Some(u32::from_be_bytes([a, b, c, d]))
        } else {
            None
        }
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        if self.octets.len() >= self.position + size {
            let slice = &self.octets[self.position..self.position + size];
            self.position += size;
            Some(slice)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    /// A 12-byte header with the given id and counts.
    fn header_bytes(id: u16, qdcount: u16, ancount: u16, nscount: u16, arcount: u16) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&0x0100u16.to_be_bytes());
        out.extend_from_slice(&qdcount.to_be_bytes());
        out.extend_from_slice(&ancount.to_be_bytes());
        out.extend_from_slice(&nscount.to_be_bytes());
        out.extend_from_slice(&arcount.to_be_bytes());
        out
    }

    #[test]
    fn parses_a_lookup_question() {
        let mut packet = header_bytes(0x1234, 1, 0, 0, 0);
        packet.extend_from_slice(b"\x07example\x03com\x00");
        packet.extend_from_slice(&[0, 1, 0, 1]);

        let message = Message::from_octets(&packet).unwrap();
        assert_eq!(0x1234, message.header.id);
        assert_eq!(0x0100, message.header.flags);
        assert_eq!(
            vec![Question {
                name: domain("example.com."),
                qtype: RecordType::A,
                qclass: RecordClass::IN,
            }],
            message.questions
        );
    }

    #[test]
    fn parses_a_record() {
        let mut packet = header_bytes(1, 0, 1, 0, 0);
        packet.extend_from_slice(b"\x07example\x03com\x00");
        packet.extend_from_slice(&[0, 1, 0, 1]); // A IN
        packet.extend_from_slice(&3600u32.to_be_bytes());
        packet.extend_from_slice(&[0, 4, 93, 184, 216, 34]);

        let message = Message::from_octets(&packet).unwrap();
        assert_eq!(
            vec![a_record(
                "example.com.",
                "93.184.216.34".parse().unwrap(),
                3600
            )],
            message.answers
        );
    }

    #[test]
    fn parses_aaaa_record() {
        let mut packet = header_bytes(1, 0, 1, 0, 0);
        packet.extend_from_slice(b"\x07example\x03com\x00");
        packet.extend_from_slice(&[0, 28, 0, 1]); // AAAA IN
        packet.extend_from_slice(&300u32.to_be_bytes());
        packet.extend_from_slice(&[0, 16]);
        packet.extend_from_slice(&[
            0x26, 0x06, 0x28, 0x00, 0x02, 0x20, 0x00, 0x01, 0x02, 0x48, 0x18, 0x93, 0x25, 0xc8,
            0x19, 0x46,
        ]);

        let message = Message::from_octets(&packet).unwrap();
        assert_eq!(
            "2606:2800:0220:0001:0248:1893:25c8:1946",
            message.answers[0].rdata.to_string()
        );
    }

    #[test]
    fn compressed_name_decodes_equal_to_its_target() {
        // two questions, the second name being a pointer to the first
        let mut packet = header_bytes(1, 2, 0, 0, 0);
        packet.extend_from_slice(b"\x07example\x03com\x00");
        packet.extend_from_slice(&[0, 1, 0, 1]);
        packet.extend_from_slice(&[0xc0, 12]);
        packet.extend_from_slice(&[0, 1, 0, 1]);

        let message = Message::from_octets(&packet).unwrap();
        assert_eq!(message.questions[0].name, message.questions[1].name);
        assert_eq!("example.com.", message.questions[1].name.to_dotted_string());
    }

    #[test]
    fn compressed_name_resumes_after_the_pointer() {
        // an NS record whose rdata ends with a pointer, followed by
        // an A record: parsing must resume at the A record
        let mut packet = header_bytes(1, 0, 2, 0, 0);
        packet.extend_from_slice(b"\x03com\x00");
        packet.extend_from_slice(&[0, 2, 0, 1]); // NS IN
        packet.extend_from_slice(&300u32.to_be_bytes());
        packet.extend_from_slice(&[0, 4]);
        packet.extend_from_slice(b"\x02ns\xc0\x0c"); // "ns" + pointer to "com"
        packet.extend_from_slice(b"\x02ns\xc0\x0c");
        packet.extend_from_slice(&[0, 1, 0, 1]); // A IN
        packet.extend_from_slice(&300u32.to_be_bytes());
        packet.extend_from_slice(&[0, 4, 192, 5, 6, 30]);

        let message = Message::from_octets(&packet).unwrap();
        assert_eq!(
            RecordData::Ns(domain("ns.com.")),
            message.answers[0].rdata
        );
        assert_eq!(domain("ns.com."), message.answers[1].name);
        assert_eq!(
            RecordData::A("192.5.6.30".parse().unwrap()),
            message.answers[1].rdata
        );
    }

    #[test]
    fn rejects_pointer_at_or_past_the_payload() {
        for target in [64u16, 500, 0x3fff] {
            let mut packet = header_bytes(7, 1, 0, 0, 0);
            packet.extend_from_slice(&[0xc0 | (target >> 8) as u8, (target & 0xff) as u8]);
            packet.extend_from_slice(&[0, 1, 0, 1]);

            assert_eq!(
                Err(Error::PointerInvalid(7)),
                Message::from_octets(&packet)
            );
        }
    }

    #[test]
    fn rejects_forward_pointer() {
        // pointer targets its own question's type field
        let mut packet = header_bytes(7, 1, 0, 0, 0);
        packet.extend_from_slice(&[0xc0, 14]);
        packet.extend_from_slice(&[0, 1, 0, 1]);

        assert_eq!(
            Err(Error::PointerInvalid(7)),
            Message::from_octets(&packet)
        );
    }

    #[test]
    fn rejects_self_pointer() {
        let mut packet = header_bytes(7, 1, 0, 0, 0);
        packet.extend_from_slice(&[0xc0, 12]);
        packet.extend_from_slice(&[0, 1, 0, 1]);

        assert_eq!(
            Err(Error::PointerInvalid(7)),
            Message::from_octets(&packet)
        );
    }

    #[test]
    fn rejects_length_octets_with_reserved_top_bits() {
        for size in [64u8, 100, 128, 191] {
            let mut packet = header_bytes(7, 1, 0, 0, 0);
            packet.push(size);
            packet.extend_from_slice(&[b'x'; 191]);
            packet.push(0);
            packet.extend_from_slice(&[0, 1, 0, 1]);

            assert_eq!(Err(Error::LabelInvalid(7)), Message::from_octets(&packet));
        }
    }

    #[test]
    fn rejects_non_ascii_label() {
        let mut packet = header_bytes(7, 1, 0, 0, 0);
        packet.extend_from_slice(b"\x02a\xff\x00");
        packet.extend_from_slice(&[0, 1, 0, 1]);

        assert_eq!(Err(Error::LabelInvalid(7)), Message::from_octets(&packet));
    }

    #[test]
    fn rejects_label_crossing_packet_end() {
        let mut packet = header_bytes(7, 1, 0, 0, 0);
        packet.extend_from_slice(b"\x3fabc");

        assert_eq!(Err(Error::NameTooShort(7)), Message::from_octets(&packet));
    }

    #[test]
    fn rejects_name_over_255_octets() {
        let mut packet = header_bytes(7, 1, 0, 0, 0);
        for _ in 0..4 {
            packet.push(63);
            packet.extend_from_slice(&[b'x'; 63]);
        }
        packet.push(0);
        packet.extend_from_slice(&[0, 1, 0, 1]);

        assert_eq!(Err(Error::NameTooLong(7)), Message::from_octets(&packet));
    }

    #[test]
    fn rejects_unsupported_question_type() {
        // MX
        let mut packet = header_bytes(7, 1, 0, 0, 0);
        packet.extend_from_slice(b"\x07example\x03com\x00");
        packet.extend_from_slice(&[0, 15, 0, 1]);

        assert_eq!(
            Err(Error::UnsupportedRecordType(7)),
            Message::from_octets(&packet)
        );
    }

    #[test]
    fn rejects_unsupported_record_type_in_answer() {
        // TXT
        let mut packet = header_bytes(7, 0, 1, 0, 0);
        packet.extend_from_slice(b"\x07example\x03com\x00");
        packet.extend_from_slice(&[0, 16, 0, 1]);
        packet.extend_from_slice(&300u32.to_be_bytes());
        packet.extend_from_slice(&[0, 1, b'x']);

        assert_eq!(
            Err(Error::UnsupportedRecordType(7)),
            Message::from_octets(&packet)
        );
    }

    #[test]
    fn rejects_unsupported_class() {
        // CH
        let mut packet = header_bytes(7, 1, 0, 0, 0);
        packet.extend_from_slice(b"\x07example\x03com\x00");
        packet.extend_from_slice(&[0, 1, 0, 3]);

        assert_eq!(
            Err(Error::UnsupportedRecordClass(7)),
            Message::from_octets(&packet)
        );
    }

    #[test]
    fn rejects_a_record_with_wrong_rdlength() {
        let mut packet = header_bytes(7, 0, 1, 0, 0);
        packet.extend_from_slice(b"\x07example\x03com\x00");
        packet.extend_from_slice(&[0, 1, 0, 1]);
        packet.extend_from_slice(&300u32.to_be_bytes());
        packet.extend_from_slice(&[0, 5, 93, 184, 216, 34, 0]);

        assert_eq!(
            Err(Error::ResourceRecordInvalid(7)),
            Message::from_octets(&packet)
        );
    }

    #[test]
    fn truncated_request_still_yields_its_id() {
        let err = Message::from_octets(b"\xab\xcd\x00\x00").unwrap_err();
        assert_eq!(Error::HeaderTooShort(0xabcd), err);
        assert_eq!(Some(0xabcd), err.id());
    }

    #[test]
    fn one_byte_datagram_has_no_id() {
        let err = Message::from_octets(b"\xab").unwrap_err();
        assert_eq!(Error::CompletelyBusted, err);
        assert_eq!(None, err.id());
    }
}
