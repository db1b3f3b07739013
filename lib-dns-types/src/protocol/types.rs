use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Maximum length of a single label, in octets.
pub const LABEL_MAX_LEN: usize = 63;

/// Maximum length of a domain name on the wire, including both length
/// and label octets.
pub const DOMAINNAME_MAX_LEN: usize = 255;

/// QR flag: this message is a response.
pub const FLAG_RESPONSE: u16 = 1 << 15;

/// RD flag: recursion desired.
pub const FLAG_RECURSION_DESIRED: u16 = 1 << 8;

/// RCODE 4, "not implemented".
pub const RCODE_NOT_IMPLEMENTED: u16 = 4;

/// Flags word of an outbound query: RD set, everything else clear.
pub const FLAGS_QUERY: u16 = FLAG_RECURSION_DESIRED;

/// Flags word of a normal response: QR and RD set.
pub const FLAGS_RESPONSE: u16 = FLAG_RESPONSE | FLAG_RECURSION_DESIRED;

/// Flags word of an error response: QR set, RCODE 4.
pub const FLAGS_NOT_IMPLEMENTED: u16 = FLAG_RESPONSE | RCODE_NOT_IMPLEMENTED;

/// Basic DNS message format, used for both queries and responses.
///
/// ```text
///     +---------------------+
///     |        Header       |
///     +---------------------+
///     |       Question      | the question for the name server
///     +---------------------+
///     |        Answer       | RRs answering the question
///     +---------------------+
///     |      Authority      | RRs pointing toward an authority
///     +---------------------+
///     |      Additional     | RRs holding additional information
///     +---------------------+
/// ```
///
/// The order of records within each section is preserved from the
/// wire.  See section 4.1 of RFC 1035.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl Message {
    /// An outbound query: one question, RD set, all record sections
    /// empty.
    pub fn query(id: u16, name: DomainName, qtype: RecordType, qclass: RecordClass) -> Self {
        Self {
            header: Header {
                id,
                flags: FLAGS_QUERY,
                qdcount: 1,
                ancount: 0,
                nscount: 0,
                arcount: 0,
            },
            questions: vec![Question {
                name,
                qtype,
                qclass,
            }],
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    /// A response to a client: the request's id, its questions echoed
    /// verbatim, and the accumulated answers.  Authority and
    /// additional sections are never populated.
    pub fn response(
        request: Header,
        questions: Vec<Question>,
        answers: Vec<ResourceRecord>,
    ) -> Self {
        Self {
            header: Header {
                id: request.id,
                flags: FLAGS_RESPONSE,
                qdcount: section_count(questions.len()),
                ancount: section_count(answers.len()),
                nscount: 0,
                arcount: 0,
            },
            questions,
            answers,
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    /// An error response: only an id to echo and the "not
    /// implemented" rcode, no body at all.  This is the reply to
    /// requests which cannot be parsed, so it needs nothing from the
    /// request beyond its first two bytes.
    pub fn not_implemented(id: u16) -> Self {
        Self {
            header: Header {
                id,
                flags: FLAGS_NOT_IMPLEMENTED,
                qdcount: 0,
                ancount: 0,
                nscount: 0,
                arcount: 0,
            },
            questions: Vec::new(),
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }
}

/// Common header type for all messages: six 16-bit fields.
///
/// ```text
///                                     1  1  1  1  1  1
///       0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                      ID                       |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    QDCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    ANCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    NSCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    ARCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// ```
///
/// The flags word is opaque on parse and composed bit-wise on emit
/// from the `FLAGS_*` constants: only QR, RD, and the RCODE field are
/// ever set by this resolver.
///
/// See section 4.1.1 of RFC 1035.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Header {
    /// A 16 bit identifier assigned by the program that generates any
    /// kind of query.  This identifier is copied into the
    /// corresponding reply and can be used by the requester to match
    /// up replies to outstanding queries.
    pub id: u16,

    /// The QR / opcode / AA / TC / RD / RA / Z / RCODE word, kept as
    /// a single opaque value.
    pub flags: u16,

    /// Number of entries in the question section.
    pub qdcount: u16,

    /// Number of resource records in the answer section.
    pub ancount: u16,

    /// Number of resource records in the authority section.
    pub nscount: u16,

    /// Number of resource records in the additional section.
    pub arcount: u16,
}

/// A single entry in the question section.
///
/// See section 4.1.2 of RFC 1035.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Question {
    pub name: DomainName,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.qclass, self.qtype)
    }
}

/// A single resource record, as found in the answer, authority, and
/// additional sections.  The RDLENGTH field is not kept: it is
/// recomputed from the rdata whenever the record is serialised.
///
/// See section 4.1.3 of RFC 1035.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// The domain name this record pertains to.
    pub name: DomainName,

    /// The decoded RDATA, which also determines the record type.
    pub rdata: RecordData,

    /// The class of the data in the RDATA field.
    pub rclass: RecordClass,

    /// How many seconds this record may be cached for.
    pub ttl: u32,
}

impl ResourceRecord {
    pub fn rtype(&self) -> RecordType {
        self.rdata.rtype()
    }
}

/// A record type with its associated, deserialised, data.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RecordData {
    /// A 32 bit Internet address.
    A(Ipv4Addr),

    /// A domain name which specifies a host which should be
    /// authoritative for the specified class and domain.
    Ns(DomainName),

    /// A domain name which points to some location in the domain name
    /// space.
    Ptr(DomainName),

    /// A 128 bit Internet address.
    Aaaa(Ipv6Addr),
}

impl RecordData {
    pub fn rtype(&self) -> RecordType {
        match self {
            RecordData::A(_) => RecordType::A,
            RecordData::Ns(_) => RecordType::NS,
            RecordData::Ptr(_) => RecordType::PTR,
            RecordData::Aaaa(_) => RecordType::AAAA,
        }
    }
}

impl fmt::Display for RecordData {
    /// The canonical text forms: dotted quad for A, dotted name for
    /// NS and PTR, and eight colon-separated lowercase 4-hex-digit
    /// groups (never `::`-compressed) for AAAA.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordData::A(address) => write!(f, "{address}"),
            RecordData::Ns(nsdname) => write!(f, "{nsdname}"),
            RecordData::Ptr(ptrdname) => write!(f, "{ptrdname}"),
            RecordData::Aaaa(address) => {
                let [a, b, c, d, e, g, h, i] = address.segments();
                write!(f, "{a:04x}:{b:04x}:{c:04x}:{d:04x}:{e:04x}:{g:04x}:{h:04x}:{i:04x}")
            }
        }
    }
}

/// An unrecognised wire value in a field with a fixed set of
/// meaningful values.  Carries the offending value.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct UnsupportedValue(pub u16);

/// The record types this resolver handles.  Any other value on the
/// wire fails the whole packet at parse time.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    A,
    NS,
    PTR,
    AAAA,
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::NS => write!(f, "NS"),
            RecordType::PTR => write!(f, "PTR"),
            RecordType::AAAA => write!(f, "AAAA"),
        }
    }
}

impl TryFrom<u16> for RecordType {
    type Error = UnsupportedValue;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RecordType::A),
            2 => Ok(RecordType::NS),
            12 => Ok(RecordType::PTR),
            28 => Ok(RecordType::AAAA),
            _ => Err(UnsupportedValue(value)),
        }
    }
}

impl From<RecordType> for u16 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::A => 1,
            RecordType::NS => 2,
            RecordType::PTR => 12,
            RecordType::AAAA => 28,
        }
    }
}

/// Record classes.  Only IN is handled; any other value on the wire
/// fails the whole packet at parse time.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RecordClass {
    IN,
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordClass::IN => write!(f, "IN"),
        }
    }
}

impl TryFrom<u16> for RecordClass {
    type Error = UnsupportedValue;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(RecordClass::IN),
            _ => Err(UnsupportedValue(value)),
        }
    }
}

impl From<RecordClass> for u16 {
    fn from(value: RecordClass) -> Self {
        match value {
            RecordClass::IN => 1,
        }
    }
}

/// A domain name: a sequence of labels, each a length octet followed
/// by that many octets.  Labels are ASCII and at most 63 octets; the
/// whole name is at most 255 octets on the wire, including the
/// terminating zero.  Names are lowercased on construction so that
/// comparison and cache lookup are case-insensitive.
///
/// `octets` is the uncompressed wire form and `labels` the decoded
/// form (ending with the empty root label); the two always agree.
#[derive(Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DomainName {
    pub octets: Vec<u8>,
    pub labels: Vec<Vec<u8>>,
}

impl DomainName {
    pub fn root_domain() -> Self {
        DomainName {
            octets: vec![0],
            labels: vec![Vec::new()],
        }
    }

    pub fn is_root(&self) -> bool {
        self.octets.len() == 1
    }

    /// The dotted ASCII form, with a trailing dot: `"example.com."`,
    /// or `"."` for the root.
    pub fn to_dotted_string(&self) -> String {
        if self.is_root() {
            return ".".to_string();
        }

        let mut out = String::with_capacity(self.octets.len());
        for label in &self.labels {
            for octet in label {
                out.push(*octet as char);
            }
            if !label.is_empty() {
                out.push('.');
            }
        }
        out
    }

    /// Parse a dotted string, with or without the trailing dot.
    /// Returns `None` if any label is empty, non-ASCII, or too long,
    /// or if the whole name is too long.
    pub fn from_dotted_string(s: &str) -> Option<Self> {
        if s.is_empty() || s == "." {
            return Some(Self::root_domain());
        }

        let stripped = s.strip_suffix('.').unwrap_or(s);
        let mut labels = stripped
            .split('.')
            .map(|label| label.as_bytes().to_vec())
            .collect::<Vec<Vec<u8>>>();
        if labels.iter().any(Vec::is_empty) {
            return None;
        }
        labels.push(Vec::new());

        Self::from_labels(labels)
    }

    /// Build a name from labels, which must end with the empty root
    /// label.  Mixed-case input is lowercased.
    pub fn from_labels(mixed_case_labels: Vec<Vec<u8>>) -> Option<Self> {
        match mixed_case_labels.split_last() {
            Some((last, _)) if last.is_empty() => (),
            _ => return None,
        }

        let mut labels = Vec::<Vec<u8>>::with_capacity(mixed_case_labels.len());
        let mut octets = Vec::<u8>::with_capacity(DOMAINNAME_MAX_LEN);

        for (i, mc_label) in mixed_case_labels.iter().enumerate() {
            if mc_label.is_empty() {
                if i != mixed_case_labels.len() - 1 {
                    return None;
                }
                break;
            }
            if mc_label.len() > LABEL_MAX_LEN {
                return None;
            }

            octets.push(u8::try_from(mc_label.len()).ok()?);
            let mut label = Vec::<u8>::with_capacity(mc_label.len());
            for octet in mc_label {
                if !octet.is_ascii() {
                    return None;
                }
                let octet = octet.to_ascii_lowercase();
                label.push(octet);
                octets.push(octet);
            }
            labels.push(label);
        }

        octets.push(0);
        labels.push(Vec::new());

        if octets.len() <= DOMAINNAME_MAX_LEN {
            Some(Self { octets, labels })
        } else {
            None
        }
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_dotted_string())
    }
}

impl fmt::Debug for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainName")
            .field("to_dotted_string()", &self.to_dotted_string())
            .finish()
    }
}

/// `u16::MAX` stands in for oversized section counts here: the
/// serialiser recomputes and validates the real counts, so a
/// truncated count never reaches the wire.
fn section_count(len: usize) -> u16 {
    u16::try_from(len).unwrap_or(u16::MAX)
}


#[cfg(any(feature = "test-util", test))]
pub mod test_util {
    use super::*;

    pub fn domain(name: &str) -> DomainName {
        DomainName::from_dotted_string(name).unwrap()
    }

    pub fn a_record(name: &str, address: Ipv4Addr, ttl: u32) -> ResourceRecord {
        ResourceRecord {
            name: domain(name),
            rdata: RecordData::A(address),
            rclass: RecordClass::IN,
            ttl,
        }
    }

    pub fn aaaa_record(name: &str, address: Ipv6Addr, ttl: u32) -> ResourceRecord {
        ResourceRecord {
            name: domain(name),
            rdata: RecordData::Aaaa(address),
            rclass: RecordClass::IN,
            ttl,
        }
    }

    pub fn ns_record(superdomain_name: &str, nameserver_name: &str, ttl: u32) -> ResourceRecord {
        ResourceRecord {
            name: domain(superdomain_name),
            rdata: RecordData::Ns(domain(nameserver_name)),
            rclass: RecordClass::IN,
            ttl,
        }
    }

    pub fn ptr_record(name: &str, target_name: &str, ttl: u32) -> ResourceRecord {
        ResourceRecord {
            name: domain(name),
            rdata: RecordData::Ptr(domain(target_name)),
            rclass: RecordClass::IN,
            ttl,
        }
    }
}
