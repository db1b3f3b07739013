//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.

use crate::protocol::types::*;

impl Message {
    /// Serialise to a datagram.
    ///
    /// # Errors
    ///
    /// If a section holds more than 65535 entries.
    pub fn into_octets(self) -> Result<Vec<u8>, Error> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer)?;
        Ok(buffer.octets)
    }

    /// # Errors
    ///
    /// If a section holds more than 65535 entries.
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        // the counts are always recomputed from the sections, never
        // copied from the header
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authority.len())?;
        let arcount = usize_to_u16(self.additional.len())?;

        buffer.write_u16(self.header.id);
        buffer.write_u16(self.header.flags);
        buffer.write_u16(qdcount);
        buffer.write_u16(ancount);
        buffer.write_u16(nscount);
        buffer.write_u16(arcount);

        for question in self.questions {
            question.serialise(buffer);
        }
        for rr in self.answers {
            rr.serialise(buffer);
        }
        for rr in self.authority {
            rr.serialise(buffer);
        }
        for rr in self.additional {
            rr.serialise(buffer);
        }

        Ok(())
    }
}

impl Question {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        self.name.serialise(buffer);
        buffer.write_u16(self.qtype.into());
        buffer.write_u16(self.qclass.into());
    }
}

impl ResourceRecord {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        let rtype = self.rtype();

        self.name.serialise(buffer);
        buffer.write_u16(rtype.into());
        buffer.write_u16(self.rclass.into());
        buffer.write_u32(self.ttl);

        // filled in below, once the encoded rdata length is known
        let rdlength_index = buffer.index();
        buffer.write_u16(0);

        match self.rdata {
            RecordData::A(address) => buffer.write_octets(&address.octets()),
            RecordData::Ns(nsdname) => nsdname.serialise(buffer),
            RecordData::Ptr(ptrdname) => ptrdname.serialise(buffer),
            RecordData::Aaaa(address) => buffer.write_octets(&address.octets()),
        }

        // -2 so the two rdlength octets are not counted; cannot
        // overflow as names are at most 255 octets and addresses 16
        let rdlength = u16::try_from(buffer.index() - rdlength_index - 2).unwrap_or(u16::MAX);
        let [hi, lo] = rdlength.to_be_bytes();
        buffer.octets[rdlength_index] = hi;
        buffer.octets[rdlength_index + 1] = lo;
    }
}

impl DomainName {
    /// Names are always emitted uncompressed, which RFC 1035 permits.
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_octets(&self.octets);
    }
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// A counter does not fit in the desired width.
    CounterTooLarge { counter: usize, bits: u32 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CounterTooLarge { counter, bits } => {
                write!(f, "'{counter}' cannot be converted to a u{bits}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which can be written to, for serialisation purposes.
pub struct WritableBuffer {
    pub octets: Vec<u8>,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: Vec::with_capacity(512),
        }
    }
}

impl WritableBuffer {
    pub fn index(&self) -> usize {
        self.octets.len()
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.push(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.octets.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.octets.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        self.octets.extend_from_slice(octets);
    }
}

/// Helper function to convert a `usize` into a `u16` (or return an error).
fn usize_to_u16(counter: usize) -> Result<u16, Error> {
    u16::try_from(counter).map_err(|_| Error::CounterTooLarge {
        counter,
        bits: u16::BITS,
    })
}
