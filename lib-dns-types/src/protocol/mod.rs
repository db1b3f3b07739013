//! DNS wire format: value types, deserialisation, and serialisation
//! for the subset of RFC 1035 this resolver speaks (A, NS, PTR, and
//! AAAA records, class IN, UDP framing).

pub mod deserialise;
pub mod serialise;
pub mod types;
