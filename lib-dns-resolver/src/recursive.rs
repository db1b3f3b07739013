//! Recursive DNS resolution: iterative descent of the delegation
//! hierarchy from a configured root, chasing referrals and resolving
//! glueless nameserver names as needed.

use async_recursion::async_recursion;
use rand::Rng;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use dns_types::protocol::deserialise;
use dns_types::protocol::types::*;

/// Maximum number of upstream queries a single resolution may make,
/// counted across both referral hops and nameserver-name
/// sub-resolutions.  This bounds the descent when authorities refer
/// to each other forever.
pub const RECURSION_LIMIT: usize = 16;

/// How long to wait for a reply from an upstream nameserver.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// The recursive resolver.  It holds no state beyond its
/// configuration: every resolution opens its own sockets, and caching
/// is the caller's concern.
#[derive(Debug, Clone)]
pub struct Resolver {
    root: SocketAddr,
    request_size: usize,
}

impl Resolver {
    pub fn new(root: SocketAddr, request_size: usize) -> Self {
        Self { root, request_size }
    }

    /// Resolve an already-encoded query, starting from the configured
    /// root.  Returns the first upstream response which has answers.
    ///
    /// # Errors
    ///
    /// If an upstream times out or cannot be reached, a response
    /// cannot be parsed, a response has neither answers nor a usable
    /// referral, or the recursion limit is hit.
    pub async fn resolve(&self, query: &[u8]) -> Result<Message, ResolutionError> {
        self.resolve_from(query, self.root, RECURSION_LIMIT).await
    }

    /// The descent loop: query the target; an answer ends the
    /// resolution, a referral picks a new target.  `depth` is the
    /// remaining query budget, shared with sub-resolutions.
    #[async_recursion]
    async fn resolve_from(
        &self,
        query: &[u8],
        mut target: SocketAddr,
        mut depth: usize,
    ) -> Result<Message, ResolutionError> {
        loop {
            if depth == 0 {
                tracing::debug!("hit recursion limit");
                return Err(ResolutionError::DepthLimit);
            }
            depth -= 1;

            let response = self.exchange(query, target).await?;

            if response.header.ancount > 0 {
                return Ok(response);
            }
            if response.authority.is_empty() {
                return Err(ResolutionError::DeadEnd);
            }

            match self.referral_target(&response, depth).await {
                Some(address) => {
                    target = SocketAddr::new(IpAddr::V4(address), self.root.port());
                }
                None => return Err(ResolutionError::DeadEnd),
            }
        }
    }

    /// Pick the next server from a referral: the first A record in
    /// the additional section is taken as glue; with no glue, the
    /// authority nameserver names are resolved from the root, in
    /// order, until one yields an address.
    async fn referral_target(&self, referral: &Message, depth: usize) -> Option<Ipv4Addr> {
        for rr in &referral.additional {
            if let RecordData::A(address) = rr.rdata {
                tracing::trace!(nameserver = %rr.name, %address, "following glue");
                return Some(address);
            }
        }

        for rr in &referral.authority {
            if let RecordData::Ns(nsdname) = &rr.rdata {
                if let Some(address) = self.resolve_nameserver(nsdname, depth).await {
                    return Some(address);
                }
            }
        }

        None
    }

    /// Resolve a glueless nameserver name to an address with a fresh
    /// A query, issued from the root.
    async fn resolve_nameserver(&self, nsdname: &DomainName, depth: usize) -> Option<Ipv4Addr> {
        tracing::trace!(nameserver = %nsdname, "resolving glueless nameserver");

        let query = Message::query(
            rand::thread_rng().gen(),
            nsdname.clone(),
            RecordType::A,
            RecordClass::IN,
        );
        let octets = match query.into_octets() {
            Ok(octets) => octets,
            Err(error) => {
                tracing::warn!(%error, "could not serialise nameserver query");
                return None;
            }
        };

        match self.resolve_from(&octets, self.root, depth).await {
            Ok(response) => response.answers.iter().find_map(|rr| match rr.rdata {
                RecordData::A(address) => Some(address),
                _ => None,
            }),
            Err(error) => {
                tracing::debug!(nameserver = %nsdname, %error, "could not resolve nameserver");
                None
            }
        }
    }

    /// One question-response exchange with an upstream server, with a
    /// 5s timeout.
    async fn exchange(
        &self,
        query: &[u8],
        target: SocketAddr,
    ) -> Result<Message, ResolutionError> {
        match timeout(UPSTREAM_TIMEOUT, self.exchange_notimeout(query, target)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!(%target, "upstream timed out");
                Err(ResolutionError::Timeout)
            }
        }
    }

    /// Timeout-less version of `exchange`.  The socket is fresh per
    /// exchange and dropped on every exit path.
    async fn exchange_notimeout(
        &self,
        query: &[u8],
        target: SocketAddr,
    ) -> Result<Message, ResolutionError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(target).await?;
        socket.send(query).await?;

        let mut buffer = vec![0u8; self.request_size];
        let received = socket.recv(&mut buffer).await?;

        Message::from_octets(&buffer[..received]).map_err(ResolutionError::Decode)
    }
}

/// An error that can occur when trying to resolve a query.
#[derive(Debug)]
pub enum ResolutionError {
    /// An upstream nameserver did not reply within the timeout.
    Timeout,

    /// Referral chasing exceeded the recursion limit.
    DepthLimit,

    /// An upstream response had neither answers nor a usable
    /// referral.
    DeadEnd,

    /// A socket operation failed.
    Network(io::Error),

    /// An upstream response could not be parsed.
    Decode(deserialise::Error),
}

impl std::fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ResolutionError::Timeout => write!(f, "upstream timed out"),
            ResolutionError::DepthLimit => write!(f, "referral chain too long"),
            ResolutionError::DeadEnd => write!(f, "no answers and no usable referral"),
            ResolutionError::Network(error) => write!(f, "network error: {error}"),
            ResolutionError::Decode(error) => write!(f, "could not parse upstream response: {error}"),
        }
    }
}

impl std::error::Error for ResolutionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ResolutionError::Network(error) => Some(error),
            ResolutionError::Decode(error) => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for ResolutionError {
    fn from(error: io::Error) -> Self {
        ResolutionError::Network(error)
    }
}
