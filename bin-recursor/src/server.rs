use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

use dns_resolver::{Resolver, SharedCache};
use dns_types::protocol::types::*;

use crate::settings::Settings;

/// The UDP server: owns the listening socket, decodes datagrams, and
/// dispatches each one to its own task so a slow resolution cannot
/// head-of-line-block other clients.
pub struct Server {
    socket: Arc<UdpSocket>,
    cache: SharedCache,
    resolver: Arc<Resolver>,
    request_size: usize,
}

impl Server {
    /// Bind the listening socket.
    pub async fn bind(settings: &Settings, cache: SharedCache) -> io::Result<Self> {
        let socket = UdpSocket::bind((settings.server_ip, settings.server_port)).await?;
        let resolver = Resolver::new(
            SocketAddr::from((settings.root_server_ip, settings.root_server_port)),
            settings.request_size,
        );

        Ok(Self {
            socket: Arc::new(socket),
            cache,
            resolver: Arc::new(resolver),
            request_size: settings.request_size,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The receive loop.  Runs until the socket is closed.
    pub async fn run(&self) {
        let mut buffer = vec![0u8; self.request_size];

        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((received, peer)) => {
                    tracing::debug!(?peer, "request");
                    let datagram = BytesMut::from(&buffer[..received]);
                    let socket = Arc::clone(&self.socket);
                    let cache = self.cache.clone();
                    let resolver = Arc::clone(&self.resolver);
                    tokio::spawn(async move {
                        handle_datagram(&socket, &cache, &resolver, &datagram, peer).await;
                    });
                }
                Err(error) => tracing::warn!(?error, "UDP receive error"),
            }
        }
    }
}

async fn handle_datagram(
    socket: &UdpSocket,
    cache: &SharedCache,
    resolver: &Resolver,
    datagram: &[u8],
    peer: SocketAddr,
) {
    let response = match Message::from_octets(datagram) {
        Ok(request) => Some(handle_request(cache, resolver, request).await),
        Err(error) => {
            tracing::debug!(?peer, %error, "could not decode request");
            // the id is the datagram's first two octets; a datagram
            // too short to hold even that gets no reply at all
            error.id().map(Message::not_implemented)
        }
    };

    if let Some(response) = response {
        match response.into_octets() {
            Ok(octets) => {
                if let Err(error) = socket.send_to(&octets, peer).await {
                    tracing::debug!(?peer, ?error, "UDP send error");
                }
            }
            Err(error) => tracing::warn!(?peer, %error, "could not serialise response"),
        }
    }
}

/// Answer every question in the request and echo the questions back
/// alongside the concatenated answers, in question order.
async fn handle_request(cache: &SharedCache, resolver: &Resolver, request: Message) -> Message {
    let mut answers = Vec::new();

    for question in &request.questions {
        answers.extend(resolve_question(cache, resolver, request.header.id, question).await);
    }

    Message::response(request.header, request.questions, answers)
}

/// Answer one question: from the cache if it can, by recursive
/// resolution otherwise.  A failed resolution contributes zero
/// answers rather than failing the whole request.
async fn resolve_question(
    cache: &SharedCache,
    resolver: &Resolver,
    id: u16,
    question: &Question,
) -> Vec<ResourceRecord> {
    if let Some(records) = cache.get(&question.name, question.qtype) {
        tracing::debug!(%question, "cache hit");
        return records.to_vec();
    }

    tracing::debug!(%question, "resolving");
    let query = Message::query(id, question.name.clone(), question.qtype, question.qclass);
    let octets = match query.into_octets() {
        Ok(octets) => octets,
        Err(error) => {
            tracing::warn!(%question, %error, "could not serialise query");
            return Vec::new();
        }
    };

    match resolver.resolve(&octets).await {
        Ok(response) => {
            if !response.answers.is_empty() {
                cache.put(
                    question.name.clone(),
                    question.qtype,
                    response.answers.clone(),
                );
            }
            response.answers
        }
        Err(error) => {
            tracing::warn!(%question, %error, "resolution failed");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use dns_types::protocol::types::test_util::*;

    use super::*;

    #[tokio::test]
    async fn a_lookup_end_to_end() {
        let root = spawn_upstream().await;
        let (address, _dir) = start_server(root.address).await;
        let client = client_socket(address).await;

        client.send(&example_com_query(0x1234)).await.unwrap();
        let response = receive_message(&client).await;

        assert_eq!(0x1234, response.header.id);
        assert_eq!(0x8100, response.header.flags);
        assert_eq!(1, response.header.qdcount);
        assert_eq!(1, response.header.ancount);
        assert_eq!(domain("example.com."), response.questions[0].name);
        assert_eq!(
            RecordData::A(Ipv4Addr::new(93, 184, 216, 34)),
            response.answers[0].rdata
        );
        assert_eq!(3600, response.answers[0].ttl);
    }

    #[tokio::test]
    async fn identical_lookup_is_served_from_cache() {
        let root = spawn_upstream().await;
        let (address, _dir) = start_server(root.address).await;
        let client = client_socket(address).await;

        client.send(&example_com_query(1)).await.unwrap();
        let first = receive_message(&client).await;

        client.send(&example_com_query(2)).await.unwrap();
        let second = receive_message(&client).await;

        assert_eq!(first.answers, second.answers);
        // no outbound traffic between the two lookups
        assert_eq!(1, root.queries.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn malformed_request_yields_not_implemented() {
        let (address, _dir) = start_server(unreachable_root()).await;
        let client = client_socket(address).await;

        client.send(b"\xab\xcd\x00\x00").await.unwrap();
        let response = receive_message(&client).await;

        assert_eq!(0xabcd, response.header.id);
        assert_eq!(0x8004, response.header.flags);
        assert_eq!(0, response.header.qdcount);
        assert_eq!(0, response.header.ancount);
        assert_eq!(0, response.header.nscount);
        assert_eq!(0, response.header.arcount);
    }

    #[tokio::test]
    async fn unsupported_qtype_yields_not_implemented() {
        let (address, _dir) = start_server(unreachable_root()).await;
        let client = client_socket(address).await;

        // an MX question, which the decoder rejects
        let mut query = Vec::new();
        query.extend_from_slice(&[0x0b, 0xad, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]);
        query.extend_from_slice(b"\x07example\x03com\x00");
        query.extend_from_slice(&[0, 15, 0, 1]);

        client.send(&query).await.unwrap();
        let response = receive_message(&client).await;

        assert_eq!(0x0bad, response.header.id);
        assert_eq!(0x8004, response.header.flags);
    }

    struct TestUpstream {
        address: SocketAddr,
        queries: Arc<AtomicUsize>,
    }

    /// A root which answers every query with one A record for
    /// example.com, counting the queries it gets.
    async fn spawn_upstream() -> TestUpstream {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let address = socket.local_addr().unwrap();
        let queries = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&queries);

        tokio::spawn(async move {
            let mut buffer = vec![0u8; 512];
            loop {
                let Ok((received, peer)) = socket.recv_from(&mut buffer).await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let query = Message::from_octets(&buffer[..received]).unwrap();
                let response = Message::response(
                    query.header,
                    query.questions.clone(),
                    vec![a_record(
                        "example.com.",
                        Ipv4Addr::new(93, 184, 216, 34),
                        3600,
                    )],
                );
                let _ = socket.send_to(&response.into_octets().unwrap(), peer).await;
            }
        });

        TestUpstream { address, queries }
    }

    /// A root address which is never queried in the test.
    fn unreachable_root() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 1))
    }

    async fn start_server(root: SocketAddr) -> (SocketAddr, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let root_ip = match root.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => unreachable!(),
        };
        let settings = Settings {
            server_ip: Ipv4Addr::LOCALHOST,
            server_port: 0,
            root_server_ip: root_ip,
            root_server_port: root.port(),
            cache_filepath: dir.path().join("cache.bin"),
            ..Settings::default()
        };

        let cache = SharedCache::new(&settings.cache_filepath);
        let server = Server::bind(&settings, cache).await.unwrap();
        let address = server.local_addr().unwrap();
        tokio::spawn(async move { server.run().await });

        (address, dir)
    }

    async fn client_socket(server: SocketAddr) -> UdpSocket {
        let client = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        client.connect(server).await.unwrap();
        client
    }

    async fn receive_message(client: &UdpSocket) -> Message {
        let mut buffer = vec![0u8; 512];
        let received = client.recv(&mut buffer).await.unwrap();
        Message::from_octets(&buffer[..received]).unwrap()
    }

    fn example_com_query(id: u16) -> Vec<u8> {
        Message::query(id, domain("example.com."), RecordType::A, RecordClass::IN)
            .into_octets()
            .unwrap()
    }
}
