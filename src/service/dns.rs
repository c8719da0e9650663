use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use pingora_core::{server::ShutdownWatch, services::background::BackgroundService};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    time::timeout,
};

use crate::proxy::{Dispatcher, DnsRequest, Forward, Protocol};

/// Largest UDP answer a client without EDNS is guaranteed to accept.
const MIN_UDP_PAYLOAD: usize = 512;
const MAX_UDP_SIZE: usize = 65535;
/// Idle time after which a client TCP connection is closed.
const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Serves DNS over UDP and TCP on one address, one task per query.
pub struct DnsListener<F> {
    address: SocketAddr,
    dispatcher: Arc<Dispatcher<F>>,
}

impl<F: Forward> DnsListener<F> {
    pub fn new(address: SocketAddr, dispatcher: Arc<Dispatcher<F>>) -> Self {
        Self {
            address,
            dispatcher,
        }
    }

    pub async fn serve_udp(&self, socket: UdpSocket, mut shutdown: ShutdownWatch) {
        let socket = Arc::new(socket);
        let mut buf = vec![0u8; MAX_UDP_SIZE];

        loop {
            let (len, client) = tokio::select! {
                _ = shutdown.changed() => {
                    log::info!("DNS udp listener on {} stopped", self.address);
                    return;
                }
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        log::warn!("Failed to receive udp query on {}: {e}", self.address);
                        continue;
                    }
                },
            };

            let packet = buf[..len].to_vec();
            let socket = socket.clone();
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                let Some(answer) = answer(&dispatcher, &packet, client, Protocol::Udp).await else {
                    return;
                };
                if let Err(e) = socket.send_to(&answer, client).await {
                    log::debug!("Failed to send udp answer to {client}: {e}");
                }
            });
        }
    }

    pub async fn serve_tcp(&self, listener: TcpListener, mut shutdown: ShutdownWatch) {
        loop {
            let (stream, client) = tokio::select! {
                _ = shutdown.changed() => {
                    log::info!("DNS tcp listener on {} stopped", self.address);
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::warn!("Failed to accept tcp connection on {}: {e}", self.address);
                        continue;
                    }
                },
            };

            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move { serve_connection(dispatcher, stream, client).await });
        }
    }
}

#[async_trait]
impl<F: Forward> BackgroundService for DnsListener<F> {
    async fn start(&self, shutdown: ShutdownWatch) {
        let socket = match UdpSocket::bind(self.address).await {
            Ok(socket) => socket,
            Err(e) => {
                log::error!("Unable to bind udp {}: {e}", self.address);
                return;
            }
        };
        let listener = match TcpListener::bind(self.address).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("Unable to bind tcp {}: {e}", self.address);
                return;
            }
        };

        log::info!("DNS listener serving on {}", self.address);
        tokio::join!(
            self.serve_udp(socket, shutdown.clone()),
            self.serve_tcp(listener, shutdown)
        );
    }
}

async fn serve_connection<F: Forward>(
    dispatcher: Arc<Dispatcher<F>>,
    mut stream: TcpStream,
    client: SocketAddr,
) {
    loop {
        let len = match timeout(TCP_IDLE_TIMEOUT, stream.read_u16()).await {
            Ok(Ok(len)) => len,
            // closed, broken or idle
            _ => return,
        };
        let mut packet = vec![0u8; len as usize];
        if stream.read_exact(&mut packet).await.is_err() {
            return;
        }

        let Some(answer) = answer(&dispatcher, &packet, client, Protocol::Tcp).await else {
            return;
        };
        let Ok(len) = u16::try_from(answer.len()) else {
            log::warn!("Dropping oversized tcp answer to {client}");
            return;
        };

        let mut frame = Vec::with_capacity(answer.len() + 2);
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&answer);
        if let Err(e) = stream.write_all(&frame).await {
            log::debug!("Failed to send tcp answer to {client}: {e}");
            return;
        }
    }
}

/// Dispatches one wire query and encodes the answer to send back.
///
/// Returns `None` for packets that are not DNS queries.
pub async fn answer<F: Forward>(
    dispatcher: &Dispatcher<F>,
    packet: &[u8],
    client: SocketAddr,
    protocol: Protocol,
) -> Option<Vec<u8>> {
    let message = match Message::from_vec(packet) {
        Ok(message) if message.message_type() == MessageType::Query => message,
        Ok(_) => {
            log::debug!("Dropping non-query packet from {client}");
            return None;
        }
        Err(e) => {
            log::debug!("Dropping malformed packet from {client}: {e}");
            return None;
        }
    };

    let request = DnsRequest {
        message,
        client,
        protocol,
    };

    let response = match dispatcher.handle(&request, ResponseCode::ServFail).await {
        Ok(exchange) => exchange.response,
        Err(e) => {
            log::warn!("Failed to forward query from {client}: {e}");
            reply(&request.message, ResponseCode::ServFail)
        }
    };

    encode(&request.message, &response, protocol)
}

/// Encodes `response`, replacing UDP answers larger than the client accepts
/// with a truncated header.
fn encode(request: &Message, response: &Message, protocol: Protocol) -> Option<Vec<u8>> {
    let wire = match response.to_vec() {
        Ok(wire) => wire,
        Err(e) => {
            log::warn!("Unable to encode answer {}: {e}", request.id());
            return reply(request, ResponseCode::ServFail).to_vec().ok();
        }
    };

    if protocol == Protocol::Udp && wire.len() > udp_payload_limit(request) {
        let mut truncated = reply(request, response.response_code());
        truncated.set_truncated(true);
        return truncated.to_vec().ok();
    }
    Some(wire)
}

/// An empty answer to `request` carrying its question.
fn reply(request: &Message, rcode: ResponseCode) -> Message {
    let mut message = Message::new();
    message
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(rcode)
        .add_queries(request.queries().to_vec());
    message
}

fn udp_payload_limit(request: &Message) -> usize {
    request
        .extensions()
        .as_ref()
        .map(|edns| usize::from(edns.max_payload()))
        .unwrap_or(MIN_UDP_PAYLOAD)
        .max(MIN_UDP_PAYLOAD)
}

#[cfg(test)]
mod tests {
    use hickory_proto::{
        op::Edns,
        rr::{rdata::TXT, Name, RData, Record, RecordType},
    };
    use tokio::sync::watch;

    use super::*;
    use crate::{
        metrics::RequestObserver,
        proxy::{
            registry::tests::MockForwarder,
            upstream::tests::{query, udp_server},
            DnsForwarder, ForwardOptions, ForwarderRegistry,
        },
    };

    fn client() -> SocketAddr {
        "192.0.2.44:5300".parse().unwrap()
    }

    fn dispatcher_for<F: Forward>(targets: Vec<String>) -> Dispatcher<F> {
        let registry = Arc::new(ForwarderRegistry::new());
        registry
            .replace(
                targets,
                &ForwardOptions {
                    health_check: Duration::ZERO,
                    ..Default::default()
                },
            )
            .unwrap();
        Dispatcher::new(registry, RequestObserver::default())
    }

    #[tokio::test]
    async fn test_forwarding_error_answers_servfail() {
        let dispatcher = dispatcher_for::<MockForwarder>(vec!["10.0.0.1:53".to_string()]);
        let request = query(321, "fail.example.com.");

        let wire = answer(&dispatcher, &request.to_vec().unwrap(), client(), Protocol::Udp)
            .await
            .unwrap();
        let response = Message::from_vec(&wire).unwrap();
        assert_eq!(response.id(), 321);
        assert_eq!(response.message_type(), MessageType::Response);
        assert_eq!(response.response_code(), ResponseCode::ServFail);
        assert_eq!(response.queries(), request.queries());
    }

    #[tokio::test]
    async fn test_malformed_and_response_packets_dropped() {
        let dispatcher = dispatcher_for::<MockForwarder>(vec!["10.0.0.1:53".to_string()]);
        assert!(answer(&dispatcher, b"\x01\x02", client(), Protocol::Udp)
            .await
            .is_none());

        let mut response = query(1, "example.com.");
        response.set_message_type(MessageType::Response);
        let packet = response.to_vec().unwrap();
        assert!(answer(&dispatcher, &packet, client(), Protocol::Udp)
            .await
            .is_none());
    }

    #[test]
    fn test_udp_payload_limit() {
        let mut request = query(1, "example.com.");
        assert_eq!(udp_payload_limit(&request), MIN_UDP_PAYLOAD);

        let mut edns = Edns::new();
        edns.set_max_payload(1232);
        request.set_edns(edns);
        assert_eq!(udp_payload_limit(&request), 1232);

        let mut small = Edns::new();
        small.set_max_payload(100);
        request.set_edns(small);
        assert_eq!(udp_payload_limit(&request), MIN_UDP_PAYLOAD);
    }

    #[test]
    fn test_oversized_udp_answer_truncated() {
        let request = query(77, "big.example.com.");
        let mut big = reply(&request, ResponseCode::NoError);
        for i in 0..40 {
            big.add_answer(Record::from_rdata(
                Name::from_ascii("big.example.com.").unwrap(),
                60,
                RData::TXT(TXT::new(vec![format!("{i:0>30}")])),
            ));
        }
        let full = big.to_vec().unwrap();
        assert!(full.len() > MIN_UDP_PAYLOAD);

        let wire = encode(&request, &big, Protocol::Udp).unwrap();
        assert!(wire.len() <= MIN_UDP_PAYLOAD);
        let decoded = Message::from_vec(&wire).unwrap();
        assert!(decoded.truncated());
        assert!(decoded.answers().is_empty());
        assert_eq!(decoded.id(), 77);
        assert_eq!(decoded.queries()[0].query_type(), RecordType::A);

        // tcp and large enough edns buffers get the whole answer
        assert_eq!(encode(&request, &big, Protocol::Tcp).unwrap(), full);
        let mut edns_request = request.clone();
        let mut edns = Edns::new();
        edns.set_max_payload(4096);
        edns_request.set_edns(edns);
        assert_eq!(encode(&edns_request, &big, Protocol::Udp).unwrap(), full);
    }

    #[tokio::test]
    async fn test_serves_udp_and_tcp() {
        let upstream = udp_server(ResponseCode::NXDomain).await;
        let dispatcher = Arc::new(dispatcher_for::<DnsForwarder>(vec![upstream.to_string()]));

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let udp_addr = socket.local_addr().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tcp_addr = listener.local_addr().unwrap();

        let dns = Arc::new(DnsListener::new(udp_addr, dispatcher));
        let (tx, rx) = watch::channel(false);
        let udp_task = tokio::spawn({
            let dns = dns.clone();
            let rx = rx.clone();
            async move { dns.serve_udp(socket, rx).await }
        });
        let tcp_task = tokio::spawn({
            let dns = dns.clone();
            async move { dns.serve_tcp(listener, rx).await }
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = query(500, "missing.example.com.");
        client
            .send_to(&request.to_vec().unwrap(), udp_addr)
            .await
            .unwrap();
        let mut buf = vec![0u8; 4096];
        let (len, _) = timeout(Duration::from_secs(3), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response = Message::from_vec(&buf[..len]).unwrap();
        assert_eq!(response.id(), 500);
        assert_eq!(response.response_code(), ResponseCode::NXDomain);

        // the upstream only listens on udp, so a tcp client gets SERVFAIL
        let mut stream = TcpStream::connect(tcp_addr).await.unwrap();
        let wire = query(501, "tcp.example.com.").to_vec().unwrap();
        let mut frame = (wire.len() as u16).to_be_bytes().to_vec();
        frame.extend_from_slice(&wire);
        stream.write_all(&frame).await.unwrap();
        let len = timeout(Duration::from_secs(5), stream.read_u16())
            .await
            .unwrap()
            .unwrap();
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).await.unwrap();
        let response = Message::from_vec(&buf).unwrap();
        assert_eq!(response.id(), 501);
        assert_eq!(response.response_code(), ResponseCode::ServFail);

        tx.send(true).unwrap();
        timeout(Duration::from_secs(1), udp_task).await.unwrap().unwrap();
        timeout(Duration::from_secs(1), tcp_task).await.unwrap().unwrap();
    }
}
