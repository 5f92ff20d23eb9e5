//! Broker publishing over `rumqttc`.
//!
//! The blocking client only queues requests; a worker thread drives the
//! connection so keep-alive pings go out while the caller is busy polling
//! sensors. Once the connection fails the worker stops and further
//! publishes report an error instead of being dropped.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rumqttc::{
    Client, ConnectReturnCode, Connection, ConnectionError, Event, MqttOptions, Outgoing, Packet,
    QoS,
};
use tracing::{debug, trace, warn};

use super::{PublishError, Publisher};

/// Requests buffered between the client and the connection worker.
const REQUEST_CAPACITY: usize = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerSettings {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    /// How long to wait for the broker's CONNACK.
    pub connect_timeout: Duration,
}

impl BrokerSettings {
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            client_id: client_id.into(),
            host: host.into(),
            port,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        // rumqttc refuses keep-alives below one second
        options.set_keep_alive(self.keep_alive.max(Duration::from_secs(1)));
        options.set_clean_session(true);
        options
    }
}

pub struct MqttPublisher {
    client: Client,
    worker: Option<JoinHandle<()>>,
}

impl MqttPublisher {
    /// Connect and wait for the broker to accept the session.
    pub fn connect(settings: &BrokerSettings) -> Result<Self, PublishError> {
        debug!(
            host = %settings.host,
            port = settings.port,
            client_id = %settings.client_id,
            "connecting to broker"
        );
        let (client, mut connection) = Client::new(settings.options(), REQUEST_CAPACITY);

        let deadline = Instant::now() + settings.connect_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(PublishError::Timeout(settings.connect_timeout));
            }
            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(PublishError::Rejected(format!("{:?}", ack.code)));
                    }
                    break;
                }
                Ok(Ok(event)) => trace!(?event, "mqtt event"),
                Ok(Err(ConnectionError::ConnectionRefused(code))) => {
                    return Err(PublishError::Rejected(format!("{:?}", code)))
                }
                Ok(Err(e)) => return Err(PublishError::Connection(e)),
                Err(_) => return Err(PublishError::Timeout(settings.connect_timeout)),
            }
        }

        let worker = thread::Builder::new()
            .name("mqtt-connection".to_string())
            .spawn(move || drive(connection))?;
        Ok(Self {
            client,
            worker: Some(worker),
        })
    }

    /// Flush queued messages, send DISCONNECT and wait for the worker.
    pub fn disconnect(mut self) -> Result<(), PublishError> {
        let sent = self.client.disconnect();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        sent?;
        Ok(())
    }
}

impl Publisher for MqttPublisher {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        debug!(topic, bytes = payload.len(), "publishing");
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())?;
        Ok(())
    }
}

fn drive(mut connection: Connection) {
    for event in connection.iter() {
        match event {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("disconnected from broker");
                break;
            }
            Ok(event) => trace!(?event, "mqtt event"),
            Err(e) => {
                warn!(error = %e, "broker connection lost");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;

    const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    /// One control packet: the fixed header byte and the body.
    fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let mut header = [0u8; 1];
        stream.read_exact(&mut header).ok()?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let mut byte = [0u8; 1];
            stream.read_exact(&mut byte).ok()?;
            len |= usize::from(byte[0] & 0x7f) << shift;
            if byte[0] & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).ok()?;
        Some((header[0], body))
    }

    /// Accepts one client, answers CONNECT with `connack` and PINGREQ with
    /// PINGRESP, and reports every packet type it receives.
    fn broker(connack: [u8; 4]) -> (u16, mpsc::Receiver<u8>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            while let Some((header, _)) = read_packet(&mut stream) {
                let kind = header & 0xf0;
                match kind {
                    0x10 => stream.write_all(&connack).unwrap(),
                    0xc0 => stream.write_all(&[0xd0, 0x00]).unwrap(),
                    _ => {}
                }
                if tx.send(kind).is_err() {
                    break;
                }
            }
        });
        (port, rx)
    }

    fn settings(port: u16) -> BrokerSettings {
        BrokerSettings::new("mitemp-test", "127.0.0.1", port)
            .with_keep_alive(Duration::from_secs(1))
    }

    #[test]
    fn test_idle_session_is_kept_alive() {
        let (port, packets) = broker(CONNACK_ACCEPTED);
        let mut publisher = MqttPublisher::connect(&settings(port)).unwrap();
        assert_eq!(packets.recv_timeout(Duration::from_secs(5)).unwrap(), 0x10);

        // a long sensor poll: nothing is published for a while
        assert_eq!(packets.recv_timeout(Duration::from_secs(5)).unwrap(), 0xc0);

        publisher.publish("OpenCH/a/TeHu/b/Evt/Status", b"{}").unwrap();
        publisher.disconnect().unwrap();
        let rest: Vec<u8> = packets.iter().filter(|kind| *kind != 0xc0).collect();
        assert_eq!(rest, vec![0x30, 0xe0]);
    }

    #[test]
    fn test_rejected_session() {
        let (port, _packets) = broker([0x20, 0x02, 0x00, 0x05]);
        let err = MqttPublisher::connect(&settings(port)).err().unwrap();
        assert!(matches!(err, PublishError::Rejected(_)), "{err}");
    }

    #[test]
    fn test_unreachable_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(MqttPublisher::connect(&settings(port)).is_err());
    }

    #[test]
    fn test_publish_after_connection_loss_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_packet(&mut stream).unwrap();
            stream.write_all(&CONNACK_ACCEPTED).unwrap();
        });
        let mut publisher = MqttPublisher::connect(&settings(port)).unwrap();
        server.join().unwrap();

        // the worker notices the closed socket and stops
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut result = Ok(());
        while Instant::now() < deadline {
            result = publisher.publish("a/b", b"{}");
            if result.is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        assert!(result.is_err());
    }
}
