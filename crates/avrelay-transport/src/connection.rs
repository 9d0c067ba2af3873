//! RTMP session over TCP: URL parsing, handshake, connect, publish and play.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use rml_rtmp::handshake::{Handshake, HandshakeProcessResult, PeerType};
use rml_rtmp::sessions::{
    ClientSession, ClientSessionConfig, ClientSessionEvent, ClientSessionResult,
    PublishRequestType, StreamMetadata,
};
use rml_rtmp::time::RtmpTimestamp;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, instrument, trace};
use url::Url;

use crate::error::TransportError;
use crate::{TransportResult, DEFAULT_RTMP_PORT, READ_BUFFER_SIZE};

/// A parsed `rtmp://host[:port]/app/stream` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtmpUrl {
    pub host: String,
    pub port: u16,
    pub app: String,
    pub stream_key: String,
}

impl RtmpUrl {
    /// Parse and validate an RTMP URL. The last path segment (with any query)
    /// is the stream key; everything before it is the application.
    pub fn parse(input: &str) -> TransportResult<Self> {
        let parsed = Url::parse(input).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        if parsed.scheme() == "rtsp" {
            return Err(TransportError::InvalidUrl(
                "rtsp is not supported; publish to an RTMP ingest of the same server".to_string(),
            ));
        }
        if parsed.scheme() != "rtmp" {
            return Err(TransportError::InvalidUrl(format!(
                "scheme {} is not rtmp",
                parsed.scheme()
            )));
        }

        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| TransportError::InvalidUrl("Missing host".to_string()))?
            .to_string();
        let port = parsed.port().unwrap_or(DEFAULT_RTMP_PORT);

        let path = parsed.path().trim_matches('/');
        let (app, key) = path
            .rsplit_once('/')
            .ok_or_else(|| TransportError::InvalidUrl("URL path must be /app/stream".to_string()))?;
        if app.is_empty() || key.is_empty() {
            return Err(TransportError::InvalidUrl(
                "Missing application or stream name".to_string(),
            ));
        }

        let stream_key = match parsed.query() {
            Some(query) => format!("{key}?{query}"),
            None => key.to_string(),
        };

        Ok(Self {
            host,
            port,
            app: app.to_string(),
            stream_key,
        })
    }

    /// Application base URL, in `tcUrl` form.
    pub fn tc_url(&self) -> String {
        format!("rtmp://{}:{}/{}", self.host, self.port, self.app)
    }
}

impl fmt::Display for RtmpUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Stream keys are secrets; keep them out of logs.
        write!(f, "{}/<key>", self.tc_url())
    }
}

/// Media message received from the server.
#[derive(Debug, Clone)]
pub enum MediaMessage {
    Audio { data: Bytes, timestamp: u32 },
    Video { data: Bytes, timestamp: u32 },
    Metadata(StreamMetadata),
}

/// An established RTMP client session.
pub struct RtmpConnection {
    stream: TcpStream,
    session: ClientSession,
    read_buf: Vec<u8>,
    events: VecDeque<ClientSessionEvent>,
    bytes_sent: u64,
}

impl RtmpConnection {
    /// TCP connect, handshake and `connect` to the application.
    #[instrument(name = "rtmp_connect", skip_all, fields(url = %url))]
    pub async fn connect(url: &RtmpUrl, wait: Duration) -> TransportResult<Self> {
        let addr = format!("{}:{}", url.host, url.port);
        let mut stream = timeout(wait, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout(format!("TCP connect to {addr}")))?
            .map_err(|e| TransportError::Connection(format!("TCP connect failed: {}", e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        debug!("TCP connection established, starting handshake");
        let leftover = timeout(wait, handshake(&mut stream))
            .await
            .map_err(|_| TransportError::Timeout("RTMP handshake".into()))??;

        let (session, initial_results) = ClientSession::new(ClientSessionConfig::new())
            .map_err(|e| TransportError::Protocol(format!("Session creation failed: {:?}", e)))?;

        let mut connection = Self {
            stream,
            session,
            read_buf: vec![0u8; READ_BUFFER_SIZE],
            events: VecDeque::new(),
            bytes_sent: 0,
        };
        connection.dispatch(initial_results).await?;

        if !leftover.is_empty() {
            let results = connection
                .session
                .handle_input(&leftover)
                .map_err(|e| TransportError::Protocol(format!("Session input error: {:?}", e)))?;
            connection.dispatch(results).await?;
        }

        debug!(app = %url.app, "Requesting RTMP connection");
        let request = connection
            .session
            .request_connection(url.app.clone())
            .map_err(|e| TransportError::Protocol(format!("Connection request failed: {:?}", e)))?;
        connection.dispatch(vec![request]).await?;

        connection
            .wait_for(wait, "connection acceptance", |event| match event {
                ClientSessionEvent::ConnectionRequestAccepted => Some(Ok(())),
                ClientSessionEvent::ConnectionRequestRejected { description } => {
                    Some(Err(TransportError::Rejected(description.clone())))
                }
                _ => None,
            })
            .await?;

        info!(host = %url.host, port = url.port, app = %url.app, "RTMP connection established");
        Ok(connection)
    }

    /// Request to publish `stream_key` live.
    pub async fn publish(&mut self, stream_key: &str, wait: Duration) -> TransportResult<()> {
        let request = self
            .session
            .request_publishing(stream_key.to_string(), PublishRequestType::Live)
            .map_err(|e| TransportError::Protocol(format!("Publish request failed: {:?}", e)))?;
        self.dispatch(vec![request]).await?;

        self.wait_for(wait, "publish acceptance", |event| match event {
            ClientSessionEvent::PublishRequestAccepted => Some(Ok(())),
            _ => None,
        })
        .await
    }

    /// Request playback of `stream_key`.
    pub async fn play(&mut self, stream_key: &str, wait: Duration) -> TransportResult<()> {
        let request = self
            .session
            .request_playback(stream_key.to_string())
            .map_err(|e| TransportError::Protocol(format!("Play request failed: {:?}", e)))?;
        self.dispatch(vec![request]).await?;

        self.wait_for(wait, "play acceptance", |event| match event {
            ClientSessionEvent::PlaybackRequestAccepted => Some(Ok(())),
            _ => None,
        })
        .await
    }

    /// Send `@setDataFrame onMetaData`.
    pub async fn send_metadata(&mut self, metadata: &StreamMetadata) -> TransportResult<()> {
        let result = self
            .session
            .publish_metadata(metadata)
            .map_err(|e| TransportError::Protocol(format!("Metadata publish failed: {:?}", e)))?;
        self.dispatch(vec![result]).await
    }

    /// Send one audio or video tag body.
    pub async fn send_media(
        &mut self,
        video: bool,
        data: Bytes,
        timestamp_ms: u32,
        can_be_dropped: bool,
    ) -> TransportResult<()> {
        let timestamp = RtmpTimestamp::new(timestamp_ms);
        let published = if video {
            self.session
                .publish_video_data(data, timestamp, can_be_dropped)
        } else {
            self.session
                .publish_audio_data(data, timestamp, can_be_dropped)
        };
        let result = published
            .map_err(|e| TransportError::Protocol(format!("Failed to publish data: {:?}", e)))?;

        self.dispatch(vec![result]).await
    }

    /// Stop publishing before disconnecting.
    pub async fn stop_publishing(&mut self) -> TransportResult<()> {
        let results = self
            .session
            .stop_publishing()
            .map_err(|e| TransportError::Protocol(format!("Unpublish failed: {:?}", e)))?;
        self.dispatch(results).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read once from the socket, waiting at most `wait`. Returns false if
    /// nothing arrived. Only the read is raced against the timer, so no
    /// partially written response is ever abandoned.
    pub async fn poll(&mut self, wait: Duration) -> TransportResult<bool> {
        let n = match timeout(wait, self.stream.read(&mut self.read_buf)).await {
            Err(_) => return Ok(false),
            Ok(result) => result?,
        };
        if n == 0 {
            return Err(TransportError::ConnectionLost(
                "server closed the connection".into(),
            ));
        }

        let results = self
            .session
            .handle_input(&self.read_buf[..n])
            .map_err(|e| TransportError::Protocol(format!("Session input error: {:?}", e)))?;
        self.dispatch(results).await?;
        Ok(true)
    }

    /// Next queued media message, if any. Other events are discarded.
    pub fn next_media(&mut self) -> Option<MediaMessage> {
        while let Some(event) = self.events.pop_front() {
            match event {
                ClientSessionEvent::AudioDataReceived {
                    data, timestamp, ..
                } => {
                    return Some(MediaMessage::Audio {
                        data,
                        timestamp: timestamp.value,
                    })
                }
                ClientSessionEvent::VideoDataReceived {
                    data, timestamp, ..
                } => {
                    return Some(MediaMessage::Video {
                        data,
                        timestamp: timestamp.value,
                    })
                }
                ClientSessionEvent::StreamMetadataReceived { metadata, .. } => {
                    return Some(MediaMessage::Metadata(metadata))
                }
                other => trace!("Ignoring session event: {:?}", other),
            }
        }
        None
    }

    /// Bytes written to the socket so far.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Close the socket.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.stream.shutdown().await {
            trace!("Socket shutdown: {}", e);
        }
    }

    async fn dispatch(&mut self, results: Vec<ClientSessionResult>) -> TransportResult<()> {
        for result in results {
            match result {
                ClientSessionResult::OutboundResponse(packet) => {
                    self.stream.write_all(&packet.bytes).await.map_err(|e| {
                        match e.kind() {
                            std::io::ErrorKind::BrokenPipe
                            | std::io::ErrorKind::ConnectionReset => {
                                TransportError::ConnectionLost(e.to_string())
                            }
                            _ => TransportError::Io(e),
                        }
                    })?;
                    self.bytes_sent += packet.bytes.len() as u64;
                }
                ClientSessionResult::RaisedEvent(event) => self.events.push_back(event),
                _ => trace!("Unhandled RTMP message"),
            }
        }
        Ok(())
    }

    /// Poll until an event satisfies `check`, keeping unrelated events queued.
    async fn wait_for<F>(&mut self, wait: Duration, what: &str, check: F) -> TransportResult<()>
    where
        F: Fn(&ClientSessionEvent) -> Option<TransportResult<()>>,
    {
        let deadline = Instant::now() + wait;
        loop {
            let found = self
                .events
                .iter()
                .enumerate()
                .find_map(|(index, event)| check(event).map(|outcome| (index, outcome)));
            if let Some((index, outcome)) = found {
                self.events.remove(index);
                debug!("Received {}", what);
                return outcome;
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout(format!("waiting for {what}")));
            }
            self.poll(deadline - now).await?;
        }
    }
}

async fn handshake(stream: &mut TcpStream) -> TransportResult<Vec<u8>> {
    let mut handshake = Handshake::new(PeerType::Client);
    let p0_p1 = handshake
        .generate_outbound_p0_and_p1()
        .map_err(|e| TransportError::Connection(format!("Handshake generation failed: {:?}", e)))?;
    stream.write_all(&p0_p1).await?;

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::Connection(
                "Connection closed during handshake".to_string(),
            ));
        }

        match handshake.process_bytes(&buf[..n]) {
            Ok(HandshakeProcessResult::InProgress { response_bytes }) => {
                if !response_bytes.is_empty() {
                    stream.write_all(&response_bytes).await?;
                }
            }
            Ok(HandshakeProcessResult::Completed {
                response_bytes,
                remaining_bytes,
            }) => {
                if !response_bytes.is_empty() {
                    stream.write_all(&response_bytes).await?;
                }
                return Ok(remaining_bytes);
            }
            Err(e) => {
                return Err(TransportError::Connection(format!(
                    "Handshake failed: {:?}",
                    e
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avrelay_types::LinkError;

    #[test]
    fn test_parse_url_with_default_port() {
        let url = RtmpUrl::parse("rtmp://example.com/live/cam1").unwrap();
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 1935);
        assert_eq!(url.app, "live");
        assert_eq!(url.stream_key, "cam1");
        assert_eq!(url.tc_url(), "rtmp://example.com:1935/live");
    }

    #[test]
    fn test_parse_url_nested_app_and_query() {
        let url = RtmpUrl::parse("rtmp://10.0.0.2:1936/app/inst/key?token=abc").unwrap();
        assert_eq!(url.port, 1936);
        assert_eq!(url.app, "app/inst");
        assert_eq!(url.stream_key, "key?token=abc");
    }

    #[test]
    fn test_display_hides_stream_key() {
        let url = RtmpUrl::parse("rtmp://example.com/live/secret").unwrap();
        assert!(!url.to_string().contains("secret"));
    }

    #[test]
    fn test_invalid_urls() {
        for input in [
            "http://example.com/live/key",
            "rtmp://example.com/live",
            "rtmp://example.com/",
            "not a url",
        ] {
            assert!(
                matches!(RtmpUrl::parse(input), Err(TransportError::InvalidUrl(_))),
                "{input} should be rejected"
            );
        }
    }

    #[test]
    fn test_rtsp_url_rejected_with_hint() {
        let err = RtmpUrl::parse("rtsp://10.0.0.2:8554/mic").unwrap_err();
        assert!(matches!(&err, TransportError::InvalidUrl(msg) if msg.contains("rtsp")));
        assert!(LinkError::from(err).is_config());
    }
}
