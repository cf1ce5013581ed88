use crate::config::MarstekConfig;
use crate::metering_marstek::state::PowerReading;
use log::{debug, info};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

/// UDP port the meter listens on, not configurable on the device.
pub const METER_PORT: u16 = 12345;
/// Pause between two checksum candidates so we do not flood the device.
const SWEEP_ATTEMPT_DELAY: Duration = Duration::from_millis(500);

const FRAME_START: char = '\u{01}';
const FRAME_HEADER: char = '\u{02}';
const FRAME_END: char = '\u{03}';

/* A well-formed answer is '|' delimited with the phase powers at
 * positions 5..=8, so anything shorter than 9 fields is garbage */
const RESPONSE_MIN_FIELDS: usize = 9;
const RESPONSE_PHASE_FIELDS: [usize; 4] = [5, 6, 7, 8];

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Request template has no checksum yet")]
    TemplateNotFrozen,
    #[error("No answer within the read timeout")]
    Timeout,
    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Answer is not valid UTF-8")]
    NotText,
    #[error("Short frame with only {0} fields")]
    ShortFrame(usize),
    #[error("Field {0} is not an integer")]
    BadField(usize),
}

/// Ascending walk over the candidate checksum bytes, wrapping back to 0
/// when a pass is exhausted. Each pass visits every byte exactly once.
pub struct ChecksumSweep {
    position: u16,
    passes: u32,
}

impl ChecksumSweep {
    pub fn new() -> Self {
        return ChecksumSweep { position: 0, passes: 0 };
    }

    pub fn next_candidate(&mut self) -> u8 {
        let candidate = self.position as u8;
        self.position += 1;
        if self.position > u8::MAX as u16 {
            self.position = 0;
            self.passes += 1;
        }
        return candidate;
    }

    /// Completed passes, the last candidate of a pass bumps this.
    pub fn passes(&self) -> u32 {
        return self.passes;
    }
}

/// Render a candidate byte the way the meter expects it appended to the
/// frame, as 2 lowercase hex ASCII characters.
pub fn render_checksum(candidate: u8) -> String {
    return format!("{:02x}", candidate);
}

/// One request template plus the socket parameters for talking to a meter.
/// The checksum suffix is discovered (or configured) once, after that the
/// frozen request bytes never change again.
pub struct MeterClient {
    target: String,
    read_timeout: Duration,
    body: String,
    message: Option<Vec<u8>>,
}

impl MeterClient {
    pub fn new(config: &MarstekConfig) -> Self {
        return MeterClient {
            target: format!("{}:{}", config.meter_ip, METER_PORT),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            body: request_body(&config.fake_client_id, &config.meter_id),
            message: None,
        };
    }

    /// Whether the checksum suffix is known and the template is frozen.
    pub fn is_frozen(&self) -> bool {
        return self.message.is_some();
    }

    pub fn freeze_checksum(&mut self, suffix: &str) {
        self.message = Some(format!("{}{}", self.body, suffix).into_bytes());
    }

    /// Brute force the undocumented trailing checksum byte. Candidates are
    /// probed in ascending order with the normal read timeout; the sweep
    /// wraps around on exhaustion and retries forever, so this blocks until
    /// the meter answers once. Runs at most once per process.
    pub async fn discover_checksum(&mut self) {
        info!("Brute forcing the request checksum byte against {}", self.target);

        let mut sweep = ChecksumSweep::new();
        loop {
            let suffix = render_checksum(sweep.next_candidate());
            debug!("Testing checksum {}", suffix);

            let request = format!("{}{}", self.body, suffix).into_bytes();
            match self.exchange(&request).await {
                Ok(_) => {
                    info!("Got an answer on checksum {}", suffix);
                    self.message = Some(request);
                    return;
                }
                Err(e) => {
                    debug!("No answer on checksum {}: {}", suffix, e);
                }
            }

            if sweep.position == 0 {
                info!("Checksum sweep pass {} exhausted, starting over", sweep.passes());
            }

            sleep(SWEEP_ATTEMPT_DELAY).await;
        }
    }

    /// One exchange with the frozen request. A fresh socket is opened and
    /// closed per call, the meter speaks one datagram per request and keeping
    /// a socket around only invites stale state.
    pub async fn send_and_receive(&self) -> Result<PowerReading, ExchangeError> {
        let message = self
            .message
            .as_deref()
            .ok_or(ExchangeError::TemplateNotFrozen)?;
        return self.exchange(message).await;
    }

    async fn exchange(&self, request: &[u8]) -> Result<PowerReading, ExchangeError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(request, &self.target).await?;

        let mut buf = [0u8; 1024];
        let received = match timeout(self.read_timeout, socket.recv(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => return Err(ExchangeError::Timeout),
        };

        return decode_reading(&buf[..received]);
    }
}

fn request_body(fake_client_id: &str, meter_id: &str) -> String {
    return format!(
        "{FRAME_START}{FRAME_HEADER}49|HMJ-3|{fake_client_id}|HME-4|{meter_id}|A|0{FRAME_END}"
    );
}

/// Decode one answer datagram into a reading. Bounds are checked because
/// checksum discovery relies on telling a garbage answer apart from silence.
pub fn decode_reading(payload: &[u8]) -> Result<PowerReading, ExchangeError> {
    let text = std::str::from_utf8(payload).map_err(|_| ExchangeError::NotText)?;
    let fields: Vec<&str> = text.split('|').collect();
    if fields.len() < RESPONSE_MIN_FIELDS {
        return Err(ExchangeError::ShortFrame(fields.len()));
    }

    let mut values = [0i32; 4];
    for (slot, &index) in RESPONSE_PHASE_FIELDS.iter().enumerate() {
        values[slot] = fields[index]
            .trim()
            .parse::<i32>()
            .map_err(|_| ExchangeError::BadField(index))?;
    }

    return Ok(PowerReading::new(values[0], values[1], values[2], values[3]));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MarstekConfig;

    fn test_config() -> MarstekConfig {
        MarstekConfig {
            name: "test".to_string(),
            meter_ip: "127.0.0.1".to_string(),
            meter_id: "acd929a73dd4".to_string(),
            fake_client_id: "cafecafecafe".to_string(),
            checksum: None,
            read_timeout_ms: 50,
            poll_interval_ms: 300,
            base_topic: "marstek2mqtt".to_string(),
            verbose: false,
        }
    }

    #[test]
    fn test_request_body_layout() {
        let body = request_body("cafecafecafe", "acd929a73dd4");
        let bytes = body.as_bytes();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[1], 0x02);
        assert_eq!(bytes[bytes.len() - 1], 0x03);
        assert_eq!(
            &body[2..body.len() - 1],
            "49|HMJ-3|cafecafecafe|HME-4|acd929a73dd4|A|0"
        );
    }

    #[test]
    fn test_freeze_appends_checksum_once() {
        let mut client = MeterClient::new(&test_config());
        assert!(!client.is_frozen());

        client.freeze_checksum("8f");
        assert!(client.is_frozen());
        let message = client.message.clone().unwrap();
        assert!(message.ends_with(b"\x038f"));
    }

    #[test]
    fn test_render_checksum_is_two_lowercase_hex_chars() {
        assert_eq!(render_checksum(0), "00");
        assert_eq!(render_checksum(10), "0a");
        assert_eq!(render_checksum(0x8f), "8f");
        assert_eq!(render_checksum(255), "ff");
    }

    #[test]
    fn test_sweep_visits_every_byte_once_per_pass_ascending() {
        let mut sweep = ChecksumSweep::new();

        let first_pass: Vec<u8> = (0..256).map(|_| sweep.next_candidate()).collect();
        let expected: Vec<u8> = (0u16..256).map(|i| i as u8).collect();
        assert_eq!(first_pass, expected);
        assert_eq!(sweep.passes(), 1);

        /* Wrap restarts from 0 in the same order */
        let second_pass: Vec<u8> = (0..256).map(|_| sweep.next_candidate()).collect();
        assert_eq!(second_pass, expected);
        assert_eq!(sweep.passes(), 2);
    }

    #[test]
    fn test_decode_well_formed_answer() {
        let payload = b"\x01\x0249|HME-4|acd929a73dd4|HMJ-3|cafecafecafe|123|-45|67|145|0\x03";
        let reading = decode_reading(payload).unwrap();
        assert_eq!(reading.phase_a, 123);
        assert_eq!(reading.phase_b, -45);
        assert_eq!(reading.phase_c, 67);
        assert_eq!(reading.total, 145);
    }

    #[test]
    fn test_decode_short_frame_is_rejected() {
        let result = decode_reading(b"a|b|c");
        assert!(matches!(result, Err(ExchangeError::ShortFrame(3))));
    }

    #[test]
    fn test_decode_non_numeric_field_is_rejected() {
        let payload = b"0|1|2|3|4|abc|6|7|8";
        assert!(matches!(decode_reading(payload), Err(ExchangeError::BadField(5))));
    }

    #[test]
    fn test_decode_non_utf8_is_rejected() {
        assert!(matches!(decode_reading(&[0xff, 0xfe, 0x01]), Err(ExchangeError::NotText)));
    }

    #[tokio::test]
    async fn test_exchange_times_out_without_a_meter() {
        let mut client = MeterClient::new(&test_config());
        client.freeze_checksum("00");
        /* Nothing listens on the target port, so the read must time out */
        let result = client.send_and_receive().await;
        assert!(matches!(result, Err(ExchangeError::Timeout)));
    }

    #[tokio::test]
    async fn test_exchange_before_freeze_returns_error() {
        let client = MeterClient::new(&test_config());
        let result = client.send_and_receive().await;
        assert!(matches!(result, Err(ExchangeError::TemplateNotFrozen)));
    }

    #[tokio::test]
    async fn test_discovery_accepts_first_well_formed_answer() {
        let meter = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = meter.local_addr().unwrap().port();

        let mut config = test_config();
        config.read_timeout_ms = 500;
        let mut client = MeterClient::new(&config);
        client.target = format!("127.0.0.1:{}", port);

        /* Candidate 00 gets a garbage answer, candidate 01 a real frame.
         * Garbage must not be accepted, silence and garbage look the same
         * to the sweep. */
        let server = tokio::spawn(async move {
            let mut buf = [0u8; 1024];

            let (len, peer) = meter.recv_from(&mut buf).await.unwrap();
            assert!(buf[..len].ends_with(b"\x0300"));
            meter.send_to(b"garbage", peer).await.unwrap();

            let (len, peer) = meter.recv_from(&mut buf).await.unwrap();
            assert!(buf[..len].ends_with(b"\x0301"));
            meter.send_to(b"0|1|2|3|4|1|2|3|6|0", peer).await.unwrap();
        });

        client.discover_checksum().await;
        assert!(client.is_frozen());
        assert!(client.message.clone().unwrap().ends_with(b"\x0301"));
        server.await.unwrap();

        /* The frozen template is what steady polling sends from now on */
        let reading = client.send_and_receive().await;
        assert!(matches!(reading, Err(ExchangeError::Timeout)));
    }

    #[tokio::test]
    async fn test_exchange_against_fake_meter() {
        let meter = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = meter.local_addr().unwrap().port();

        let mut config = test_config();
        config.read_timeout_ms = 500;
        let mut client = MeterClient::new(&config);
        client.target = format!("127.0.0.1:{}", port);
        client.freeze_checksum("8f");

        let server = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let (len, peer) = meter.recv_from(&mut buf).await.unwrap();
            assert!(buf[..len].ends_with(b"\x038f"));
            meter
                .send_to(b"0|1|2|3|4|100|200|300|600|0", peer)
                .await
                .unwrap();
        });

        let reading = client.send_and_receive().await.unwrap();
        assert_eq!(reading, PowerReading::new(100, 200, 300, 600));
        server.await.unwrap();
    }
}
