//! DHI scoreboard emitter: TCP sink for non-critical environment telemetry
//! (temperature/humidity/pressure), framed as three UNT4 blocks headed
//! `DC`, `RH`, `BP`. Grounded on `app._emit_env` in the reference
//! implementation. Concrete struct rather than a trait, matching the
//! teacher's `AuditLogger` style for a real-I/O collaborator.

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::debug;

const SOH: u8 = 0x01;
const EOT: u8 = 0x04;
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct DhiSink {
    pub host: String,
    pub port: u16,
    pub encoding_is_utf8: bool,
}

fn unt4_block(header: &str, text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(header.len() + text.len() + 2);
    out.push(SOH);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(text.as_bytes());
    out.push(EOT);
    out
}

impl DhiSink {
    pub fn new(host: String, port: u16, encoding: &str) -> Self {
        DhiSink {
            host,
            port,
            encoding_is_utf8: !encoding.eq_ignore_ascii_case("latin-1"),
        }
    }

    /// Sends the three telemetry blocks. Any failure is logged and
    /// swallowed — this is a non-critical display feed (§7 transient I/O).
    pub async fn emit_env(&self, t: f64, h: f64, p: f64) {
        let msg = [
            unt4_block("DC", &format!("{:.1}", t)),
            unt4_block("RH", &format!("{:.0}", h)),
            unt4_block("BP", &format!("{:.0}", p)),
        ]
        .concat();

        let addr = format!("{}:{}", self.host, self.port);
        let connect = TcpStream::connect(&addr);
        match timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(mut stream)) => {
                if let Err(e) = stream.write_all(&msg).await {
                    debug!("DHI write to {} failed: {}", addr, e);
                }
                let _ = stream.shutdown().await;
            }
            Ok(Err(e)) => debug!("DHI connect to {} failed: {}", addr, e),
            Err(_) => debug!("DHI connect to {} timed out", addr),
        }
    }
}
