//! Baostock adapter: the session-stateful provider.
//!
//! Plain TCP protocol. Each request is one `\n`-terminated frame:
//!
//! ```text
//! version \x01 type \x01 body_len(10 digits) body \x01 crc32(header+body) \n
//! ```
//!
//! Responses carry the same 21-byte header and end with `<![CDATA[]]>\n`.
//! Bulk responses (k-data) have a zlib-compressed body of `body_len` bytes.
//! The connection is tied to a login and the client holds it in `&mut self`,
//! so callers must serialize access.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use flate2::read::ZlibDecoder;
use flate2::Crc;
use serde::Deserialize;
use std::io::Read;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::provider::{ProviderError, ProviderResult, SessionSource};
use super::{session_code, Candle, DateRange, Period};

// ============================================================================
// Protocol Constants
// ============================================================================

const CLIENT_VERSION: &str = "00.9.10";
const SPLIT: char = '\x01';
const HEADER_LEN: usize = 21;
const TERMINATOR: &[u8] = b"<![CDATA[]]>\n";
const MAX_RESPONSE_BYTES: usize = 64 * 1024 * 1024;

const MSG_LOGIN: &str = "00";
const MSG_LOGOUT: &str = "02";
const MSG_EXCEPTION: &str = "04";
const MSG_PROFIT: &str = "13";
const MSG_KDATA: &str = "95";
const COMPRESSED_TYPES: &[&str] = &["96"];

const PER_PAGE: u32 = 10_000;
const BAR_FIELDS: &str = "date,code,open,high,low,close,preclose,volume,amount,pctChg,turn";
/// Forward-adjusted prices
const ADJUST_FLAG: &str = "2";

/// Column of `epsTTM` in profit records
const EPS_TTM_COLUMN: usize = 7;

// ============================================================================
// Framing
// ============================================================================

/// Encode a request frame, checksum and newline included.
pub fn encode_request(msg_type: &str, body: &str) -> Vec<u8> {
    let head_body = format!(
        "{CLIENT_VERSION}{SPLIT}{msg_type}{SPLIT}{:010}{body}",
        body.len()
    );
    let mut crc = Crc::new();
    crc.update(head_body.as_bytes());
    format!("{head_body}{SPLIT}{}\n", crc.sum()).into_bytes()
}

/// Decoded response frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub msg_type: String,
    pub fields: Vec<String>,
}

impl Frame {
    fn field(&self, i: usize) -> &str {
        self.fields.get(i).map(String::as_str).unwrap_or("")
    }

    pub fn error_code(&self) -> &str {
        self.field(0)
    }

    pub fn error_msg(&self) -> &str {
        self.field(1)
    }

    /// Map a non-zero error code to a provider error.
    fn check(&self) -> ProviderResult<()> {
        let code = self.error_code();
        if code == "0" && self.msg_type != MSG_EXCEPTION {
            return Ok(());
        }
        let detail = format!("error_code={code} {}", self.error_msg());
        let lowered = self.error_msg().to_ascii_lowercase();
        if code.starts_with("10001") || lowered.contains("login") || self.error_msg().contains("登录") {
            Err(ProviderError::Auth(detail))
        } else if self.msg_type == MSG_EXCEPTION {
            Err(ProviderError::MalformedResponse(detail))
        } else {
            Err(ProviderError::DataNotAvailable(detail))
        }
    }

    /// Rows of the JSON `record` payload.
    fn records(&self) -> ProviderResult<Vec<Vec<String>>> {
        #[derive(Deserialize)]
        struct Payload {
            #[serde(default)]
            record: Vec<Vec<String>>,
        }

        let Some(raw) = self.fields.iter().find(|f| f.trim_start().starts_with('{')) else {
            return Ok(Vec::new());
        };
        serde_json::from_str::<Payload>(raw)
            .map(|p| p.record)
            .map_err(|e| ProviderError::MalformedResponse(format!("record payload: {e}")))
    }
}

/// Decode a complete response, terminator included.
pub fn decode_frame(raw: &[u8]) -> ProviderResult<Frame> {
    if raw.len() < HEADER_LEN + TERMINATOR.len() || !raw.ends_with(TERMINATOR) {
        return Err(ProviderError::MalformedResponse("truncated frame".into()));
    }

    let header = std::str::from_utf8(&raw[..HEADER_LEN])
        .map_err(|_| ProviderError::MalformedResponse("non-UTF-8 header".into()))?;
    let parts: Vec<&str> = header.split(SPLIT).collect();
    if parts.len() != 3 {
        return Err(ProviderError::MalformedResponse(format!("bad header {header:?}")));
    }
    let msg_type = parts[1].to_string();
    let body_len: usize = parts[2]
        .trim()
        .parse()
        .map_err(|_| ProviderError::MalformedResponse(format!("bad body length {:?}", parts[2])))?;

    let body = if COMPRESSED_TYPES.contains(&msg_type.as_str()) {
        let end = HEADER_LEN + body_len;
        if end > raw.len() {
            return Err(ProviderError::MalformedResponse("compressed body overruns frame".into()));
        }
        let mut out = String::new();
        ZlibDecoder::new(&raw[HEADER_LEN..end])
            .read_to_string(&mut out)
            .map_err(|e| ProviderError::MalformedResponse(format!("zlib: {e}")))?;
        out
    } else {
        String::from_utf8(raw[HEADER_LEN..raw.len() - TERMINATOR.len()].to_vec())
            .map_err(|_| ProviderError::MalformedResponse("non-UTF-8 body".into()))?
    };

    let fields = body
        .trim_end_matches('\n')
        .split(SPLIT)
        .map(str::to_string)
        .collect();
    Ok(Frame { msg_type, fields })
}

// ============================================================================
// Client
// ============================================================================

/// Login-scoped TCP client.
pub struct BaostockClient {
    addr: String,
    timeout: Duration,
    stream: Option<TcpStream>,
    user_id: Option<String>,
}

impl BaostockClient {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            stream: None,
            user_id: None,
        }
    }

    pub fn from_config(cfg: &lynx_common::config::ProvidersConfig) -> Self {
        Self::new(
            cfg.baostock_addr.clone(),
            Duration::from_secs(cfg.request_timeout_secs),
        )
    }

    fn drop_connection(&mut self) {
        self.stream = None;
        self.user_id = None;
    }

    async fn connect(&mut self) -> ProviderResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| ProviderError::Network(format!("connect to {} timed out", self.addr)))?
            .map_err(|e| ProviderError::from_io(&e))?;
        stream.set_nodelay(true).ok();
        self.stream = Some(stream);
        Ok(())
    }

    /// One request/response exchange. Any transport failure drops the session.
    ///
    /// The stream is moved out for the round trip and only restored once a
    /// full frame has been read. A caller that drops this future mid-read
    /// leaves the client disconnected instead of holding a socket with an
    /// unread reply queued on it.
    async fn exchange(&mut self, msg_type: &str, body: &str) -> ProviderResult<Frame> {
        let Some(mut stream) = self.stream.take() else {
            return Err(ProviderError::Disconnected("no connection".into()));
        };

        let request = encode_request(msg_type, body);
        let result = tokio::time::timeout(self.timeout, round_trip(&mut stream, &request)).await;
        let raw = match result {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                self.drop_connection();
                return Err(e);
            }
            Err(_) => {
                self.drop_connection();
                return Err(ProviderError::Network("baostock request timed out".into()));
            }
        };
        self.stream = Some(stream);

        let frame = tokio::task::spawn_blocking(move || decode_frame(&raw))
            .await
            .map_err(|e| ProviderError::Internal(e.to_string()))??;
        if let Err(e) = frame.check() {
            if matches!(e, ProviderError::Auth(_)) {
                self.drop_connection();
            }
            return Err(e);
        }
        Ok(frame)
    }

    fn user(&self) -> ProviderResult<String> {
        self.user_id
            .clone()
            .filter(|_| self.stream.is_some())
            .ok_or_else(|| ProviderError::Auth("not logged in".into()))
    }
}

async fn round_trip(stream: &mut TcpStream, request: &[u8]) -> ProviderResult<Vec<u8>> {
    stream
        .write_all(request)
        .await
        .map_err(|e| ProviderError::from_io(&e))?;

    let mut raw = Vec::with_capacity(8192);
    let mut buf = vec![0u8; 8192];
    loop {
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| ProviderError::from_io(&e))?;
        if n == 0 {
            return Err(ProviderError::Disconnected("connection closed by peer".into()));
        }
        raw.extend_from_slice(&buf[..n]);
        if raw.ends_with(TERMINATOR) {
            return Ok(raw);
        }
        if raw.len() > MAX_RESPONSE_BYTES {
            return Err(ProviderError::MalformedResponse("response too large".into()));
        }
    }
}

#[async_trait]
impl SessionSource for BaostockClient {
    fn name(&self) -> &'static str {
        "baostock"
    }

    fn is_logged_in(&self) -> bool {
        self.user_id.is_some() && self.stream.is_some()
    }

    async fn login(&mut self) -> ProviderResult<()> {
        self.connect().await?;
        let body = format!("login{SPLIT}anonymous{SPLIT}123456{SPLIT}0");
        self.exchange(MSG_LOGIN, &body).await?;
        self.user_id = Some("anonymous".to_string());
        info!(addr = %self.addr, "Baostock session logged in");
        Ok(())
    }

    async fn logout(&mut self) -> ProviderResult<()> {
        let Ok(user) = self.user() else {
            self.drop_connection();
            return Ok(());
        };
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let body = format!("logout{SPLIT}{user}{SPLIT}{stamp}");
        let result = self.exchange(MSG_LOGOUT, &body).await.map(|_| ());
        self.drop_connection();
        debug!("Baostock session closed");
        result
    }

    async fn query_bars(
        &mut self,
        code: &str,
        period: Period,
        range: DateRange,
    ) -> ProviderResult<Vec<Candle>> {
        let user = self.user()?;
        let body = [
            "query_history_k_data_plus".to_string(),
            user,
            "1".to_string(),
            PER_PAGE.to_string(),
            session_code(code),
            BAR_FIELDS.to_string(),
            range.start.format("%Y-%m-%d").to_string(),
            range.end.format("%Y-%m-%d").to_string(),
            period.session_frequency().to_string(),
            ADJUST_FLAG.to_string(),
        ]
        .join(&SPLIT.to_string());

        let frame = self.exchange(MSG_KDATA, &body).await?;
        let candles = parse_bars(&frame.records()?);
        if candles.is_empty() {
            return Err(ProviderError::DataNotAvailable(format!(
                "no bars for {code} between {} and {}",
                range.start, range.end
            )));
        }
        Ok(candles)
    }

    async fn query_eps_ttm(
        &mut self,
        code: &str,
        year: i32,
        quarter: u32,
    ) -> ProviderResult<Option<f64>> {
        let user = self.user()?;
        let body = [
            "query_profit_data".to_string(),
            user,
            "1".to_string(),
            PER_PAGE.to_string(),
            session_code(code),
            year.to_string(),
            quarter.to_string(),
        ]
        .join(&SPLIT.to_string());

        let frame = match self.exchange(MSG_PROFIT, &body).await {
            Ok(frame) => frame,
            Err(ProviderError::DataNotAvailable(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(frame
            .records()?
            .first()
            .and_then(|row| row.get(EPS_TTM_COLUMN))
            .and_then(|v| v.trim().parse::<f64>().ok()))
    }
}

/// Parse k-data rows in `BAR_FIELDS` order. Volume arrives in shares.
fn parse_bars(records: &[Vec<String>]) -> Vec<Candle> {
    let mut candles = Vec::with_capacity(records.len());
    for row in records {
        let num = |i: usize| row.get(i).and_then(|s| s.trim().parse::<f64>().ok());

        let Some(date) = row
            .first()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        else {
            warn!(row = ?row, "Invalid bar date");
            continue;
        };
        let (Some(open), Some(high), Some(low), Some(close)) = (num(2), num(3), num(4), num(5))
        else {
            warn!(row = ?row, "Bar without prices");
            continue;
        };

        let pre_close = num(6);
        candles.push(Candle {
            date,
            open,
            high,
            low,
            close,
            pre_close,
            volume: num(7).unwrap_or(0.0) / 100.0,
            amount: num(8).unwrap_or(0.0),
            change_pct: num(9).unwrap_or(0.0),
            change_amount: pre_close.map_or(0.0, |pc| close - pc),
            turnover_rate: num(10),
        });
    }
    candles.sort_by_key(|c| c.date);
    candles
}
