use crate::error::Error;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use url::Url;

pub(crate) const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const VERSION: &str = "13";
const SUPPORTED_VERSIONS: [&str; 3] = ["13", "8", "7"];

// Upper bound on header bytes buffered during the upgrade, anything past it
// aborts the handshake.
pub const MAX_HEADER_SIZE: usize = 4096;

// A peer that opens the socket but never finishes its handshake is dropped
// after this long.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const HTTP_REQUEST_DELIMITER: &[u8] = b"\r\n\r\n";

pub fn generate_websocket_key() -> String {
    let random_bytes: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(random_bytes)
}

pub fn generate_websocket_accept_value(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

// Reads from the stream until the blank line ending the HTTP headers shows
// up, bounded both in size and in time.
async fn read_until_blank_line<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>, Error> {
    let mut header_buf: Vec<u8> = Vec::with_capacity(1024);
    let mut tmp_buf = vec![0; 1024];

    loop {
        let n = timeout(HANDSHAKE_TIMEOUT, stream.read(&mut tmp_buf)).await??;
        if n == 0 {
            return Err(Error::IncompleteHTTPRequest);
        }
        header_buf.extend_from_slice(&tmp_buf[..n]);
        if header_buf
            .windows(HTTP_REQUEST_DELIMITER.len())
            .any(|window| window == HTTP_REQUEST_DELIMITER)
        {
            return Ok(header_buf);
        }
        if header_buf.len() > MAX_HEADER_SIZE {
            return Err(Error::ProtocolError(format!(
                "header size too large, max={}",
                MAX_HEADER_SIZE
            )));
        }
    }
}

fn find_header<'a>(headers: &'a [httparse::Header<'a>], name: &str) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value)
}

fn header_contains(headers: &[httparse::Header], name: &str, token: &str) -> bool {
    match find_header(headers, name) {
        Some(value) => String::from_utf8_lossy(value)
            .split(',')
            .any(|part| part.trim().eq_ignore_ascii_case(token)),
        None => false,
    }
}

/// Server side of the upgrade: validates the GET request and answers with
/// `101 Switching Protocols` carrying the computed accept value.
pub async fn accept_upgrade<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<(), Error> {
    let raw = read_until_blank_line(stream).await?;

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut request = httparse::Request::new(&mut headers);
    if request.parse(&raw)?.is_partial() {
        return Err(Error::IncompleteHTTPRequest);
    }
    if request.method != Some("GET") {
        return Err(Error::InvalidHTTPHandshake);
    }

    if !header_contains(&headers, "Upgrade", "websocket") {
        return Err(Error::NoUpgradeHeaderPresent);
    }
    if !header_contains(&headers, "Connection", "Upgrade") {
        return Err(Error::NoConnectionHeaderPresent);
    }

    let version = find_header(&headers, "Sec-WebSocket-Version")
        .map(|value| String::from_utf8_lossy(value).trim().to_string())
        .unwrap_or_default();
    if !SUPPORTED_VERSIONS.contains(&version.as_str()) {
        return Err(Error::UnsupportedVersion);
    }

    let key = find_header(&headers, "Sec-WebSocket-Key")
        .map(|value| String::from_utf8_lossy(value).trim().to_string())
        .unwrap_or_default();
    if key.is_empty() {
        return Err(Error::NoSecWebsocketKey);
    }

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: WebSocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        generate_websocket_accept_value(&key)
    );
    stream.write_all(response.as_bytes()).await?;

    Ok(())
}

// Turns a ws URL into the upgrade request a dialing connection sends before
// it can start exchanging frames, plus the host:port string the caller needs
// to open the socket itself.
pub fn construct_http_request(ws_url: &str, key: &str) -> Result<(String, String), Error> {
    let parsed_url = Url::parse(ws_url)?;

    // Only plain ws endpoints are dialed here. Encrypted endpoints reach
    // the connection as an already wrapped stream, so wss never shows up.
    if parsed_url.scheme() != "ws" {
        return Err(Error::InvalidSchemeURL);
    }

    let host = parsed_url.host_str().ok_or(Error::URLNoHost)?;
    let port = parsed_url.port().unwrap_or(80);

    // The Host header repeats the port only when the URL spelled one out.
    let request_host_field = match parsed_url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => String::from(host),
    };

    // Dialing always needs an explicit port, defaulted from the scheme.
    let host_with_port = format!("{}:{}", host, port);

    let request_path = match parsed_url.query() {
        Some(query) => format!("{}?{}", parsed_url.path(), query),
        None => parsed_url.path().to_string(),
    };

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: {}\r\n\r\n",
        request_path, request_host_field, key, VERSION,
    );

    Ok((request, host_with_port))
}

/// Client side of the upgrade over an already connected stream: sends the
/// GET request and validates the `101` answer, including the accept value,
/// compared byte-exact after lowercasing.
pub async fn connect_upgrade<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    ws_url: &str,
) -> Result<(), Error> {
    let key = generate_websocket_key();
    let (request, _) = construct_http_request(ws_url, &key)?;
    stream.write_all(request.as_bytes()).await?;

    let raw = read_until_blank_line(stream).await?;

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    if response.parse(&raw)?.is_partial() {
        return Err(Error::IncompleteHTTPRequest);
    }
    if response.code != Some(101) {
        return Err(Error::NoUpgrade);
    }

    if !header_contains(&headers, "Upgrade", "websocket")
        || !header_contains(&headers, "Connection", "Upgrade")
    {
        return Err(Error::NoUpgrade);
    }

    let accept = find_header(&headers, "Sec-WebSocket-Accept")
        .map(|value| String::from_utf8_lossy(value).trim().to_lowercase())
        .unwrap_or_default();
    if accept != generate_websocket_accept_value(&key).to_lowercase() {
        return Err(Error::InvalidAcceptKey);
    }

    Ok(())
}

/// Dials the ws URL and runs the client handshake, handing back the upgraded
/// stream ready for frame traffic.
pub async fn connect_async(ws_url: &str) -> Result<TcpStream, Error> {
    let key = generate_websocket_key();
    let (_, host_with_port) = construct_http_request(ws_url, &key)?;
    let mut stream = TcpStream::connect(host_with_port).await?;
    connect_upgrade(&mut stream, ws_url).await?;
    Ok(stream)
}
