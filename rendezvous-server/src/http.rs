//! HTTP front: listen, parse request heads, route exchanges to the rendezvous service.
//!
//! The exchange routes keep the request body open while the peer waits, so the
//! body is pumped into a pipe: the packet is read from it first, then the
//! cancellation watcher waits on whatever comes next.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, error, info, warn};
use rendezvous_core::{encode_packet, join_host_port, read_packet, Rendezvous};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    DuplexStream,
};
use tokio::net::{TcpListener, TcpStream};

const MAX_HEAD_LEN: usize = 8 * 1024;
const MAX_HEADERS: usize = 32;
const BODY_PIPE_CAPACITY: usize = 4096;
const OCTET_STREAM: &str = "application/octet-stream";

/// Shared state for all connections.
pub struct AppState {
    pub service: Rendezvous,
    pub install_script: Option<String>,
}

/// Accept connections and handle each on its own task.
pub async fn run_server(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    info!("listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("accept error: {}", e);
                continue;
            }
        };
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, peer, state).await {
                debug!("client {}: {}", peer, e);
            }
        });
    }
}

/// Request head, owned so the read buffer can be handed on to the body pump.
struct RequestHead {
    method: String,
    path: String,
    query: String,
    content_type: Option<String>,
    framing: BodyFraming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyFraming {
    Length(u64),
    Chunked,
    Unframed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Install,
    Legacy,
    Structured,
    NotFound,
}

fn route(path: &str) -> Route {
    match path {
        "/get" => Route::Install,
        "/exchange" => Route::Legacy,
        "/v2/exchange" => Route::Structured,
        _ => Route::NotFound,
    }
}

/// Parse a complete request head. `Ok(None)` means more bytes are needed.
fn parse_head(buf: &[u8]) -> Result<Option<(RequestHead, usize)>, httparse::Error> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let httparse::Status::Complete(head_len) = req.parse(buf)? else {
        return Ok(None);
    };
    let target = req.path.unwrap_or("/");
    let (path, query) = match target.find('?') {
        Some(i) => (&target[..i], &target[i..]),
        None => (target, ""),
    };
    let mut content_type = None;
    let mut framing = BodyFraming::Unframed;
    for h in req.headers.iter() {
        let value = String::from_utf8_lossy(h.value).trim().to_string();
        if h.name.eq_ignore_ascii_case("Content-Type") {
            content_type = Some(value);
        } else if h.name.eq_ignore_ascii_case("Transfer-Encoding") {
            if value.to_ascii_lowercase().ends_with("chunked") {
                framing = BodyFraming::Chunked;
            }
        } else if h.name.eq_ignore_ascii_case("Content-Length") && framing != BodyFraming::Chunked
        {
            if let Ok(n) = value.parse::<u64>() {
                framing = BodyFraming::Length(n);
            }
        }
    }
    let head = RequestHead {
        method: req.method.unwrap_or("").to_string(),
        path: path.to_string(),
        query: query.to_string(),
        content_type,
        framing,
    };
    Ok(Some((head, head_len)))
}

/// Read until the request head is complete. Returns the head and any body bytes read past it.
async fn read_head<R>(reader: &mut R) -> std::io::Result<Option<(RequestHead, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
        match parse_head(&buf) {
            Ok(Some((head, head_len))) => return Ok(Some((head, buf.split_off(head_len)))),
            Ok(None) if buf.len() < MAX_HEAD_LEN => continue,
            Ok(None) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "request head too large",
                ))
            }
            Err(e) => return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<AppState>,
) -> std::io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (head, leftover) = match read_head(&mut reader).await {
        Ok(Some(parsed)) => parsed,
        Ok(None) => return Ok(()),
        Err(e) => {
            warn!("bad request from {}: {}", peer, e);
            return respond(&mut writer, 400, "Bad Request", None, b"Bad request").await;
        }
    };
    debug!("{} {} {}", peer, head.method, head.path);

    let route = route(&head.path);
    match route {
        Route::NotFound => return respond(&mut writer, 404, "Not Found", None, b"Not found").await,
        Route::Install => return install_script(&mut writer, &state, &head.query).await,
        Route::Legacy | Route::Structured => {}
    }
    if head.method != "POST" {
        return respond(&mut writer, 405, "Method Not Allowed", None, b"Invalid method").await;
    }
    if !head
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.eq_ignore_ascii_case(OCTET_STREAM))
    {
        return respond(
            &mut writer,
            415,
            "Unsupported Media Type",
            None,
            b"Invalid content type",
        )
        .await;
    }

    let (body_tx, mut body) = tokio::io::duplex(BODY_PIPE_CAPACITY);
    let raw = BufReader::new(std::io::Cursor::new(leftover).chain(reader));
    let pump = tokio::spawn(pump_body(raw, head.framing, body_tx));

    let result = exchange(&state.service, route, peer, &mut body).await;
    pump.abort();
    match result {
        Ok(reply) if reply.is_empty() => respond(&mut writer, 200, "OK", None, b"").await,
        Ok(reply) => match encode_packet(&reply) {
            Ok(packet) => respond(&mut writer, 200, "OK", Some(OCTET_STREAM), &packet).await,
            Err(e) => {
                error!("reply for {} not sendable: {}", peer, e);
                respond(&mut writer, 500, "Internal Server Error", None, b"").await
            }
        },
        Err(msg) => {
            warn!("rejecting exchange from {}: {}", peer, msg);
            respond(&mut writer, 400, "Bad Request", None, msg.as_bytes()).await
        }
    }
}

/// Read the request packet and run the exchange. Errors are rendered for the client.
async fn exchange(
    service: &Rendezvous,
    route: Route,
    peer: SocketAddr,
    body: &mut DuplexStream,
) -> Result<Vec<u8>, String> {
    let packet = read_packet(body).await.map_err(|e| e.to_string())?;
    let pub_addr = join_host_port(&peer);
    let reply = match route {
        Route::Legacy => service.exchange_legacy(&pub_addr, &packet, body).await,
        _ => service.exchange_structured(&pub_addr, &packet, body).await,
    };
    reply.map_err(|e| e.to_string())
}

/// Decode the request body into `tx`. The pipe closes when the body ends; for
/// bodies that are not chunked that is when the client closes the connection
/// or sends anything past the declared length.
async fn pump_body<R>(
    mut reader: R,
    framing: BodyFraming,
    mut tx: DuplexStream,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    match framing {
        BodyFraming::Chunked => copy_chunked(&mut reader, &mut tx).await?,
        BodyFraming::Length(n) => {
            tokio::io::copy(&mut (&mut reader).take(n), &mut tx).await?;
            let mut probe = [0u8; 1];
            let _ = reader.read(&mut probe).await;
        }
        BodyFraming::Unframed => {
            let mut probe = [0u8; 1];
            let _ = reader.read(&mut probe).await;
        }
    }
    tx.shutdown().await
}

async fn copy_chunked<R, W>(reader: &mut R, tx: &mut W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let size_field = line.split(';').next().unwrap_or("").trim();
        let size = u64::from_str_radix(size_field, 16).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "bad chunk size")
        })?;
        if size == 0 {
            // Trailers, up to the blank line.
            loop {
                line.clear();
                if reader.read_line(&mut line).await? == 0 || line.trim().is_empty() {
                    return Ok(());
                }
            }
        }
        tokio::io::copy(&mut (&mut *reader).take(size), tx).await?;
        line.clear();
        reader.read_line(&mut line).await?;
    }
}

async fn install_script<W>(writer: &mut W, state: &AppState, query: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match &state.install_script {
        Some(script) => {
            let body = script.replace("{query}", query);
            respond(
                writer,
                200,
                "OK",
                Some("text/plain; charset=utf-8"),
                body.as_bytes(),
            )
            .await
        }
        None => respond(writer, 404, "Not Found", None, b"Not found").await,
    }
}

async fn respond<W>(
    writer: &mut W,
    status: u16,
    reason: &str,
    content_type: Option<&str>,
    body: &[u8],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason);
    if let Some(ct) = content_type {
        head.push_str(&format!("Content-Type: {}\r\n", ct));
    }
    head.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    ));
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rendezvous_core::LocalHub;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    async fn start(install_script: Option<&str>) -> (SocketAddr, Arc<AppState>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(AppState {
            service: Rendezvous::new(Arc::new(LocalHub::new())),
            install_script: install_script.map(str::to_string),
        });
        tokio::spawn(run_server(listener, state.clone()));
        (addr, state)
    }

    async fn wait_registered(state: &AppState, name: &str) {
        tokio::time::timeout(WAIT, async {
            while !state.service.coordinator().registry().contains(name) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn chunk(data: &[u8]) -> Vec<u8> {
        let mut out = format!("{:x}\r\n", data.len()).into_bytes();
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Open a streaming exchange request and send the packet as the first chunk.
    async fn open_chunked(addr: SocketAddr, path: &str, packet: &[u8]) -> TcpStream {
        let mut s = TcpStream::connect(addr).await.unwrap();
        let head = format!(
            "POST {} HTTP/1.1\r\nHost: rdv\r\nContent-Type: application/octet-stream\r\nTransfer-Encoding: chunked\r\n\r\n",
            path
        );
        s.write_all(head.as_bytes()).await.unwrap();
        s.write_all(&chunk(&encode_packet(packet).unwrap())).await.unwrap();
        s
    }

    /// Read a `Connection: close` response; returns status and body.
    async fn read_response(s: &mut TcpStream) -> (u16, Vec<u8>) {
        let mut raw = Vec::new();
        tokio::time::timeout(WAIT, s.read_to_end(&mut raw))
            .await
            .unwrap()
            .unwrap();
        let split = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("response head");
        let status_line = String::from_utf8_lossy(&raw[..split]).to_string();
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .expect("status code");
        (status, raw[split + 4..].to_vec())
    }

    async fn simple_request(addr: SocketAddr, request: &[u8]) -> (u16, Vec<u8>) {
        let mut s = TcpStream::connect(addr).await.unwrap();
        s.write_all(request).await.unwrap();
        read_response(&mut s).await
    }

    #[test]
    fn parse_head_extracts_framing_and_query() {
        let raw = b"POST /v2/exchange?x=1 HTTP/1.1\r\nContent-Type: application/octet-stream\r\nTransfer-Encoding: chunked\r\n\r\nBODY";
        let (head, len) = parse_head(raw).unwrap().unwrap();
        assert_eq!(head.method, "POST");
        assert_eq!(head.path, "/v2/exchange");
        assert_eq!(head.query, "?x=1");
        assert_eq!(head.framing, BodyFraming::Chunked);
        assert_eq!(&raw[len..], b"BODY");
        assert!(parse_head(b"POST /exchange HTTP/1.1\r\nHost:").unwrap().is_none());
    }

    #[tokio::test]
    async fn chunked_decoding_handles_extensions_and_trailers() {
        let mut body = Vec::new();
        body.extend(chunk(b"hello "));
        body.extend_from_slice(b"5;ext=1\r\nworld\r\n0\r\nX-Trailer: 1\r\n\r\n");
        let mut reader = BufReader::new(std::io::Cursor::new(body));
        let mut out = Vec::new();
        copy_chunked(&mut reader, &mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn legacy_exchange_over_http() {
        let (addr, state) = start(None).await;
        let mut a = open_chunked(addr, "/exchange", b"10.0.0.5:9|chanX").await;
        wait_registered(&state, "chanX").await;
        let mut b = open_chunked(addr, "/exchange", b"10.0.0.6:10|chanX").await;

        let (status_b, body_b) = read_response(&mut b).await;
        let (status_a, body_a) = read_response(&mut a).await;
        assert_eq!((status_a, status_b), (200, 200));

        let port_a = a.local_addr().unwrap().port();
        let port_b = b.local_addr().unwrap().port();
        assert_eq!(
            body_a,
            encode_packet(format!("127.0.0.1:{}|10.0.0.6:10", port_b).as_bytes()).unwrap()
        );
        assert_eq!(
            body_b,
            encode_packet(format!("127.0.0.1:{}|10.0.0.5:9", port_a).as_bytes()).unwrap()
        );
        assert!(state.service.coordinator().registry().is_empty());
    }

    #[tokio::test]
    async fn structured_exchange_with_content_length_body() {
        let (addr, state) = start(None).await;
        let mut a = open_chunked(addr, "/v2/exchange", br#"{"priAddr":"10.0.0.5:9","chanName":"c"}"#).await;
        wait_registered(&state, "c").await;

        let packet = encode_packet(br#"{"priAddr":"10.0.0.6:10","chanName":"c"}"#).unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        let head = format!(
            "POST /v2/exchange HTTP/1.1\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\n\r\n",
            packet.len()
        );
        b.write_all(head.as_bytes()).await.unwrap();
        b.write_all(&packet).await.unwrap();

        let (status, body) = read_response(&mut b).await;
        assert_eq!(status, 200);
        let (payload, _) = rendezvous_core::decode_packet(&body).unwrap();
        let reply: rendezvous_core::ReplyInfo = serde_json::from_slice(payload).unwrap();
        assert_eq!(reply.peer_addrs.len(), 1);
        assert_eq!(reply.peer_addrs[0].pri_addr, "10.0.0.5:9");
        let (status, _) = read_response(&mut a).await;
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn aux_registration_gets_empty_body() {
        let (addr, state) = start(None).await;
        let mut s = open_chunked(
            addr,
            "/v2/exchange",
            br#"{"priAddr":"10.0.0.9:7001","chanName":"c","isAuxPort":true}"#,
        )
        .await;
        let (status, body) = read_response(&mut s).await;
        assert_eq!(status, 200);
        assert!(body.is_empty());
        assert_eq!(state.service.auxiliary().list("c").len(), 1);
    }

    #[tokio::test]
    async fn closing_body_cancels_exchange() {
        let (addr, state) = start(None).await;
        let mut a = open_chunked(addr, "/exchange", b"10.0.0.5:9|chanX").await;
        wait_registered(&state, "chanX").await;
        a.write_all(b"0\r\n\r\n").await.unwrap();
        let (status, body) = read_response(&mut a).await;
        assert_eq!(status, 200);
        assert!(body.is_empty());
        assert!(state.service.coordinator().registry().is_empty());
    }

    #[tokio::test]
    async fn rejects_wrong_method_type_and_path() {
        let (addr, _) = start(None).await;
        let (status, body) = simple_request(addr, b"GET /exchange HTTP/1.1\r\n\r\n").await;
        assert_eq!((status, body.as_slice()), (405, &b"Invalid method"[..]));

        let (status, _) = simple_request(
            addr,
            b"POST /v2/exchange HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        assert_eq!(status, 415);

        let (status, _) = simple_request(addr, b"GET /nope HTTP/1.1\r\n\r\n").await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn rejects_suspicious_packet_length() {
        let (addr, state) = start(None).await;
        let (status, _) = simple_request(
            addr,
            b"POST /exchange HTTP/1.1\r\nContent-Type: application/octet-stream\r\nContent-Length: 2\r\n\r\n\x03\xe9",
        )
        .await;
        assert_eq!(status, 400);
        assert!(state.service.coordinator().registry().is_empty());
    }

    #[tokio::test]
    async fn install_script_substitutes_query() {
        let (addr, _) = start(Some("curl -fsSL \"https://example.com/install{query}\" | sh")).await;
        let (status, body) = simple_request(addr, b"GET /get?v=2 HTTP/1.1\r\n\r\n").await;
        assert_eq!(status, 200);
        assert_eq!(body, b"curl -fsSL \"https://example.com/install?v=2\" | sh");

        let (addr, _) = start(None).await;
        let (status, _) = simple_request(addr, b"GET /get HTTP/1.1\r\n\r\n").await;
        assert_eq!(status, 404);
    }
}
