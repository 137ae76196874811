use anyhow::Result;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::control::{CommandMailbox, Intent};
use crate::drive::DriveCommand;
use crate::stream::{Streamer, STREAM_CONTENT_TYPE};

const CONTROL_PAGE: &str = include_str!("../web/control.html");

/// Shared state of the control server
#[derive(Clone)]
pub struct ControlState {
    pub mailbox: Arc<CommandMailbox>,
    pub stream_port: u16,
    /// Host advertised in the control page; overrides the request's Host header
    pub host_ip: Option<String>,
}

impl ControlState {
    fn page_host(&self, headers: &HeaderMap) -> String {
        if let Some(ip) = &self.host_ip {
            return ip.clone();
        }
        headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(strip_port)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .unwrap_or_else(get_local_ip)
    }

    pub fn render_page(&self, host: &str) -> String {
        let stream_url = format!("http://{}:{}/stream", host, self.stream_port);
        CONTROL_PAGE
            .replace("STREAM_URL_PLACEHOLDER", &stream_url)
            .replace("SERVO_POSITION_PLACEHOLDER", &self.mailbox.servo_target().to_string())
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // [v6]:port
        return host.find(']').map_or(host, |end| &host[..=end]);
    }
    host.split(':').next().unwrap_or(host)
}

/// Best guess at this machine's LAN address, "localhost" if there is none
pub fn get_local_ip() -> String {
    use std::net::UdpSocket;

    if let Ok(socket) = UdpSocket::bind("0.0.0.0:0") {
        if let Ok(()) = socket.connect("8.8.8.8:80") {
            if let Ok(addr) = socket.local_addr() {
                return addr.ip().to_string();
            }
        }
    }

    "localhost".to_string()
}

/// Single-segment commands: LED, buzzer and the five drive commands
pub fn parse_command(name: &str) -> Option<Intent> {
    match name {
        "led" => Some(Intent::ToggleLed),
        "buzzer" => Some(Intent::Buzz),
        _ => name.parse::<DriveCommand>().ok().map(Intent::Drive),
    }
}

/// Servo position the way a lenient integer parse reads it: leading
/// whitespace and an optional sign, then as many digits as there are.
/// No digits reads as 0. The result is clamped to 0..=100.
pub fn parse_servo(value: &str) -> u8 {
    let value = value.trim_start();
    let (negative, digits) = match value.as_bytes().first() {
        Some(b'-') => (true, &value[1..]),
        Some(b'+') => (false, &value[1..]),
        _ => (false, value),
    };

    let magnitude = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0u32, |acc, d| acc.saturating_mul(10).saturating_add(u32::from(d - b'0')));

    if negative {
        0
    } else {
        magnitude.min(100) as u8
    }
}

pub fn control_router(state: ControlState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/index.html", get(index_handler))
        .route("/servo/:pos", get(servo_handler))
        .route("/:command", get(command_handler))
        .with_state(state)
}

async fn index_handler(State(state): State<ControlState>, headers: HeaderMap) -> Html<String> {
    Html(state.render_page(&state.page_host(&headers)))
}

async fn servo_handler(
    State(state): State<ControlState>,
    Path(pos): Path<String>,
) -> Html<&'static str> {
    let target = parse_servo(&pos);
    log::debug!("Servo request {:?} -> {}", pos, target);
    state.mailbox.post(Intent::Servo(target));
    Html("OK")
}

async fn command_handler(
    State(state): State<ControlState>,
    Path(command): Path<String>,
) -> Response {
    match parse_command(&command) {
        Some(intent) => {
            log::debug!("Command {}", command);
            state.mailbox.post(intent);
            Html("OK").into_response()
        }
        None => (StatusCode::NOT_FOUND, "Not Found").into_response(),
    }
}

pub async fn run_control_server(listener: TcpListener, state: ControlState) -> Result<()> {
    log::info!("Control server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, control_router(state)).await?;
    Ok(())
}

#[derive(Clone)]
struct StreamState {
    streamer: Arc<Streamer>,
    slots: Arc<Semaphore>,
}

/// Serves `/stream`, one session per request, at most `max_streams` at a time
pub fn stream_router(streamer: Arc<Streamer>, max_streams: usize) -> Router {
    let state = StreamState {
        streamer,
        slots: Arc::new(Semaphore::new(max_streams)),
    };
    Router::new()
        .route("/stream", get(stream_endpoint))
        .with_state(state)
}

async fn stream_endpoint(State(state): State<StreamState>) -> Response {
    let permit = match Arc::clone(&state.slots).try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            log::warn!("Refusing stream client: all stream slots busy");
            return (StatusCode::SERVICE_UNAVAILABLE, "Stream busy").into_response();
        }
    };

    log::info!("Stream client connected");
    // the slot stays taken for as long as the body is alive
    let parts = state.streamer.stream_handler().map(move |part| {
        let _slot = &permit;
        part
    });

    ([(header::CONTENT_TYPE, STREAM_CONTENT_TYPE)], Body::from_stream(parts)).into_response()
}

pub async fn run_stream_server(
    listener: TcpListener,
    streamer: Arc<Streamer>,
    max_streams: usize,
) -> Result<()> {
    log::info!(
        "Stream server listening on http://{}/stream (max {} client(s))",
        listener.local_addr()?,
        max_streams
    );
    axum::serve(listener, stream_router(streamer, max_streams)).await?;
    Ok(())
}
