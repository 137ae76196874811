use anyhow::Result;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use camcar::camera::Camera;
use camcar::config::Config;
use camcar::control::{CommandMailbox, ControlLoop};
use camcar::drive::{Car, DriveCommand, SimLed, SimPwm};
use camcar::stream::{part_header, Streamer, STREAM_BOUNDARY, STREAM_CONTENT_TYPE};
use camcar::web_server::{run_control_server, run_stream_server, ControlState};

const TEST_CONFIG: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/test_config.toml");
const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Both servers on ephemeral loopback ports, torn down on drop
struct TestServer {
    config: Config,
    control_addr: SocketAddr,
    stream_addr: SocketAddr,
    mailbox: Arc<CommandMailbox>,
    streamer: Arc<Streamer>,
    handles: Vec<JoinHandle<()>>,
}

impl TestServer {
    async fn start() -> Result<Self> {
        let config = Config::load(TEST_CONFIG)?;

        let camera = Arc::new(Camera::from_config(&config.camera)?);
        let streamer = Arc::new(Streamer::new(
            camera,
            config.stream.convert_quality,
            config.stream.average_window,
        ));
        let mailbox = Arc::new(CommandMailbox::new(config.servo.initial_position));

        let control_listener = TcpListener::bind("127.0.0.1:0").await?;
        let stream_listener = TcpListener::bind("127.0.0.1:0").await?;
        let control_addr = control_listener.local_addr()?;
        let stream_addr = stream_listener.local_addr()?;

        let state = ControlState {
            mailbox: Arc::clone(&mailbox),
            stream_port: stream_addr.port(),
            host_ip: None,
        };

        let mut handles = Vec::new();
        handles.push(tokio::spawn(async move {
            let _ = run_control_server(control_listener, state).await;
        }));
        let stream_streamer = Arc::clone(&streamer);
        let max_streams = config.server.max_streams;
        handles.push(tokio::spawn(async move {
            let _ = run_stream_server(stream_listener, stream_streamer, max_streams).await;
        }));

        Ok(TestServer {
            config,
            control_addr,
            stream_addr,
            mailbox,
            streamer,
            handles,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.control_addr, path)
    }

    async fn open_stream(&self) -> Result<StreamClient> {
        let mut tcp = TcpStream::connect(self.stream_addr).await?;
        tcp.write_all(b"GET /stream HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n").await?;
        Ok(StreamClient {
            reader: BufReader::new(tcp),
        })
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Raw reader for the chunked MJPEG response
struct StreamClient {
    reader: BufReader<TcpStream>,
}

impl StreamClient {
    /// Status line and headers, up to the blank line. Header names come
    /// back lowercased.
    async fn read_head(&mut self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                anyhow::bail!("connection closed inside response head");
            }
            if line == "\r\n" {
                return Ok(lines);
            }
            let line = line.trim_end();
            let line = match line.split_once(':') {
                Some((name, value)) if !lines.is_empty() => {
                    format!("{}:{}", name.to_ascii_lowercase(), value)
                }
                _ => line.to_string(),
            };
            lines.push(line);
        }
    }

    async fn read_chunk(&mut self) -> Result<Vec<u8>> {
        let mut size_line = String::new();
        self.reader.read_line(&mut size_line).await?;
        let size = usize::from_str_radix(size_line.trim_end(), 16)?;

        let mut data = vec![0u8; size];
        self.reader.read_exact(&mut data).await?;
        let mut crlf = [0u8; 2];
        self.reader.read_exact(&mut crlf).await?;
        assert_eq!(&crlf, b"\r\n");
        Ok(data)
    }
}

#[tokio::test]
async fn test_control_page_links_stream_port() -> Result<()> {
    let server = TestServer::start().await?;

    let resp = reqwest::get(server.url("/")).await?;
    assert_eq!(resp.status().as_u16(), 200);
    let body = resp.text().await?;

    let stream_url = format!("http://127.0.0.1:{}/stream", server.stream_addr.port());
    assert!(body.contains(&stream_url), "page does not embed {}", stream_url);
    Ok(())
}

#[tokio::test]
async fn test_commands_answer_ok_and_post_intents() -> Result<()> {
    let server = TestServer::start().await?;
    let client = reqwest::Client::new();

    for path in ["/right?1", "/left?2", "/led?3", "/buzzer?4", "/servo/75?5"] {
        let resp = client.get(server.url(path)).send().await?;
        assert_eq!(resp.status().as_u16(), 200, "{}", path);
        assert_eq!(resp.text().await?, "OK");
    }

    let pending = server.mailbox.take();
    assert_eq!(pending.drive, Some(DriveCommand::Left));
    assert!(pending.toggle_led);
    assert!(pending.buzz);
    assert_eq!(pending.servo, Some(75));
    assert_eq!(server.mailbox.servo_target(), 75);
    Ok(())
}

#[tokio::test]
async fn test_bad_requests() -> Result<()> {
    let server = TestServer::start().await?;
    let client = reqwest::Client::new();

    // non-numeric positions read as 0, like a lenient integer parse
    let resp = client.get(server.url("/servo/abc")).send().await?;
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(server.mailbox.take().servo, Some(0));

    let resp = client.get(server.url("/nowhere")).send().await?;
    assert_eq!(resp.status().as_u16(), 404);

    let resp = client.post(server.url("/left")).send().await?;
    assert_eq!(resp.status().as_u16(), 405);
    Ok(())
}

#[tokio::test]
async fn test_control_loop_drives_posted_command() -> Result<()> {
    let server = TestServer::start().await?;

    let pwm = SimPwm::new();
    let mut car = Car::new(
        Box::new(pwm.clone()),
        Box::new(SimLed::new()),
        server.config.motors.clone(),
        server.config.servo.clone(),
    );
    car.init()?;
    let control = ControlLoop::new(Arc::clone(&server.mailbox), car, &server.config.control);
    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    let handle = tokio::task::spawn_blocking(move || control.run(flag));

    reqwest::get(server.url("/forward")).await?;

    let left_forward = server.config.motors.left_forward;
    timeout(IO_TIMEOUT, async {
        while pwm.duty(left_forward) == 0 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;
    assert_eq!(pwm.duty(server.config.motors.right_forward), 2047);

    running.store(false, std::sync::atomic::Ordering::Relaxed);
    handle.await?;
    assert_eq!(pwm.duty(left_forward), 0);
    Ok(())
}

#[tokio::test]
async fn test_stream_emits_multipart_jpeg() -> Result<()> {
    let server = TestServer::start().await?;
    let mut client = server.open_stream().await?;

    let head = timeout(IO_TIMEOUT, client.read_head()).await??;
    assert_eq!(head[0], "HTTP/1.1 200 OK");
    assert!(head.contains(&format!("content-type: {}", STREAM_CONTENT_TYPE)));
    assert!(head.contains(&"transfer-encoding: chunked".to_string()));

    for _ in 0..2 {
        let header = timeout(IO_TIMEOUT, client.read_chunk()).await??;
        let jpeg = timeout(IO_TIMEOUT, client.read_chunk()).await??;
        let boundary = timeout(IO_TIMEOUT, client.read_chunk()).await??;

        assert_eq!(header, part_header(jpeg.len()).into_bytes());
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
        assert_eq!(boundary, STREAM_BOUNDARY.as_bytes());
    }
    Ok(())
}

#[tokio::test]
async fn test_extra_stream_client_refused_until_slot_frees() -> Result<()> {
    let server = TestServer::start().await?;

    let mut first = server.open_stream().await?;
    timeout(IO_TIMEOUT, first.read_head()).await??;

    let mut second = TcpStream::connect(server.stream_addr).await?;
    second
        .write_all(b"GET /stream HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
        .await?;
    let mut reply = String::new();
    timeout(IO_TIMEOUT, second.read_to_string(&mut reply)).await??;
    assert!(reply.starts_with("HTTP/1.1 503"), "got {:?}", reply);

    drop(first);

    // the server drops the body once it sees the hang-up
    timeout(IO_TIMEOUT, async {
        while server.streamer.timing().lock().last_frame().is_some() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;

    // the permit goes back a moment after the clock is reset
    let status = timeout(IO_TIMEOUT, async {
        loop {
            let mut client = server.open_stream().await?;
            let head = client.read_head().await?;
            if head[0] != "HTTP/1.1 503 Service Unavailable" {
                return Ok::<_, anyhow::Error>(head[0].clone());
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await??;
    assert_eq!(status, "HTTP/1.1 200 OK");
    Ok(())
}
