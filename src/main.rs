use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

use camcar::camera::Camera;
use camcar::config::Config;
use camcar::control::{CommandMailbox, ControlLoop};
use camcar::drive::Car;
use camcar::stream::Streamer;
use camcar::web_server::{get_local_ip, run_control_server, run_stream_server, ControlState};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Path to the TOML config file. Missing file means built-in defaults.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Control server port; the stream server defaults to the next one up.
    #[arg(long)]
    port: Option<u16>,

    /// Address advertised in the control page's stream URL.
    /// Default: the request's Host header.
    #[arg(long)]
    host_ip: Option<String>,

    /// Debug logging unless RUST_LOG says otherwise
    #[arg(long)]
    verbose: bool,
}

#[cfg(feature = "hardware")]
fn build_car(config: &Config) -> Result<Car> {
    use camcar::drive::{GpioLed, Pca9685};

    let pwm = Pca9685::new(&config.pca9685)?;
    let led = GpioLed::new(config.led.gpio_pin)?;
    Ok(Car::new(
        Box::new(pwm),
        Box::new(led),
        config.motors.clone(),
        config.servo.clone(),
    ))
}

#[cfg(not(feature = "hardware"))]
fn build_car(config: &Config) -> Result<Car> {
    use camcar::drive::{SimLed, SimPwm};

    log::warn!("Built without the `hardware` feature: PWM and LED outputs are simulated");
    Ok(Car::new(
        Box::new(SimPwm::new()),
        Box::new(SimLed::new()),
        config.motors.clone(),
        config.servo.clone(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
    log::info!("Starting application with args: {:?}", args);

    let mut config = Config::load_or_default(&args.config)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host_ip) = args.host_ip {
        config.server.host_ip = Some(host_ip);
    }
    config.validate()?;

    let camera = Arc::new(Camera::from_config(&config.camera)?);
    let streamer = Arc::new(Streamer::new(
        camera,
        config.stream.convert_quality,
        config.stream.average_window,
    ));

    let mut car = build_car(&config)?;
    car.init()?;
    car.blink()?;

    let mailbox = Arc::new(CommandMailbox::new(config.servo.initial_position));
    let control = ControlLoop::new(Arc::clone(&mailbox), car, &config.control);
    let running = Arc::new(AtomicBool::new(true));
    let control_running = Arc::clone(&running);
    let control_handle = tokio::task::spawn_blocking(move || control.run(control_running));

    let bind_ip = config.server.bind_ip.as_str();
    let control_port = config.server.port;
    let stream_port = config.server.stream_port()?;

    let control_listener = TcpListener::bind((bind_ip, control_port))
        .await
        .with_context(|| {
            format!("failed to bind control server on {}:{}", bind_ip, control_port)
        })?;
    let stream_listener = TcpListener::bind((bind_ip, stream_port))
        .await
        .with_context(|| format!("failed to bind stream server on {}:{}", bind_ip, stream_port))?;

    let advertised = config.server.host_ip.clone().unwrap_or_else(get_local_ip);
    log::info!("Open http://{}:{}/ to drive", advertised, control_port);

    let state = ControlState {
        mailbox,
        stream_port,
        host_ip: config.server.host_ip.clone(),
    };
    let control_server = tokio::spawn(async move {
        if let Err(e) = run_control_server(control_listener, state).await {
            log::error!("Control server failed: {}", e);
        }
    });

    let max_streams = config.server.max_streams;
    let camera = Arc::clone(streamer.camera());
    let stream_server = tokio::spawn(async move {
        if let Err(e) = run_stream_server(stream_listener, streamer, max_streams).await {
            log::error!("Stream server failed: {}", e);
        }
    });

    log::info!("All tasks spawned. Application is running.");

    tokio::signal::ctrl_c().await?;
    log::info!("Ctrl-C received, shutting down");

    control_server.abort();
    stream_server.abort();
    running.store(false, Ordering::Relaxed);
    control_handle.await?;
    log::info!("Camera stats at exit: {:?}", camera.get_stats());

    Ok(())
}
