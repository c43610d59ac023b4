use clap::Parser;
use serial_transport::config::{Config, ConfigLoader, LogFormat};
use serial_transport::{
    create_serial_connection_with_config, EventLoop, Protocol, ProtocolError, SerialTransport,
    TokioEventLoop, TransportError,
};
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use tokio::sync::oneshot;
use tokio::task::LocalSet;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Open a serial device, send a line and print what comes back.",
    long_about = "Opens LOCATOR (a device path, a configured alias, or socket://host:port for a TCP serial bridge), writes MESSAGE followed by a newline once connected, prints received data and closes after the first newline arrives."
)]
struct Args {
    /// Device path, port alias or socket://host:port
    locator: String,

    /// Baud rate; defaults to serial.default_baud from the configuration
    #[arg(short, long)]
    baud: Option<u32>,

    /// Line written once the port is open
    #[arg(short, long, default_value = "Hello, World!")]
    message: String,

    /// Configuration file to use instead of the standard locations
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "serial_transport=trace"
    #[arg(long)]
    log_level: Option<String>,
}

/// Prints everything the device sends and closes on the first newline.
struct Output {
    greeting: Vec<u8>,
    transport: RefCell<Option<SerialTransport>>,
    done: RefCell<Option<oneshot::Sender<Option<TransportError>>>>,
}

impl Output {
    fn new(greeting: Vec<u8>, done: oneshot::Sender<Option<TransportError>>) -> Self {
        Self {
            greeting,
            transport: RefCell::new(None),
            done: RefCell::new(Some(done)),
        }
    }

    fn transport(&self) -> Option<SerialTransport> {
        self.transport.borrow().clone()
    }
}

impl Protocol for Output {
    fn connection_made(&self, transport: &SerialTransport) {
        println!("port opened {}", transport);
        *self.transport.borrow_mut() = Some(transport.clone());
        transport.write(&self.greeting);
    }

    fn data_received(&self, data: &[u8]) {
        println!("data received {:?}", String::from_utf8_lossy(data));
        if data.contains(&b'\n') {
            if let Some(transport) = self.transport() {
                transport.close();
            }
        }
    }

    fn pause_writing(&self) -> Result<(), ProtocolError> {
        let buffered = self.transport().map(|t| t.get_write_buffer_size());
        info!(buffered = ?buffered, "pause writing");
        Ok(())
    }

    fn resume_writing(&self) -> Result<(), ProtocolError> {
        let buffered = self.transport().map(|t| t.get_write_buffer_size());
        info!(buffered = ?buffered, "resume writing");
        Ok(())
    }

    fn connection_lost(&self, error: Option<TransportError>) {
        println!("port closed");
        self.transport.borrow_mut().take();
        if let Some(done) = self.done.borrow_mut().take() {
            let _ = done.send(error);
        }
    }
}

fn init_tracing(level: Option<&str>, config: &Config) {
    // An explicit flag beats RUST_LOG, which beats the config file.
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
    };
    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

async fn run(args: Args, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let event_loop: Rc<dyn EventLoop> = Rc::new(TokioEventLoop::new());
    let (done_tx, mut done_rx) = oneshot::channel();

    let locator = config.serial.resolve_port(&args.locator);
    let port_config = config.serial.port_configuration(args.baud);
    let mut greeting = args.message.into_bytes();
    greeting.push(b'\n');

    let (transport, _protocol) = create_serial_connection_with_config(
        event_loop,
        move || Rc::new(Output::new(greeting, done_tx)),
        &locator,
        &port_config,
        &config.transport,
    )
    .await?;
    info!(%transport, baud = port_config.baud_rate, "Connected");

    let finished = tokio::select! {
        lost = &mut done_rx => Some(lost),
        _ = tokio::signal::ctrl_c() => None,
    };
    let lost = match finished {
        Some(lost) => lost,
        None => {
            warn!("Interrupted, aborting transport");
            transport.abort();
            done_rx.await
        }
    };

    match lost {
        Ok(Some(error)) => Err(error.into()),
        Ok(None) => Ok(()),
        Err(_) => Err(TransportError::BackgroundTaskLost.into()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let loader = match &args.config {
        Some(path) => ConfigLoader::load_from(path)?,
        None => ConfigLoader::load()?,
    };
    let config = loader.into_config();
    init_tracing(args.log_level.as_deref(), &config);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = LocalSet::new();
    local.block_on(&runtime, run(args, config))
}
