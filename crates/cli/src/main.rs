mod rtp;

use std::io;
use std::net::{TcpListener, TcpStream};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rtptcp::{
    ConnectionError, ConnectionErrorHook, ConnectionId, DEFAULT_MAX_PACKET_SIZE, StreamTransmitter,
    TransmissionParams,
};
use tracing_subscriber::EnvFilter;

use crate::rtp::RtpSource;

/// RTP video clock rate.
const CLOCK_RATE_HZ: u64 = 90_000;

#[derive(Parser)]
#[command(name = "rtp-tcp", about = "Send and receive RTP/RTCP over TCP (RFC 4571 framing)")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept connections and log every packet received
    Listen {
        /// Bind address (host:port)
        #[arg(long, short, default_value = "0.0.0.0:5004")]
        bind: String,

        /// Re-broadcast received RTP packets to every connection
        #[arg(long)]
        echo: bool,

        #[arg(long, default_value_t = DEFAULT_MAX_PACKET_SIZE)]
        max_packet_size: usize,
    },
    /// Connect and send a stream of synthetic RTP packets
    Send {
        /// Peer address (host:port)
        #[arg(long, short)]
        connect: String,

        #[arg(long, default_value_t = 100)]
        count: u32,

        #[arg(long, default_value_t = 20)]
        interval_ms: u64,

        /// Payload bytes after the 12-byte RTP header
        #[arg(long, default_value_t = 160)]
        payload_size: usize,

        #[arg(long, default_value_t = 96)]
        payload_type: u8,
    },
}

/// Logs connections the transmitter drops.
struct LogHook;

impl ConnectionErrorHook for LogHook {
    fn on_connection_error(&self, id: ConnectionId, reason: &ConnectionError) {
        tracing::info!(%id, reason = %reason, "client disconnected");
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let result = match args.command {
        Command::Listen {
            bind,
            echo,
            max_packet_size,
        } => listen(&bind, echo, max_packet_size),
        Command::Send {
            connect,
            count,
            interval_ms,
            payload_size,
            payload_type,
        } => send(
            &connect,
            count,
            Duration::from_millis(interval_ms),
            payload_size,
            payload_type,
        ),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn listen(bind: &str, echo: bool, max_packet_size: usize) -> rtptcp::Result<()> {
    let tx = Arc::new(StreamTransmitter::<TcpStream>::new());
    tx.init(true)?;
    tx.create(
        max_packet_size,
        TransmissionParams {
            error_hook: Some(Arc::new(LogHook)),
            ..Default::default()
        },
    )?;

    let listener = TcpListener::bind(bind)?;
    listener.set_nonblocking(true)?;
    let running = Arc::new(AtomicBool::new(true));
    tracing::info!(addr = %bind, echo, max_packet_size, "listening");

    let acceptor = {
        let tx = tx.clone();
        let running = running.clone();
        thread::spawn(move || accept_loop(listener, tx, running))
    };
    let receiver = {
        let tx = tx.clone();
        let running = running.clone();
        thread::spawn(move || receive_loop(&tx, echo, &running))
    };

    println!("Listening on {} - press Enter to stop", bind);
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;

    running.store(false, Ordering::SeqCst);
    tx.abort_wait()?;
    let received = receiver.join().unwrap_or(Ok(0));
    let _ = acceptor.join();
    tx.destroy();

    tracing::info!(packets = received.as_ref().copied().unwrap_or(0), "stopped");
    received.map(|_| ())
}

/// Registers each accepted client and wakes the receiver so the new
/// connection joins its next wait.
fn accept_loop(listener: TcpListener, tx: Arc<StreamTransmitter<TcpStream>>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(false).is_err() || stream.set_nodelay(true).is_err() {
                    continue;
                }
                match tx.add_destination(stream) {
                    Ok(id) => {
                        tracing::info!(%id, %peer, "client connected");
                        if let Err(e) = tx.abort_wait() {
                            tracing::warn!(error = %e, "failed to wake receiver");
                        }
                    }
                    Err(e) => tracing::warn!(%peer, error = %e, "rejecting client"),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "TCP accept error");
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
}

fn receive_loop(tx: &StreamTransmitter<TcpStream>, echo: bool, running: &AtomicBool) -> rtptcp::Result<u64> {
    let mut received = 0u64;
    while running.load(Ordering::SeqCst) {
        tx.wait_for_incoming_data(Duration::from_secs(1))?;
        tx.poll()?;

        while let Ok(packet) = tx.get_next_packet() {
            received += 1;
            tracing::info!(
                source = %packet.source(),
                len = packet.len(),
                kind = ?packet.kind(),
                seq = ?rtp::sequence_of(packet.data()).filter(|_| packet.is_rtp()),
                "packet received"
            );
            if echo && packet.is_rtp() {
                if let Err(e) = tx.send_rtp_data(packet.data()) {
                    tracing::warn!(error = %e, "echo failed");
                }
            }
        }
    }
    Ok(received)
}

fn send(addr: &str, count: u32, interval: Duration, payload_size: usize, payload_type: u8) -> rtptcp::Result<()> {
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;

    let tx = StreamTransmitter::new();
    tx.init(false)?;
    tx.create(DEFAULT_MAX_PACKET_SIZE, TransmissionParams::default())?;
    let id = tx.add_destination(stream)?;

    let mut source = RtpSource::with_random_ssrc(payload_type);
    let step = (CLOCK_RATE_HZ * interval.as_millis() as u64 / 1000) as u32;
    let payload: Vec<u8> = (0..payload_size).map(|i| i as u8).collect();
    tracing::info!(%id, %addr, ssrc = format_args!("{:#010X}", source.ssrc), count, "sending");

    let mut echoed = 0u32;
    for n in 0..count {
        let packet = source.packet(n + 1 == count, &payload);
        tx.send_rtp_data(&packet)?;
        source.advance_timestamp(step);

        tx.poll()?;
        while let Ok(packet) = tx.get_next_packet() {
            echoed += 1;
            tracing::debug!(len = packet.len(), seq = ?rtp::sequence_of(packet.data()), "echo received");
        }
        thread::sleep(interval);
    }

    tracing::info!(sent = count, echoed, next_seq = source.sequence(), "done");
    tx.destroy();
    Ok(())
}
