//! Loopback transfer demo.
//!
//! Runs a sending and a receiving endpoint in one process, connected by
//! in-memory substrates, and pushes one file through them while randomly
//! dropping DATA packets.
//!
//! Usage: loopback [OPTIONS]
//!
//! Options:
//!   -s, --size <BYTES>  File size to transfer (default 65536)
//!   -l, --loss <RATE>   DATA drop probability, 0.0 - 1.0 (default 0.1)
//!   -h, --help          Print help information

use std::cell::RefCell;
use std::env;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};

use gft::ext::ExtensionDispatch;
use gft::substrate::{QueueSubstrate, SentPacket};
use gft::transport::PacketKind;
use gft::{FileTransfer, TransferConfig, TransferOutcome};

const GROUP: u32 = 0;
const FILE_KIND: u8 = 1;
const TICK: Duration = Duration::from_millis(20);

struct Endpoint {
    id: u32,
    ft: Rc<RefCell<FileTransfer>>,
    dispatch: ExtensionDispatch,
    sub: QueueSubstrate,
}

impl Endpoint {
    fn new(id: u32) -> Self {
        let ft = Rc::new(RefCell::new(FileTransfer::new(TransferConfig::default())));
        let mut dispatch = ExtensionDispatch::new();
        FileTransfer::register_ext(&ft, &mut dispatch);

        Self {
            id,
            ft,
            dispatch,
            sub: QueueSubstrate::new(),
        }
    }
}

#[derive(Default)]
struct Stats {
    data_sent: usize,
    data_dropped: usize,
}

/// Whether this packet falls to the simulated loss. Only DATA is
/// dropped; the substrate sends everything else on its reliable channel.
fn dropped(packet: &SentPacket, loss: f64, stats: &mut Stats) -> bool {
    if packet.data[0] != PacketKind::Data as u8 {
        return false;
    }
    stats.data_sent += 1;
    if rand::random::<f64>() < loss {
        stats.data_dropped += 1;
        return true;
    }
    false
}

/// Deliver everything both endpoints queued, dropping DATA packets with
/// probability `loss`.
fn pump(a: &mut Endpoint, b: &mut Endpoint, loss: f64, stats: &mut Stats) {
    loop {
        let from_a = a.sub.drain();
        let from_b = b.sub.drain();
        if from_a.is_empty() && from_b.is_empty() {
            break;
        }

        for packet in from_a {
            if dropped(&packet, loss, stats) {
                continue;
            }
            b.dispatch.handle(&mut b.sub, packet.group, a.id, &packet.data);
        }
        for packet in from_b {
            if dropped(&packet, loss, stats) {
                continue;
            }
            a.dispatch.handle(&mut a.sub, packet.group, b.id, &packet.data);
        }
    }
}

async fn run(file_size: usize, loss: f64) -> Result<()> {
    let file: Vec<u8> = (0..file_size).map(|i| (i % 251) as u8).collect();
    let file = Rc::new(file);

    let mut sender = Endpoint::new(0);
    let mut receiver = Endpoint::new(1);

    let outcome: Rc<RefCell<Option<TransferOutcome>>> = Rc::new(RefCell::new(None));
    let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::with_capacity(file_size)));

    {
        let mut ft = sender.ft.borrow_mut();
        let source = file.clone();
        ft.register_callback_send_data(FILE_KIND, move |_, _, _, _, offset, buffer| {
            let offset = offset as usize;
            buffer.copy_from_slice(&source[offset..offset + buffer.len()]);
        });
        let flag = outcome.clone();
        ft.register_callback_send_done(FILE_KIND, move |_, _, _, _, result| {
            *flag.borrow_mut() = Some(result);
        });
    }

    {
        let mut ft = receiver.ft.borrow_mut();
        ft.register_callback_recv_init(FILE_KIND, |_, group, peer, _, tid, size| {
            tracing::info!(group, peer, tid, size, "accepting transfer");
            true
        });
        let sink = received.clone();
        ft.register_callback_recv_data(FILE_KIND, move |_, _, _, _, offset, data| {
            let mut buffer = sink.borrow_mut();
            assert_eq!(offset as usize, buffer.len());
            buffer.extend_from_slice(data);
        });
    }

    let transfer_id = sender
        .ft
        .borrow_mut()
        .send_init_private(
            &mut sender.sub,
            GROUP,
            receiver.id,
            FILE_KIND,
            b"loopback-demo",
            file_size as u64,
        )
        .expect("fresh endpoint has free slots");
    tracing::info!(transfer_id, file_size, loss, "transfer started");

    let started = Instant::now();
    let mut stats = Stats::default();
    let mut ticker = tokio::time::interval(TICK);

    loop {
        ticker.tick().await;

        let delta = TICK.as_secs_f32();
        sender.ft.borrow_mut().iterate(&mut sender.sub, delta);
        receiver.ft.borrow_mut().iterate(&mut receiver.sub, delta);
        pump(&mut sender, &mut receiver, loss, &mut stats);

        if outcome.borrow().is_some() {
            break;
        }
        if started.elapsed() > Duration::from_secs(120) {
            bail!("transfer did not finish within 120 seconds");
        }
    }

    match *outcome.borrow() {
        Some(TransferOutcome::Completed) => {}
        other => bail!("transfer failed: {:?}", other),
    }
    if *received.borrow() != *file {
        bail!("received content does not match the source file");
    }

    let elapsed = started.elapsed();
    tracing::info!(
        bytes = file_size,
        elapsed_ms = elapsed.as_millis() as u64,
        data_packets = stats.data_sent,
        dropped = stats.data_dropped,
        rate_kib_s = (file_size as f64 / 1024.0 / elapsed.as_secs_f64()) as u64,
        "transfer complete and verified"
    );
    Ok(())
}

fn print_usage() {
    println!("gft loopback demo\n");
    println!("Usage: loopback [OPTIONS]\n");
    println!("Options:");
    println!("  -s, --size <BYTES>  File size to transfer (default 65536)");
    println!("  -l, --loss <RATE>   DATA drop probability, 0.0 - 1.0 (default 0.1)");
    println!("  -h, --help          Print help information");
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut file_size = 64 * 1024usize;
    let mut loss = 0.1f64;

    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                return Ok(());
            }
            "-s" | "--size" => {
                i += 1;
                let Some(value) = args.get(i) else {
                    bail!("--size requires a value");
                };
                file_size = value.parse()?;
            }
            "-l" | "--loss" => {
                i += 1;
                let Some(value) = args.get(i) else {
                    bail!("--loss requires a value");
                };
                loss = value.parse()?;
                if !(0.0..1.0).contains(&loss) {
                    bail!("loss rate must be in [0.0, 1.0)");
                }
            }
            other => {
                eprintln!("Unknown option: {}", other);
                print_usage();
                return Ok(());
            }
        }
        i += 1;
    }

    run(file_size, loss).await
}
