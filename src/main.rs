/*
    debugwire-gdb

    Copyright 2026 debugwire-gdb contributors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the "Software"),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    ---------------------------------------------------------------------------

    CLI front-end: argument parsing (bpaf), the one-shot TCP listener, and
    the handful of "do one thing and exit" modes (-i/-f/-z). Everything
    that understands debugWire or RSP lives in `debugwire_core`; this
    binary is glue plus the two collaborators the spec calls out as
    explicitly out of scope for the core engine (CLI parsing and serial
    device auto-detection).
*/

use anyhow::{bail, Context, Result};
use bpaf::Bpaf;
use debugwire_core::{bridge, session::Session, trace::Trace};
use std::net::TcpListener;
use std::path::Path;

#[derive(Debug, Clone, Bpaf)]
#[bpaf(options, generate(args))]
struct Args {
    /// Print version information and exit
    #[bpaf(short('v'), switch)]
    version: bool,

    /// Enable byte/packet level diagnostic tracing
    #[bpaf(short('d'), switch)]
    trace: bool,

    /// Identify the attached target and exit
    #[bpaf(short('i'), switch)]
    identify: bool,

    /// Dump fuse and lock bits and exit
    #[bpaf(short('f'), switch)]
    fuses: bool,

    /// Permanently disable debugWire on the attached target and exit
    #[bpaf(short('z'), switch)]
    disable: bool,

    /// Serial device path (default: auto-detect a single /dev/ttyUSB*)
    #[bpaf(short('s'), argument("PATH"))]
    serial: Option<String>,

    /// Serial baud rate (default: auto-discover)
    #[bpaf(short('b'), argument("BAUD"))]
    baud: Option<u32>,

    /// GDB server listen host
    #[bpaf(short('t'), argument("HOST"), fallback("127.0.0.1".to_string()))]
    host: String,

    /// GDB server listen port
    #[bpaf(short('p'), argument("PORT"), fallback(4444))]
    port: u16,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = args().run();

    if args.version {
        println!("debugwire-gdb {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let trace = Trace::enabled(args.trace);

    let device_path = match &args.serial {
        Some(p) => p.clone(),
        None => find_default_serial_device()?,
    };

    let (_baud, mut engine) = bridge::connect(&device_path, args.baud, trace)
        .with_context(|| format!("failed to connect to target on {device_path}"))?;

    if args.identify {
        println!("{}", engine.device().name);
        return Ok(());
    }

    if args.fuses {
        println!("{}", engine.read_fuses()?);
        return Ok(());
    }

    if args.disable {
        engine.disable()?;
        log::info!("debugWire disabled on target; it will not respond again until reprogrammed");
        return Ok(());
    }

    serve_one_connection(engine, trace, &args.host, args.port)
}

/// Bind, accept exactly one client (spec §5/§6: a single debugging
/// session, ever, per process), and drive it to completion.
fn serve_one_connection(
    engine: debugwire_core::Engine<debugwire_core::LinePort>,
    trace: Trace,
    host: &str,
    port: u16,
) -> Result<()> {
    let listener =
        TcpListener::bind((host, port)).with_context(|| format!("failed to bind {host}:{port}"))?;
    eprintln!("GDB server running on {host}:{port}");
    log::info!("listening on {host}:{port}");

    let (stream, peer) = listener.accept().context("failed to accept GDB connection")?;
    eprintln!("Connection accepted from {peer}");
    log::info!("accepted connection from {peer}");
    drop(listener);

    let mut session = Session::new(engine, trace);
    let result = session.run(stream);

    match &result {
        Ok(()) => {
            eprintln!("Connection closed");
            log::info!("session with {peer} ended cleanly");
        }
        Err(e) => log::error!("session with {peer} terminated: {e}"),
    }

    Ok(result?)
}

/// The device-discovery collaborator the spec treats as external (§1):
/// glob `/dev/ttyUSB*` and require exactly one match, erroring with the
/// candidate list otherwise.
fn find_default_serial_device() -> Result<String> {
    let mut candidates: Vec<String> = std::fs::read_dir(Path::new("/dev"))
        .context("failed to list /dev")?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("ttyUSB"))
        .map(|name| format!("/dev/{name}"))
        .collect();
    candidates.sort();

    match candidates.len() {
        1 => Ok(candidates.remove(0)),
        0 => bail!("no /dev/ttyUSB* serial device found; pass one explicitly with -s"),
        _ => bail!(
            "multiple /dev/ttyUSB* serial devices found ({}); pick one explicitly with -s",
            candidates.join(", ")
        ),
    }
}
