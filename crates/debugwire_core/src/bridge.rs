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

    bridge.rs

    Glues C1 (line driver), C3 (baud/device discovery) and C4 (the
    debugWire engine) together into the single handshake the CLI needs:
    open the port at a known or discovered baud, sync with the target,
    and identify it. This is the one place in the crate that owns a real
    `LinePort` rather than being generic over `SerialTransport`, which is
    what lets everything else stay unit-testable against a mock.
*/

use crate::device::{self, Device};
use crate::engine::Engine;
use crate::error::DwResult;
use crate::line::LinePort;
use crate::trace::Trace;
use crate::transport::Link;

/// Open `device_path`, establish a debugWire sync at `baud` (or, if
/// `None`, discover it per §4.3), and identify the attached part.
///
/// Returns the resolved baud alongside the ready-to-use engine so the
/// CLI can log what it connected at.
pub fn connect(device_path: &str, baud: Option<u32>, trace: Trace) -> DwResult<(u32, Engine<LinePort>)> {
    let (resolved_baud, mut port) = match baud {
        Some(b) => {
            let mut port = LinePort::open(device_path, b)?;
            Link::new(&mut port, trace).break_and_sync()?;
            (b, port)
        }
        None => device::discover_baud(|candidate| LinePort::open(device_path, candidate), trace)?,
    };

    log::info!("synchronised with target on {device_path} at {resolved_baud} baud");

    let dev: &'static Device = device::identify(&mut port, trace)?;
    log::info!("identified target as {} (signature 0x{:04x})", dev.name, dev.signature);

    Ok((resolved_baud, Engine::new(port, dev, trace)))
}
