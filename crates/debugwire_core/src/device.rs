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

    device.rs

    Component C3: baud rate and device discovery.

    The device table is the compile-time ordered list of AVRs this
    bridge knows how to talk to; the signature is what `GetSignature`
    returns and `spmcsr` is the I/O-space address of that part's
    Store-Program-Memory Control and Status Register, which the fuse
    reader needs (§4.4).
*/

use crate::error::{DwError, DwResult};
use crate::line::SerialTransport;
use crate::transport::Link;
use crate::trace::Trace;
use std::thread::sleep;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    pub name: &'static str,
    pub signature: u16,
    pub spmcsr: u8,
}

/// Devices this bridge is pre-registered to talk to. Unknown signatures
/// are a fatal discovery-time error (§3); there is no fallback.
pub static DEVICES: &[Device] = &[
    Device { name: "ATtiny13", signature: 0x9007, spmcsr: 0x37 },
    Device { name: "ATtiny24", signature: 0x910b, spmcsr: 0x37 },
    Device { name: "ATtiny44", signature: 0x9207, spmcsr: 0x37 },
    Device { name: "ATtiny84", signature: 0x930c, spmcsr: 0x37 },
    Device { name: "ATtiny25", signature: 0x9108, spmcsr: 0x37 },
    Device { name: "ATtiny45", signature: 0x9206, spmcsr: 0x37 },
    Device { name: "ATtiny85", signature: 0x930b, spmcsr: 0x37 },
    Device { name: "ATmega48", signature: 0x9205, spmcsr: 0x37 },
    Device { name: "ATmega88", signature: 0x930a, spmcsr: 0x37 },
    Device { name: "ATmega168", signature: 0x9406, spmcsr: 0x37 },
    Device { name: "ATmega328P", signature: 0x950f, spmcsr: 0x37 },
];

pub fn lookup(signature: u16) -> DwResult<&'static Device> {
    DEVICES.iter().find(|d| d.signature == signature).ok_or_else(|| {
        DwError::protocol(format!("Target device signature not recognized: 0x{signature:04x}"))
    })
}

/// `f_cpu` values the clock-over-128 baud rates are derived from,
/// descending from 20MHz to 1MHz. Descending order matters: it means the
/// fastest working rate wins, and guarantees progress even for a target
/// that would also answer at a slower rate.
pub fn candidate_bauds() -> impl Iterator<Item = u32> {
    (1..=20u32).rev().map(|mhz| (mhz * 1_000_000) / 128)
}

const INTER_PROBE_DELAY: Duration = Duration::from_millis(10);

/// Try each candidate baud rate in descending order, opening a transient
/// port via `open` and issuing a BREAK/sync on it. The first rate whose
/// target answers `0x55` wins; everything else is swallowed except the
/// very last failure, which is surfaced if nothing worked.
///
/// `open` is injected so this is testable against a mock transport
/// without touching real hardware, and so the caller decides what "a
/// port at this baud rate" means (a real `LinePort::open`, or a
/// in-memory stand-in keyed by baud in tests).
pub fn discover_baud<F, P>(mut open: F, trace: Trace) -> DwResult<(u32, P)>
where
    F: FnMut(u32) -> DwResult<P>,
    P: SerialTransport,
{
    let mut last_err = None;

    for baud in candidate_bauds() {
        let mut port = match open(baud) {
            Ok(p) => p,
            Err(e) => {
                last_err = Some(e);
                continue;
            }
        };

        let mut link = Link::new(&mut port, trace);
        match link.break_and_sync() {
            Ok(()) => return Ok((baud, port)),
            Err(e) => {
                last_err = Some(e);
                sleep(INTER_PROBE_DELAY);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        DwError::protocol("Failed to detect baud rate for serial port: no candidate responded")
    }))
}

/// Issue `GetSignature` (`0xf3`) and look the 16-bit result up in
/// [`DEVICES`].
pub fn identify(port: &mut dyn SerialTransport, trace: Trace) -> DwResult<&'static Device> {
    let mut link = Link::new(port, trace);
    link.write_byte(0xf3)?;
    let signature = link.read_word_be()?;
    lookup(signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::MockSerial;

    #[test]
    fn lookup_known_signature() {
        let d = lookup(0x930b).unwrap();
        assert_eq!(d.name, "ATtiny85");
        assert_eq!(d.spmcsr, 0x37);
    }

    #[test]
    fn lookup_unknown_signature_is_protocol_error() {
        let err = lookup(0xffff).unwrap_err();
        assert!(matches!(err, DwError::Protocol(_)));
    }

    #[test]
    fn candidate_bauds_descend_from_highest() {
        let bauds: Vec<u32> = candidate_bauds().collect();
        assert_eq!(bauds[0], 20_000_000 / 128);
        assert_eq!(*bauds.last().unwrap(), 1_000_000 / 128);
        assert!(bauds.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn discover_baud_converges_on_first_responding_rate() {
        // Only the 8MHz/128 = 62500 candidate answers with a clean sync.
        let target_baud = 8_000_000 / 128;
        let result = discover_baud(
            |baud| -> DwResult<MockSerial> {
                let mut mock = MockSerial::with_rx(&[]);
                mock.echo = false;
                if baud == target_baud {
                    mock.push_rx(&[0x55]);
                }
                else {
                    mock.push_rx(&[0x00]); // never resolves to 0x55; read_exact will error
                }
                Ok(mock)
            },
            Trace::Disabled,
        );
        let (baud, _) = result.unwrap();
        assert_eq!(baud, target_baud);
    }

    #[test]
    fn identify_reads_signature_and_resolves_device() {
        let mut mock = MockSerial::with_rx(&[0x93, 0x0b]);
        let device = identify(&mut mock, Trace::Disabled).unwrap();
        assert_eq!(device.name, "ATtiny85");
    }
}
