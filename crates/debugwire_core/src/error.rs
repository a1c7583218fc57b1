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

    error.rs

    Tagged error taxonomy shared by every layer of the bridge: the line
    driver, the echo-aware transport, device discovery, the debugWire
    engine and the RSP session. Every fallible operation in this crate
    returns `Result<T, DwError>`.
*/

use std::io;

/// The four fault categories a caller needs to distinguish, plus an
/// unrecoverable allocation/invariant failure that Rust code should never
/// actually construct outside of a poisoned-invariant panic path.
#[derive(thiserror::Error, Debug)]
pub enum DwError {
    /// Serial I/O failures: OS errors opening/reading/writing the port,
    /// echo mismatches, and the half-duplex line desynchronising.
    #[error("transport error: {0}")]
    Transport(String),

    /// debugWire-level protocol faults: bad BREAK sync, unrecognised
    /// device signature, malformed command response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// RSP session-level faults: bad checksum, malformed packet, `-`
    /// (retransmission request) from the debugger.
    #[error("session error: {0}")]
    Session(String),

    /// Bad CLI invocation.
    #[error("usage error: {0}")]
    Usage(String),

    /// Should be unreachable in practice; kept distinct from `Transport`
    /// so a caller can tell "the line desynced" from "we are out of
    /// memory" if it ever somehow happens.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DwError {
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        DwError::Transport(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        DwError::Protocol(msg.into())
    }

    pub fn session<S: Into<String>>(msg: S) -> Self {
        DwError::Session(msg.into())
    }

    pub fn usage<S: Into<String>>(msg: S) -> Self {
        DwError::Usage(msg.into())
    }
}

impl From<io::Error> for DwError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            DwError::Transport(format!("unexpected EOF from serial port: {e}"))
        }
        else {
            DwError::Transport(e.to_string())
        }
    }
}

impl From<nix::Error> for DwError {
    fn from(e: nix::Error) -> Self {
        DwError::Transport(e.to_string())
    }
}

pub type DwResult<T> = Result<T, DwError>;
