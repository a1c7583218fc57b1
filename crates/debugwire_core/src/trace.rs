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

    trace.rs

    Opt-in byte-level and packet-level diagnostic tracing (component C7).

    The original project behind this bridge used a single mutable global
    boolean to gate trace output, which makes it impossible to run two
    traced sessions (e.g. in tests) in parallel. Here a `Trace` is a small
    value passed by reference to whatever needs to emit a trace line, the
    same way `TraceLogger` is threaded through MartyPC's device model
    rather than read from a global.
*/

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Trace {
    #[default]
    Disabled,
    Stderr,
}

impl Trace {
    pub fn enabled(on: bool) -> Self {
        if on { Trace::Stderr } else { Trace::Disabled }
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Trace::Disabled)
    }

    /// Byte written to the serial line.
    #[inline]
    pub fn wrote(&self, b: u8) {
        if self.is_enabled() {
            eprintln!(">>> 0x{b:02x}");
        }
    }

    /// Byte read from the serial line.
    #[inline]
    pub fn read(&self, b: u8) {
        if self.is_enabled() {
            eprintln!("<<< 0x{b:02x}");
        }
    }

    /// RSP packet received from the debugger.
    #[inline]
    pub fn rsp_in(&self, payload: &str) {
        if self.is_enabled() {
            eprintln!("$< command: {payload}");
        }
    }

    /// RSP packet sent to the debugger.
    #[inline]
    pub fn rsp_out(&self, payload: &str) {
        if self.is_enabled() {
            eprintln!("$> command: {payload}");
        }
    }

    /// Ack/nack byte observed on the wire.
    #[inline]
    pub fn note(&self, msg: &str) {
        if self.is_enabled() {
            eprintln!("$< {msg}");
        }
    }
}
