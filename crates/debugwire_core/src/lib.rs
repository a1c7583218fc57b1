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

    debugWire protocol engine and GDB Remote Serial Protocol session state
    machine for AVR targets, as described in the crate-level design log
    (DESIGN.md). This library owns everything in C1-C7 except the CLI
    surface and the TCP listener loop, which live in the `debugwire-gdb`
    binary that depends on this crate.
*/

pub mod bridge;
pub mod device;
pub mod engine;
pub mod error;
pub mod line;
pub mod rsp;
pub mod session;
pub mod trace;
pub mod transport;

pub use bridge::connect;
pub use device::Device;
pub use engine::{Engine, Fuses};
pub use error::{DwError, DwResult};
pub use line::{LinePort, SerialTransport};
pub use session::Session;
pub use trace::Trace;
