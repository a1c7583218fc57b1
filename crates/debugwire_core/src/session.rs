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

    session.rs

    Component C5: the RSP session state machine sitting on top of the
    debugWire engine (C4). Owns the connection for its entire lifetime —
    there is exactly one client, ever, per process — and is the only
    thing in this crate that understands both "bytes off the TCP socket"
    and "semantic debugWire operation".

    The receive state machine below is a direct byte-for-byte rendering
    of the ack/payload/checksum table this protocol defines; the command
    handler consumes the `rsp::Command` sum type it produces rather than
    re-deriving "which command is this" from the raw payload string at
    every call site (see the stringly-typed-commands note in the design
    log).
*/

use crate::device::Device;
use crate::engine::Engine;
use crate::error::{DwError, DwResult};
use crate::line::SerialTransport;
use crate::rsp::{self, Command};
use crate::trace::Trace;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::BorrowedFd;
use std::os::unix::io::{AsRawFd, RawFd};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    ExpectAckOrStart,
    InPayload,
    Cksum1,
    Cksum2,
}

enum RxEvent {
    Interrupt,
    Packet(String),
}

/// Wraps the TCP client socket with a small pending-byte buffer. A single
/// `read()` can return bytes spanning more than one logical event — e.g. a
/// `c` packet immediately followed by the `0x03` interrupt byte, both in
/// the same TCP segment. Once those bytes are drained out of the kernel's
/// receive queue into `pending`, anything that wants "the next byte from
/// the client" (the receive FSM here, or `wait_for_stop`'s interrupt read)
/// must consume them from `pending` first; re-issuing a blocking `read()`
/// on the socket at that point would wait forever for a byte that already
/// arrived and is just sitting in this buffer instead of the kernel's.
struct ClientStream {
    stream: TcpStream,
    pending: VecDeque<u8>,
}

impl ClientStream {
    fn new(stream: TcpStream) -> Self {
        ClientStream { stream, pending: VecDeque::new() }
    }

    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn write_all(&mut self, buf: &[u8]) -> DwResult<()> {
        self.stream.write_all(buf)?;
        Ok(())
    }

    /// A byte is already sitting in `pending` and can be consumed without
    /// touching the socket at all, let alone blocking on it.
    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Pop the next byte, blocking on a fresh socket `read()` only if
    /// `pending` is empty. `None` on clean EOF.
    fn next_byte(&mut self) -> DwResult<Option<u8>> {
        if let Some(b) = self.pending.pop_front() {
            return Ok(Some(b));
        }

        let mut buf = [0u8; 256];
        let n = self.stream.read(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        self.pending.extend(buf[..n].iter().copied());
        Ok(self.pending.pop_front())
    }
}

/// How a blocked `Continue` command's wait ended: a real stop report
/// disambiguates `c`'s generic `S00` reply from the `S05` a host-issued
/// Ctrl-C interrupt produces (spec §8 scenario 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Breakpoint,
    Interrupted,
}

/// Byte-at-a-time rendering of the §4.5 receive table. `cksum` is the
/// running mod-256 sum of payload bytes seen so far; `hi` is the first
/// checksum hex digit, stashed between `Cksum1` and `Cksum2`.
struct Receiver {
    state: RxState,
    payload: String,
    cksum: u8,
    hi: u8,
}

impl Receiver {
    fn new() -> Self {
        Receiver { state: RxState::ExpectAckOrStart, payload: String::new(), cksum: 0, hi: 0 }
    }

    fn feed(&mut self, byte: u8, trace: Trace) -> DwResult<Option<RxEvent>> {
        if byte == 0x03 {
            return Ok(Some(RxEvent::Interrupt));
        }

        match self.state {
            RxState::ExpectAckOrStart => match byte {
                b'+' => {
                    trace.note("ack");
                    Ok(None)
                }
                b'-' => Err(DwError::session("debugger sent '-' (retransmission request)")),
                b'$' => {
                    self.payload.clear();
                    self.cksum = 0;
                    self.state = RxState::InPayload;
                    Ok(None)
                }
                other => Err(DwError::session(format!(
                    "unexpected byte while awaiting ack/start: 0x{other:02x}"
                ))),
            },
            RxState::InPayload => {
                if byte == b'#' {
                    self.state = RxState::Cksum1;
                }
                else {
                    self.payload.push(byte as char);
                    self.cksum = self.cksum.wrapping_add(byte);
                }
                Ok(None)
            }
            RxState::Cksum1 => {
                self.hi = byte;
                self.state = RxState::Cksum2;
                Ok(None)
            }
            RxState::Cksum2 => {
                self.state = RxState::ExpectAckOrStart;
                let hex = [self.hi, byte];
                let hex_str = std::str::from_utf8(&hex)
                    .map_err(|_| DwError::session("RSP checksum digits are not valid UTF-8"))?;
                let declared = u8::from_str_radix(hex_str, 16)
                    .map_err(|_| DwError::session("RSP checksum digits are not valid hex"))?;
                if declared != self.cksum {
                    return Err(DwError::session(format!(
                        "RSP checksum mismatch: packet claimed 0x{declared:02x}, computed 0x{:02x}",
                        self.cksum
                    )));
                }
                Ok(Some(RxEvent::Packet(std::mem::take(&mut self.payload))))
            }
        }
    }
}

pub struct Session<P: SerialTransport> {
    engine: Engine<P>,
    trace: Trace,
    hw_breakpoint: Option<u16>,
    target_running: bool,
}

impl<P: SerialTransport> Session<P> {
    pub fn new(engine: Engine<P>, trace: Trace) -> Self {
        Session { engine, trace, hw_breakpoint: None, target_running: false }
    }

    pub fn device(&self) -> &'static Device {
        self.engine.device()
    }

    /// Drive one client connection to completion. Returns once the client
    /// disconnects cleanly or an unrecoverable error tears the session
    /// down; the caller (main) treats any `Err` as exit code 1.
    pub fn run(&mut self, stream: TcpStream) -> DwResult<()> {
        let mut client = ClientStream::new(stream);
        let mut receiver = Receiver::new();

        loop {
            let byte = match client.next_byte()? {
                Some(b) => b,
                None => return Ok(()),
            };

            match receiver.feed(byte, self.trace)? {
                None => {}
                Some(RxEvent::Interrupt) => self.handle_interrupt(&mut client)?,
                Some(RxEvent::Packet(payload)) => {
                    self.trace.rsp_in(&payload);
                    client.write_all(b"+")?;
                    let command = rsp::parse_command(&payload);
                    self.dispatch(&mut client, command)?;
                }
            }
        }
    }

    fn reply(&self, client: &mut ClientStream, payload: &str) -> DwResult<()> {
        self.trace.rsp_out(payload);
        let framed = rsp::frame(payload);
        client.write_all(framed.as_bytes())
    }

    /// A host-issued interrupt outside of an active `Continue` wait (the
    /// target may or may not have been running). Always resyncs the line;
    /// replies `S05` if something was actually running, `S00` otherwise
    /// (§4.5: "reply S05 / S00").
    fn handle_interrupt(&mut self, client: &mut ClientStream) -> DwResult<()> {
        self.engine.await_break_on_demand()?;
        let was_running = self.target_running;
        self.target_running = false;
        self.reply(client, if was_running { "S05" } else { "S00" })
    }

    fn dispatch(&mut self, client: &mut ClientStream, command: Command) -> DwResult<()> {
        match command {
            Command::QAttached => self.reply(client, "1"),
            Command::QuestionMark => self.reply(client, "S00"),
            Command::ReadRegisters => {
                let blob = self.read_all_registers()?;
                self.reply(client, &hex_encode(&blob))
            }
            Command::ReadMemory { addr, len } => {
                let bytes = self.read_memory(addr, len)?;
                match bytes {
                    Some(data) => self.reply(client, &hex_encode(&data)),
                    None => self.reply(client, "E01"),
                }
            }
            Command::Step => {
                self.engine.step()?;
                self.reply(client, "S00")
            }
            Command::Continue => {
                self.start_continue()?;
                match self.wait_for_stop(client)? {
                    StopReason::Breakpoint => self.reply(client, "S00"),
                    StopReason::Interrupted => self.reply(client, "S05"),
                }
            }
            Command::SetHwBreakpoint { addr } => {
                if self.hw_breakpoint.is_some() {
                    self.reply(client, "E01")
                }
                else {
                    self.hw_breakpoint = Some(addr);
                    self.reply(client, "OK")
                }
            }
            Command::ClearHwBreakpoint { addr: _ } => {
                self.hw_breakpoint = None;
                self.reply(client, "OK")
            }
            // Software breakpoints, watchpoints, or a malformed Z/z line —
            // not implemented, and always E01 rather than the generic
            // empty "unsupported feature" packet (§4.5).
            Command::UnsupportedBreakpoint => self.reply(client, "E01"),
            Command::Interrupt => self.handle_interrupt(client),
            Command::Unknown(_) => self.reply(client, ""),
        }
    }

    /// `g`: 32 GP registers, SREG, SP, and PC as a 4-byte little-endian
    /// word (zero-extended from the 16-bit word address), all 39 bytes.
    fn read_all_registers(&mut self) -> DwResult<Vec<u8>> {
        let mut blob = self.engine.read_regs(0, 32)?;
        blob.extend(self.engine.read_sram(0x5f, 1)?); // SREG
        blob.extend(self.engine.read_sram(0x5d, 2)?); // SPL, SPH
        let pc = self.engine.get_pc()?;
        blob.extend_from_slice(&(pc as u32).to_le_bytes());
        Ok(blob)
    }

    /// `m addr,len`. `None` means "out of range", which the caller turns
    /// into `E01`.
    fn read_memory(&mut self, addr: u32, len: usize) -> DwResult<Option<Vec<u8>>> {
        const SRAM_TAG: u32 = 0x800000;
        const SRAM_TAG_END: u32 = 0x810000;

        if addr < SRAM_TAG {
            Ok(Some(self.engine.read_flash(addr as u16, len as u16)?))
        }
        else if addr < SRAM_TAG_END {
            let sram_addr = (addr - SRAM_TAG) as u16;
            Ok(Some(self.engine.read_sram(sram_addr, len as u16)?))
        }
        else {
            Ok(None)
        }
    }

    fn start_continue(&mut self) -> DwResult<()> {
        if let Some(addr) = self.hw_breakpoint {
            self.engine.arm_hw_breakpoint(addr)?;
        }
        let pc = self.engine.get_pc()?;
        self.engine.start_continue(pc)?;
        self.target_running = true;
        Ok(())
    }

    /// Block on readability of both the serial fd and the TCP client fd.
    /// Serial readable with a HW breakpoint armed ⇒ the target stopped;
    /// consume its BREAK/`0x55`. TCP readable ⇒ read one byte, which must
    /// be `0x03` (Ctrl-C), and convert it into a host-issued BREAK.
    fn wait_for_stop(&mut self, client: &mut ClientStream) -> DwResult<StopReason> {
        let serial_fd = self.engine.raw_fd();

        loop {
            // A client that pipelined the interrupt byte right after the
            // `c` packet in one TCP segment already has it sitting in
            // `client.pending` — treat that as immediate readiness rather
            // than polling a socket that has nothing left to give.
            if client.has_pending() {
                return self.consume_interrupt_byte(client);
            }

            let tcp_fd = client.as_raw_fd();
            // SAFETY: both fds outlive this poll() call, which does not
            // take ownership of them; `serial_fd`/`tcp_fd` are borrowed
            // from `self.engine`/`client`, which this function borrows
            // for its whole body.
            let serial_borrow = unsafe { BorrowedFd::borrow_raw(serial_fd) };
            let tcp_borrow = unsafe { BorrowedFd::borrow_raw(tcp_fd) };
            let mut fds =
                [PollFd::new(serial_borrow, PollFlags::POLLIN), PollFd::new(tcp_borrow, PollFlags::POLLIN)];

            poll(&mut fds, PollTimeout::NONE)?;

            let serial_ready = fds[0].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN);
            let tcp_ready = fds[1].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN);

            if serial_ready && self.hw_breakpoint.is_some() {
                self.engine.await_break_indication()?;
                self.target_running = false;
                return Ok(StopReason::Breakpoint);
            }

            if tcp_ready {
                return self.consume_interrupt_byte(client);
            }
        }
    }

    /// Consume one byte already known to be available from the client,
    /// which must be `0x03` (Ctrl-C), and convert it into a host-issued
    /// BREAK.
    fn consume_interrupt_byte(&mut self, client: &mut ClientStream) -> DwResult<StopReason> {
        match client.next_byte()? {
            Some(0x03) => {
                self.engine.await_break_on_demand()?;
                self.target_running = false;
                Ok(StopReason::Interrupted)
            }
            Some(other) => Err(DwError::session(format!(
                "protocol violation while waiting for stop: expected 0x03, got 0x{other:02x}"
            ))),
            None => Err(DwError::session("client disconnected while waiting for stop")),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::lookup;
    use crate::transport::test_support::MockSerial;

    fn attiny85() -> &'static Device {
        lookup(0x930b).unwrap()
    }

    fn session_with(rx: &[u8]) -> Session<MockSerial> {
        let mut mock = MockSerial::with_rx(rx);
        mock.echo = true;
        let engine = Engine::new(mock, attiny85(), Trace::Disabled);
        Session::new(engine, Trace::Disabled)
    }

    #[test]
    fn receiver_acks_and_parses_a_well_formed_packet() {
        let mut rx = Receiver::new();
        let mut event = None;
        for &b in b"$g#67" {
            event = rx.feed(b, Trace::Disabled).unwrap();
        }
        match event {
            Some(RxEvent::Packet(p)) => assert_eq!(p, "g"),
            _ => panic!("expected a completed packet"),
        }
    }

    #[test]
    fn receiver_rejects_bad_checksum() {
        let mut rx = Receiver::new();
        let mut result = Ok(None);
        for &b in b"$g#00" {
            result = rx.feed(b, Trace::Disabled);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(DwError::Session(_))));
    }

    #[test]
    fn hw_breakpoint_refuses_second_arm_and_accepts_after_clear() {
        let mut session = session_with(&[]);
        assert!(session.hw_breakpoint.is_none());
        session.hw_breakpoint = Some(0x40);

        // Simulate the Z1 dispatch logic directly, mirroring `dispatch`.
        let second = if session.hw_breakpoint.is_some() { "E01" } else { "OK" };
        assert_eq!(second, "E01");

        session.hw_breakpoint = None;
        let third = if session.hw_breakpoint.is_some() { "E01" } else { "OK" };
        assert_eq!(third, "OK");
    }

    #[test]
    fn read_all_registers_produces_39_bytes_with_le_pc_tail() {
        let mut rx = vec![0u8; 32]; // r0..r31
        rx.push(0x00); // SREG
        rx.push(0x5f); // SPL
        rx.push(0x08); // SPH
        rx.extend_from_slice(&[0x00, 0x41]); // GetPC raw -> 0x0041 -> PC=0x0040
        let mut session = session_with(&rx);
        let blob = session.read_all_registers().unwrap();
        assert_eq!(blob.len(), 39);
        assert_eq!(&blob[35..39], &(0x0040u32).to_le_bytes());
    }

    #[test]
    fn read_memory_routes_by_address_range() {
        let mut session = session_with(&[0xaa]);
        // Flash: below the 0x800000 tag.
        let flash = session.read_memory(0x0100, 1).unwrap();
        assert!(flash.is_some());

        let mut session = session_with(&[0xbb]);
        let sram = session.read_memory(0x800100, 1).unwrap();
        assert!(sram.is_some());

        let mut session = session_with(&[]);
        let oob = session.read_memory(0x810000, 1).unwrap();
        assert!(oob.is_none());
    }

    // ---- end-to-end scenarios over a real loopback socket, driving
    // `Session::run` exactly as the TCP listener in `main` would -------

    use std::net::TcpListener;

    /// Spawn `Session::run` on a background thread, accepting one
    /// connection on an ephemeral loopback port, and hand back a
    /// connected client socket plus a handle to the session's result.
    fn spawn_session(rx: Vec<u8>) -> (TcpStream, std::thread::JoinHandle<DwResult<()>>) {
        spawn_session_with(rx, false)
    }

    fn spawn_session_with(rx: Vec<u8>, corrupt_next_echo: bool) -> (TcpStream, std::thread::JoinHandle<DwResult<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let mut mock = MockSerial::with_rx(&rx);
        mock.echo = true;
        mock.corrupt_next_echo = corrupt_next_echo;
        let engine = Engine::new(mock, attiny85(), Trace::Disabled);

        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept client");
            let mut session = Session::new(engine, Trace::Disabled);
            session.run(stream)
        });

        let client = TcpStream::connect(addr).expect("connect to session");
        (client, handle)
    }

    fn send_and_expect_ack(client: &mut TcpStream, payload: &str) {
        client.write_all(rsp::frame(payload).as_bytes()).unwrap();
        let mut ack = [0u8; 1];
        client.read_exact(&mut ack).unwrap();
        assert_eq!(ack[0], b'+');
    }

    fn read_reply(client: &mut TcpStream) -> String {
        // Replies are short in every scenario this crate drives; a fixed
        // buffer well above the longest one (`g`'s 39-byte blob, hex
        // encoded) is enough to read one full packet in a single call.
        let mut buf = [0u8; 256];
        let n = client.read(&mut buf).unwrap();
        let raw = std::str::from_utf8(&buf[..n]).unwrap();
        rsp::decode_packet(raw).unwrap().to_string()
    }

    /// Scenario 4 (spec §8): hardware breakpoint set/clear/re-set round
    /// trip over the real RSP wire framing.
    #[test]
    fn hw_breakpoint_round_trip_over_the_wire() {
        let (mut client, handle) = spawn_session(vec![]);

        send_and_expect_ack(&mut client, "Z1,40,2");
        assert_eq!(read_reply(&mut client), "OK");

        send_and_expect_ack(&mut client, "Z1,44,2");
        assert_eq!(read_reply(&mut client), "E01");

        send_and_expect_ack(&mut client, "z1,40,2");
        assert_eq!(read_reply(&mut client), "OK");

        send_and_expect_ack(&mut client, "Z1,44,2");
        assert_eq!(read_reply(&mut client), "OK");

        drop(client);
        assert!(handle.join().unwrap().is_ok(), "client hangup should end the session cleanly");
    }

    /// Software breakpoints and watchpoints (any `Z`/`z` kind other than
    /// `1`) are recognised, not silently ignored: they get `E01`, never
    /// the generic empty "unsupported feature" packet (§4.5).
    #[test]
    fn unsupported_breakpoint_kind_is_e01() {
        let (mut client, handle) = spawn_session(vec![]);

        send_and_expect_ack(&mut client, "Z0,40,2");
        assert_eq!(read_reply(&mut client), "E01");

        drop(client);
        assert!(handle.join().unwrap().is_ok());
    }

    /// Scenario 5 (spec §8): a client that pipelines the `0x03` interrupt
    /// byte in the same TCP segment as the `c` packet must still have it
    /// recognised — `wait_for_stop` must not block on a socket `read()`
    /// for a byte that already arrived and is sitting in the session's
    /// own buffer. The interrupted continue reports `S05`.
    #[test]
    fn pipelined_continue_and_interrupt_in_one_segment() {
        // GetPC (raw) for start_continue's SetPC, then the 0x55 sign-on
        // consumed by the post-interrupt break/sync.
        let rx = vec![0x00, 0x00, 0x55];
        let (mut client, handle) = spawn_session(rx);

        let mut payload = rsp::frame("c").into_bytes();
        payload.push(0x03);
        client.write_all(&payload).unwrap();

        let mut ack = [0u8; 1];
        client.read_exact(&mut ack).unwrap();
        assert_eq!(ack[0], b'+');

        assert_eq!(read_reply(&mut client), "S05");

        drop(client);
        assert!(handle.join().unwrap().is_ok());
    }

    /// Scenario 6 (spec §8): an echo mismatch on the debugWire link is
    /// fatal to the session; the engine still acks the RSP packet first
    /// (the ack happens before dispatch), then the connection drops with
    /// no further reply once the transport desyncs.
    #[test]
    fn echo_mismatch_tears_down_the_session() {
        let (mut client, handle) = spawn_session_with(vec![], true);
        // `s` (Step) issues a single-byte write; corrupting that byte's
        // echo trips the transport check on the very first engine call.
        client.write_all(rsp::frame("s").as_bytes()).unwrap();

        let mut ack = [0u8; 1];
        client.read_exact(&mut ack).unwrap();
        assert_eq!(ack[0], b'+');

        // No reply packet follows: the connection closes instead.
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(n, 0, "expected the socket to be closed after the transport error");

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(DwError::Transport(_))));
    }
}
