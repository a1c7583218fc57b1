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

    engine.rs

    Component C4: the debugWire protocol engine. Everything here is a
    fixed byte sequence streamed through `transport::Link`; the only
    cleverness is the save/restore discipline around the primitives that
    clobber the target's PC and Y/Z register pair (r28..r31), and the
    composition of higher-level operations (SRAM/flash/fuse reads) out
    of `IN`/`OUT`/`LPM` instructions injected one word at a time.
*/

use crate::device::Device;
use crate::error::{DwError, DwResult};
use crate::line::SerialTransport;
use crate::trace::Trace;
use crate::transport::Link;
use std::fmt;
use std::os::unix::io::RawFd;

/// `LPM r0, Z+`: load the byte at the flash address in Z into r0, then
/// post-increment Z. Used both for fuse/lock-bit reads and for streaming
/// flash reads.
const INST_LPM_R0_ZPLUS: u16 = 0x9005;
/// The single fixed instruction the fuse reader uses: `LPM r0, Z` without
/// post-increment, matching the original implementation, which only ever
/// reads one fuse byte per Z setup.
const INST_LPM_R0_Z: u16 = 0x95c8;
/// `RFLB | SELFPRGEN`, loaded into r29 before `OUT SPMCSR, r29` to select
/// "read fuse/lock bits" mode.
const SPMCSR_RFLB_SELFPRGEN: u8 = 0b0000_1001;

/// Opcode pairing taken from contemporaneous debugWire reverse-engineering
/// notes: `Go` (free-run) and `SingleStep` are adjacent single-byte
/// commands. The exact step wrapper byte is an open question noted in
/// the design log; `0x31` is this engine's choice, one past `Go`.
const OP_GO: u8 = 0x30;
const OP_SINGLE_STEP: u8 = 0x31;
/// Loads the target word-address into the debugWire hardware breakpoint
/// comparator. Not in the primary opcode table the way `SetPC`/`GetPC`
/// are — the engine's job here is simply "load the address" per the
/// hardware-breakpoint design note, and `0xD1` (immediately after
/// `SetPC`'s `0xD0`) is this engine's choice of byte, on the same
/// footing as the single-step wrapper opcode choice above.
const OP_SET_HW_BREAKPOINT: u8 = 0xd1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fuses {
    pub low: u8,
    pub high: u8,
    pub extended: u8,
    pub lockbit: u8,
}

impl fmt::Display for Fuses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "low=0x{:02x}, high=0x{:02x}, extended=0x{:02x}, lockbit=0x{:02x}",
            self.low, self.high, self.extended, self.lockbit
        )
    }
}

pub struct Engine<P: SerialTransport> {
    port: P,
    device: &'static Device,
    trace: Trace,
}

impl<P: SerialTransport> Engine<P> {
    pub fn new(port: P, device: &'static Device, trace: Trace) -> Self {
        Engine { port, device, trace }
    }

    pub fn device(&self) -> &'static Device {
        self.device
    }

    pub fn into_port(self) -> P {
        self.port
    }

    fn link(&mut self) -> Link<'_> {
        Link::new(&mut self.port, self.trace)
    }

    // ---- primitive opcodes (§4.4) -----------------------------------

    /// Permanently exit debugWire until the next SPI reprogramming.
    pub fn disable(&mut self) -> DwResult<()> {
        self.link().write_byte(0x06)
    }

    /// Soft-reset the target: BREAK, `0x07`, await a fresh `0x55`.
    pub fn reset(&mut self) -> DwResult<()> {
        {
            let mut link = self.link();
            link.break_and_sync()?;
            link.write_byte(0x07)?;
        }
        self.await_break_indication()
    }

    /// The raw `GetPC` register value, with no reporting correction
    /// applied. This is what must be cached and restored around a
    /// memory-read primitive (§3 invariant 1): if the cache/restore
    /// round-trip went through the corrected value instead, every
    /// `read_sram`/`read_flash`/`read_fuses` call would leave the target's
    /// PC one word lower than it was beforehand.
    fn raw_pc(&mut self) -> DwResult<u16> {
        let mut link = self.link();
        link.write_byte(0xf0)?;
        link.read_word_be()
    }

    /// PC as reported to the debugger: one word past the halt point, so
    /// subtract 1 before returning (unless already zero).
    pub fn get_pc(&mut self) -> DwResult<u16> {
        let raw = self.raw_pc()?;
        Ok(if raw == 0 { raw } else { raw - 1 })
    }

    pub fn set_pc(&mut self, pc: u16) -> DwResult<()> {
        self.link().write(&[0xd0, (pc >> 8) as u8, pc as u8])
    }

    pub fn read_regs(&mut self, start: u8, len: u8) -> DwResult<Vec<u8>> {
        let end = start.wrapping_add(len);
        let mut link = self.link();
        link.write(&[0x66, 0xc2, 0x01, 0xd0, 0x00, start, 0xd1, 0x00, end, 0x20])?;
        link.read(len as usize)
    }

    pub fn write_regs(&mut self, start: u8, values: &[u8]) -> DwResult<()> {
        let end = start.wrapping_add(values.len() as u8);
        let mut link = self.link();
        link.write(&[0x66, 0xc2, 0x05, 0xd0, 0x00, start, 0xd1, 0x00, end, 0x20])?;
        link.write(values)
    }

    pub fn write_instruction(&mut self, inst: u16) -> DwResult<()> {
        self.link().write(&[0x64, 0xd2, (inst >> 8) as u8, inst as u8, 0x23])
    }

    pub fn instruction_in(&mut self, address: u8, reg: u8) -> DwResult<()> {
        self.write_instruction(
            0xb000 | (((address & 0x30) as u16) << 5) | (((reg & 0x1f) as u16) << 4) | ((address & 0x0f) as u16),
        )
    }

    pub fn instruction_out(&mut self, address: u8, reg: u8) -> DwResult<()> {
        self.write_instruction(
            0xb800 | (((address & 0x30) as u16) << 5) | (((reg & 0x1f) as u16) << 4) | ((address & 0x0f) as u16),
        )
    }

    // ---- cache/restore discipline (§3 invariant 1, §4.4) ------------

    pub fn cache_pc(&mut self) -> DwResult<u16> {
        self.raw_pc()
    }

    pub fn restore_pc(&mut self, pc: u16) -> DwResult<()> {
        self.set_pc(pc)
    }

    pub fn cache_yz(&mut self) -> DwResult<[u8; 4]> {
        let bytes = self.read_regs(28, 4)?;
        Ok([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    pub fn restore_yz(&mut self, yz: [u8; 4]) -> DwResult<()> {
        self.write_regs(28, &yz)
    }

    /// Cache PC and Y/Z, run `f`, then restore both before returning —
    /// regardless of whether `f` succeeded. This is how every memory-read
    /// primitive below satisfies the "PC and Y/Z are bit-identical
    /// before and after" invariant without leaning on callers to
    /// remember the discipline themselves.
    fn with_pc_yz_preserved<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> DwResult<T>,
    ) -> DwResult<T> {
        let pc = self.cache_pc()?;
        let yz = self.cache_yz()?;

        let result = f(self);

        self.restore_yz(yz)?;
        self.restore_pc(pc)?;

        result
    }

    /// Read `len` bytes of SRAM starting at `addr`, using Z as the
    /// pointer. The byte count sent to the target is doubled because its
    /// counter counts bus cycles, not bytes.
    pub fn read_sram(&mut self, addr: u16, len: u16) -> DwResult<Vec<u8>> {
        self.with_pc_yz_preserved(|eng| {
            eng.write_regs(30, &[addr as u8, (addr >> 8) as u8])?;
            let count = 2u32 * len as u32;
            let mut link = eng.link();
            link.write(&[
                0x66,
                0xc2,
                0x00,
                0xd0,
                0x00,
                0x00,
                0xd1,
                (count >> 8) as u8,
                count as u8,
                0x20,
            ])?;
            link.read(len as usize)
        })
    }

    /// Read `len` bytes of flash starting at byte address `addr`, one
    /// `LPM Rd, Z+` at a time, the same primitive the fuse reader uses
    /// for a single byte.
    pub fn read_flash(&mut self, addr: u16, len: u16) -> DwResult<Vec<u8>> {
        self.with_pc_yz_preserved(|eng| {
            eng.write_regs(30, &[addr as u8, (addr >> 8) as u8])?;
            let mut out = Vec::with_capacity(len as usize);
            for _ in 0..len {
                eng.write_instruction(INST_LPM_R0_ZPLUS)?;
                out.push(eng.read_regs(0, 1)?[0]);
            }
            Ok(out)
        })
    }

    /// Read one fuse/lock byte: select it via r29/r30/r31, `OUT` into
    /// SPMCSR, then `LPM` it into r0 and read r0 back.
    fn read_one_fuse(&mut self, fuse_index: u8) -> DwResult<u8> {
        self.write_regs(29, &[SPMCSR_RFLB_SELFPRGEN, fuse_index, 0])?;
        let spmcsr = self.device.spmcsr;
        self.instruction_out(spmcsr, 29)?;
        self.write_instruction(INST_LPM_R0_Z)?;
        Ok(self.read_regs(0, 1)?[0])
    }

    /// Read the four fuse/lock bytes through SPMCSR, in the order
    /// low/high/extended/lockbit.
    pub fn read_fuses(&mut self) -> DwResult<Fuses> {
        self.with_pc_yz_preserved(|eng| {
            let low = eng.read_one_fuse(0)?;
            let high = eng.read_one_fuse(3)?;
            let extended = eng.read_one_fuse(2)?;
            let lockbit = eng.read_one_fuse(1)?;
            Ok(Fuses { low, high, extended, lockbit })
        })
    }

    /// Single-step: load a NOP into the instruction register behind the
    /// single-step wrapper opcode, then await the target's own auto-halt
    /// break indication.
    pub fn step(&mut self) -> DwResult<()> {
        self.link().write_byte(OP_SINGLE_STEP)?;
        self.write_instruction(0x0000)?;
        self.await_break_indication()
    }

    /// Load the hardware breakpoint comparator with a target word-address.
    pub fn arm_hw_breakpoint(&mut self, addr: u16) -> DwResult<()> {
        self.link().write(&[OP_SET_HW_BREAKPOINT, (addr >> 8) as u8, addr as u8])
    }

    /// Set PC and issue the free-run opcode. Does **not** wait for the
    /// target to stop — the caller (the RSP session) is responsible for
    /// multiplexing the serial fd against the TCP fd and calling
    /// [`Engine::await_break_indication`] once the former is readable.
    pub fn start_continue(&mut self, pc: u16) -> DwResult<()> {
        self.set_pc(pc)?;
        self.link().write_byte(OP_GO)
    }

    /// Block until the target signals a stop: discard any `0x00`/`0xff`
    /// line-idle bytes (the BREAK edge artefact) and require the first
    /// other byte to be `0x55`. Used after `Continue`/`Step`/`Reset`.
    pub fn await_break_indication(&mut self) -> DwResult<()> {
        let mut link = self.link();
        loop {
            let b = link.read_byte()?;
            if b == 0x00 || b == 0xff {
                continue;
            }
            if b != 0x55 {
                return Err(DwError::protocol(format!(
                    "Bad break response from MCU. Expected 0x55, got 0x{b:02x}"
                )));
            }
            return Ok(());
        }
    }

    /// Host-initiated interrupt (RSP `0x03`, or a breakpoint wait being
    /// aborted): assert BREAK on the line and consume the target's
    /// `0x55` sign-on, exactly like [`Engine::reset`]'s sync phase but
    /// without the `0x07` soft-reset opcode.
    pub fn await_break_on_demand(&mut self) -> DwResult<()> {
        self.link().break_and_sync()
    }

    /// The fd backing this engine's serial transport, so the RSP session
    /// can multiplex it against the TCP client fd in `wait_for_stop`.
    pub fn raw_fd(&self) -> RawFd {
        self.port.raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::lookup;
    use crate::transport::test_support::MockSerial;

    fn attiny85() -> &'static Device {
        lookup(0x930b).unwrap()
    }

    fn engine_with(rx: &[u8]) -> Engine<MockSerial> {
        let mut mock = MockSerial::with_rx(rx);
        mock.echo = true;
        Engine::new(mock, attiny85(), Trace::Disabled)
    }

    #[test]
    fn get_pc_subtracts_one_when_nonzero() {
        let mut eng = engine_with(&[0x00, 0x41]); // target returns 0x0041
        assert_eq!(eng.get_pc().unwrap(), 0x0040);
    }

    #[test]
    fn get_pc_leaves_zero_untouched() {
        let mut eng = engine_with(&[0x00, 0x00]);
        assert_eq!(eng.get_pc().unwrap(), 0x0000);
    }

    #[test]
    fn read_sram_preserves_pc_and_yz() {
        // Sequence consumed, in order: cache_pc (GetPC word), cache_yz
        // (ReadRegs(28,4) -> 4 bytes), write_regs(30, addr) [echoed],
        // the SRAM read preamble [echoed], 1 data byte, then the
        // with_pc_yz_preserved restore calls (write_regs + SetPC, both
        // echoed, no extra rx needed).
        let mut rx = vec![];
        rx.extend_from_slice(&[0x00, 0x40]); // cache_pc -> GetPC returns 0x0040 (after -1 -> 0x3f... not important)
        rx.extend_from_slice(&[1, 2, 3, 4]); // cache_yz -> ReadRegs(28,4)
        rx.extend_from_slice(&[0xaa]); // the actual SRAM data byte
        let mut eng = engine_with(&rx);
        let data = eng.read_sram(0x5f, 1).unwrap();
        assert_eq!(data, vec![0xaa]);
    }

    #[test]
    fn read_fuses_produces_expected_string_order() {
        let mut rx = vec![];
        rx.extend_from_slice(&[0x00, 0x10]); // cache_pc
        rx.extend_from_slice(&[1, 2, 3, 4]); // cache_yz
        rx.push(0xaa); // low
        rx.push(0xbb); // high
        rx.push(0xcc); // extended
        rx.push(0xdd); // lockbit
        let mut eng = engine_with(&rx);
        let fuses = eng.read_fuses().unwrap();
        assert_eq!(fuses.to_string(), "low=0xaa, high=0xbb, extended=0xcc, lockbit=0xdd");
    }

    #[test]
    fn instruction_in_out_encoding() {
        // IN r16, 0x16 -> 0xB000 | ((0x16&0x30)<<5) | (0x10<<4) | (0x16&0x0F)
        let addr = 0x16u8;
        let reg = 16u8;
        let expected_in = 0xb000 | (((addr & 0x30) as u16) << 5) | (((reg & 0x1f) as u16) << 4) | ((addr & 0x0f) as u16);
        let expected_out = 0xb800 | (((addr & 0x30) as u16) << 5) | (((reg & 0x1f) as u16) << 4) | ((addr & 0x0f) as u16);
        assert_eq!(expected_in & 0xf800, 0xb000);
        assert_eq!(expected_out & 0xf800, 0xb800);
    }

    #[test]
    fn read_sram_restores_raw_pc_not_the_reported_value() {
        // cache_pc must use the raw (uncorrected) GetPC value so the
        // eventual SetPC restores exactly what was there before, per §3
        // invariant 1 — not the debugger-facing value with the reporting
        // "-1" baked in, which would leave the target one word short.
        let mut rx = vec![];
        rx.extend_from_slice(&[0x00, 0x40]); // cache_pc (raw) -> 0x0040
        rx.extend_from_slice(&[1, 2, 3, 4]); // cache_yz
        rx.push(0xaa); // SRAM data byte
        let mut eng = engine_with(&rx);
        eng.read_sram(0x5f, 1).unwrap();
        let mock = eng.into_port();
        // The restore's SetPC call is the last 3 bytes written: 0xd0, hi, lo.
        let tail = &mock.tx_log[mock.tx_log.len() - 3..];
        assert_eq!(tail, &[0xd0, 0x00, 0x40]);
    }

    #[test]
    fn await_break_indication_discards_idle_bytes() {
        let mut eng = engine_with(&[0x00, 0xff, 0x55]);
        eng.await_break_indication().unwrap();
    }
}
