//! # Machine Register Model
//!
//! Fixed-layout register state of one x86_64 thread, split into the three
//! register sets the remote protocol knows: general purpose, floating
//! point and exception state. The exception state can only be read, the
//! hardware offers no way to write it back.
//!
//! The whole state of a thread serializes into one contiguous register
//! context blob of exactly [`REGISTER_CONTEXT_SIZE`] bytes. The layout of
//! that blob is fixed: all general purpose registers in id order, then the
//! floating point fields, then the exception fields, with no padding. The
//! byte offsets that [`map::RegisterMap`](crate::registers::map) computes
//! point into this blob.

use crate::errors::{Result, StubError};

pub mod descriptors;
pub mod map;

/// Register set id of the aggregate pseudo set (holds no registers itself)
pub const REGISTER_SET_AGGREGATE: u32 = 0;
/// Register set id of the general purpose registers
pub const REGISTER_SET_GPR: u32 = 1;
/// Register set id of the floating point registers
pub const REGISTER_SET_FPU: u32 = 2;
/// Register set id of the read-only exception state registers
pub const REGISTER_SET_EXC: u32 = 3;

/// The trace bit of `rflags`; setting it makes the processor trap after
/// every instruction
pub const TRACE_FLAG: u64 = 0x100;

/// General purpose register state, one `u64` slot per register
///
/// Field order is the id order of the register set descriptors and the
/// serialization order of the register context blob.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GprState {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub fs: u64,
    pub gs: u64,
}

/// How many full (non pseudo) general purpose registers there are
const GPR_FULL_COUNT: u32 = 21;

impl GprState {
    fn value(&self, id: u32) -> Option<u64> {
        Some(match id {
            0 => self.rax,
            1 => self.rbx,
            2 => self.rcx,
            3 => self.rdx,
            4 => self.rdi,
            5 => self.rsi,
            6 => self.rbp,
            7 => self.rsp,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            16 => self.rip,
            17 => self.rflags,
            18 => self.cs,
            19 => self.fs,
            20 => self.gs,
            _ => return None,
        })
    }

    fn set_value(&mut self, id: u32, value: u64) -> bool {
        let slot = match id {
            0 => &mut self.rax,
            1 => &mut self.rbx,
            2 => &mut self.rcx,
            3 => &mut self.rdx,
            4 => &mut self.rdi,
            5 => &mut self.rsi,
            6 => &mut self.rbp,
            7 => &mut self.rsp,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            15 => &mut self.r15,
            16 => &mut self.rip,
            17 => &mut self.rflags,
            18 => &mut self.cs,
            19 => &mut self.fs,
            20 => &mut self.gs,
            _ => return false,
        };
        *slot = value;
        true
    }

    /// Resolves a pseudo register id to `(full register id, byte offset,
    /// byte size)` of the storage its value lives in
    ///
    /// The id layout follows the register set descriptors: 32 bit views
    /// come right after the full registers, then the 16 bit views, the four
    /// high byte views and finally the low byte views.
    fn contained_slot(id: u32) -> Option<(u32, usize, usize)> {
        match id {
            21..=36 => Some((id - 21, 0, 4)),
            37..=52 => Some((id - 37, 0, 2)),
            53..=56 => Some((id - 53, 1, 1)),
            57..=72 => Some((id - 57, 0, 1)),
            _ => None,
        }
    }

    fn read(&self, id: u32, dest: &mut [u8]) -> Result<usize> {
        if let Some(value) = self.value(id) {
            assert!(dest.len() >= 8, "destination buffer is too small");
            dest[..8].copy_from_slice(&value.to_le_bytes());
            return Ok(8);
        }
        let (parent, offset, size) =
            Self::contained_slot(id).ok_or(StubError::InvalidRegisterId)?;
        let bytes = self.value(parent).expect("pseudo register without parent").to_le_bytes();
        assert!(dest.len() >= size, "destination buffer is too small");
        dest[..size].copy_from_slice(&bytes[offset..offset + size]);
        Ok(size)
    }

    fn write(&mut self, id: u32, source: &[u8]) -> Result<()> {
        if self.value(id).is_some() {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&source[..8]);
            self.set_value(id, u64::from_le_bytes(bytes));
            return Ok(());
        }
        let (parent, offset, size) =
            Self::contained_slot(id).ok_or(StubError::InvalidRegisterId)?;
        let mut bytes = self.value(parent).expect("pseudo register without parent").to_le_bytes();
        bytes[offset..offset + size].copy_from_slice(&source[..size]);
        self.set_value(parent, u64::from_le_bytes(bytes));
        Ok(())
    }
}

/// Floating point register state in the layout of the FXSAVE area fields
/// this crate exposes
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FpuState {
    pub fcw: u16,
    pub fsw: u16,
    pub ftw: u8,
    pub fop: u16,
    pub fioff: u32,
    pub fiseg: u16,
    pub fooff: u32,
    pub foseg: u16,
    pub mxcsr: u32,
    pub mxcsrmask: u32,
    pub stmm: [[u8; 10]; 8],
    pub xmm: [[u8; 16]; 16],
}

/// Copies one register value into the destination buffer
fn copy_register_bytes(dest: &mut [u8], bytes: &[u8]) -> Result<usize> {
    assert!(dest.len() >= bytes.len(), "destination buffer is too small");
    dest[..bytes.len()].copy_from_slice(bytes);
    Ok(bytes.len())
}

impl FpuState {
    fn read(&self, id: u32, dest: &mut [u8]) -> Result<usize> {
        let copy = copy_register_bytes;
        match id {
            0 => copy(dest, &self.fcw.to_le_bytes()),
            1 => copy(dest, &self.fsw.to_le_bytes()),
            2 => copy(dest, &self.ftw.to_le_bytes()),
            3 => copy(dest, &self.fop.to_le_bytes()),
            4 => copy(dest, &self.fioff.to_le_bytes()),
            5 => copy(dest, &self.fiseg.to_le_bytes()),
            6 => copy(dest, &self.fooff.to_le_bytes()),
            7 => copy(dest, &self.foseg.to_le_bytes()),
            8 => copy(dest, &self.mxcsr.to_le_bytes()),
            9 => copy(dest, &self.mxcsrmask.to_le_bytes()),
            10..=17 => copy(dest, &self.stmm[(id - 10) as usize]),
            18..=33 => copy(dest, &self.xmm[(id - 18) as usize]),
            _ => Err(StubError::InvalidRegisterId),
        }
    }

    fn write(&mut self, id: u32, source: &[u8]) -> Result<()> {
        fn to_array<const N: usize>(source: &[u8]) -> [u8; N] {
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(&source[..N]);
            bytes
        }
        match id {
            0 => self.fcw = u16::from_le_bytes(to_array(source)),
            1 => self.fsw = u16::from_le_bytes(to_array(source)),
            2 => self.ftw = source[0],
            3 => self.fop = u16::from_le_bytes(to_array(source)),
            4 => self.fioff = u32::from_le_bytes(to_array(source)),
            5 => self.fiseg = u16::from_le_bytes(to_array(source)),
            6 => self.fooff = u32::from_le_bytes(to_array(source)),
            7 => self.foseg = u16::from_le_bytes(to_array(source)),
            8 => self.mxcsr = u32::from_le_bytes(to_array(source)),
            9 => self.mxcsrmask = u32::from_le_bytes(to_array(source)),
            10..=17 => self.stmm[(id - 10) as usize] = to_array(source),
            18..=33 => self.xmm[(id - 18) as usize] = to_array(source),
            _ => return Err(StubError::InvalidRegisterId),
        }
        Ok(())
    }
}

/// Exception state registers; get only, the hardware state cannot be
/// written back
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExcState {
    pub trapno: u32,
    pub err: u32,
    pub faultvaddr: u64,
}

impl ExcState {
    fn read(&self, id: u32, dest: &mut [u8]) -> Result<usize> {
        match id {
            0 => copy_register_bytes(dest, &self.trapno.to_le_bytes()),
            1 => copy_register_bytes(dest, &self.err.to_le_bytes()),
            2 => copy_register_bytes(dest, &self.faultvaddr.to_le_bytes()),
            _ => Err(StubError::InvalidRegisterId),
        }
    }
}

const GPR_CONTEXT_SIZE: usize = GPR_FULL_COUNT as usize * 8;
const FPU_CONTEXT_SIZE: usize = 2 + 2 + 1 + 2 + 4 + 2 + 4 + 2 + 4 + 4 + 8 * 10 + 16 * 16;
const EXC_CONTEXT_SIZE: usize = 4 + 4 + 8;

/// Exact size of the serialized register context of one thread
pub const REGISTER_CONTEXT_SIZE: usize = GPR_CONTEXT_SIZE + FPU_CONTEXT_SIZE + EXC_CONTEXT_SIZE;

/// The full register state of one thread across all register sets
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RegisterContext {
    pub gpr: GprState,
    pub fpu: FpuState,
    pub exc: ExcState,
}

impl RegisterContext {
    /// Reads one register value into `dest`, returning how many bytes were
    /// written
    ///
    /// # Errors
    ///
    /// Fails with [`StubError::InvalidRegisterSetId`] for an unknown set and
    /// [`StubError::InvalidRegisterId`] for an unknown register.
    ///
    /// # Panics
    ///
    /// If `dest` is smaller than the register. That is a bug in the caller,
    /// all callers size their buffers with [`REGISTER_CONTEXT_SIZE`].
    pub fn get_register_value(&self, set_id: u32, register_id: u32, dest: &mut [u8]) -> Result<usize> {
        match set_id {
            REGISTER_SET_GPR => self.gpr.read(register_id, dest),
            REGISTER_SET_FPU => self.fpu.read(register_id, dest),
            REGISTER_SET_EXC => self.exc.read(register_id, dest),
            _ => Err(StubError::InvalidRegisterSetId),
        }
    }

    /// Writes one register value from `source`
    ///
    /// # Errors
    ///
    /// Fails like [`Self::get_register_value`], and with
    /// [`StubError::RegisterSetReadOnly`] for the exception state set.
    pub fn set_register_value(&mut self, set_id: u32, register_id: u32, source: &[u8]) -> Result<()> {
        match set_id {
            REGISTER_SET_GPR => self.gpr.write(register_id, source),
            REGISTER_SET_FPU => self.fpu.write(register_id, source),
            REGISTER_SET_EXC => Err(StubError::RegisterSetReadOnly),
            _ => Err(StubError::InvalidRegisterSetId),
        }
    }

    /// Serializes the whole context into `dest`
    ///
    /// # Panics
    ///
    /// If `dest` is smaller than [`REGISTER_CONTEXT_SIZE`]; violating the
    /// size precondition is a caller bug, not a runtime condition.
    pub fn serialize(&self, dest: &mut [u8]) -> usize {
        assert!(
            dest.len() >= REGISTER_CONTEXT_SIZE,
            "register context buffer is too small"
        );
        let mut cursor = 0usize;
        let mut put = |bytes: &[u8]| {
            dest[cursor..cursor + bytes.len()].copy_from_slice(bytes);
            cursor += bytes.len();
        };
        for id in 0..GPR_FULL_COUNT {
            put(&self.gpr.value(id).expect("full gpr id").to_le_bytes());
        }
        put(&self.fpu.fcw.to_le_bytes());
        put(&self.fpu.fsw.to_le_bytes());
        put(&self.fpu.ftw.to_le_bytes());
        put(&self.fpu.fop.to_le_bytes());
        put(&self.fpu.fioff.to_le_bytes());
        put(&self.fpu.fiseg.to_le_bytes());
        put(&self.fpu.fooff.to_le_bytes());
        put(&self.fpu.foseg.to_le_bytes());
        put(&self.fpu.mxcsr.to_le_bytes());
        put(&self.fpu.mxcsrmask.to_le_bytes());
        for stmm in &self.fpu.stmm {
            put(stmm);
        }
        for xmm in &self.fpu.xmm {
            put(xmm);
        }
        put(&self.exc.trapno.to_le_bytes());
        put(&self.exc.err.to_le_bytes());
        put(&self.exc.faultvaddr.to_le_bytes());
        debug_assert_eq!(cursor, REGISTER_CONTEXT_SIZE);
        REGISTER_CONTEXT_SIZE
    }

    /// Rebuilds a context from a serialized blob
    ///
    /// # Panics
    ///
    /// If `source` is smaller than [`REGISTER_CONTEXT_SIZE`].
    pub fn deserialize(source: &[u8]) -> Self {
        assert!(
            source.len() >= REGISTER_CONTEXT_SIZE,
            "register context buffer is too small"
        );
        fn take<'a>(source: &'a [u8], cursor: &mut usize, len: usize) -> &'a [u8] {
            let bytes = &source[*cursor..*cursor + len];
            *cursor += len;
            bytes
        }
        fn u64_of(bytes: &[u8]) -> u64 {
            let mut array = [0u8; 8];
            array.copy_from_slice(bytes);
            u64::from_le_bytes(array)
        }
        fn u32_of(bytes: &[u8]) -> u32 {
            let mut array = [0u8; 4];
            array.copy_from_slice(bytes);
            u32::from_le_bytes(array)
        }
        fn u16_of(bytes: &[u8]) -> u16 {
            let mut array = [0u8; 2];
            array.copy_from_slice(bytes);
            u16::from_le_bytes(array)
        }
        let mut context = RegisterContext::default();
        let mut cursor = 0usize;
        for id in 0..GPR_FULL_COUNT {
            let value = u64_of(take(source, &mut cursor, 8));
            context.gpr.set_value(id, value);
        }
        context.fpu.fcw = u16_of(take(source, &mut cursor, 2));
        context.fpu.fsw = u16_of(take(source, &mut cursor, 2));
        context.fpu.ftw = take(source, &mut cursor, 1)[0];
        context.fpu.fop = u16_of(take(source, &mut cursor, 2));
        context.fpu.fioff = u32_of(take(source, &mut cursor, 4));
        context.fpu.fiseg = u16_of(take(source, &mut cursor, 2));
        context.fpu.fooff = u32_of(take(source, &mut cursor, 4));
        context.fpu.foseg = u16_of(take(source, &mut cursor, 2));
        context.fpu.mxcsr = u32_of(take(source, &mut cursor, 4));
        context.fpu.mxcsrmask = u32_of(take(source, &mut cursor, 4));
        for i in 0..8 {
            context.fpu.stmm[i].copy_from_slice(take(source, &mut cursor, 10));
        }
        for i in 0..16 {
            context.fpu.xmm[i].copy_from_slice(take(source, &mut cursor, 16));
        }
        context.exc.trapno = u32_of(take(source, &mut cursor, 4));
        context.exc.err = u32_of(take(source, &mut cursor, 4));
        context.exc.faultvaddr = u64_of(take(source, &mut cursor, 8));
        debug_assert_eq!(cursor, REGISTER_CONTEXT_SIZE);
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_context() -> RegisterContext {
        let mut context = RegisterContext::default();
        context.gpr.rax = 0xDEAD_1007;
        context.gpr.rsp = 0x7fff_0000_1000;
        context.gpr.rip = 0x4091;
        context.gpr.rflags = 0x246;
        context.fpu.mxcsr = 0x1f80;
        context.fpu.xmm[3] = [7; 16];
        context.fpu.stmm[0] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        context.exc.trapno = 3;
        context.exc.faultvaddr = 0x1234;
        context
    }

    #[test]
    fn test_context_round_trip_is_byte_identical() {
        let context = sample_context();
        let mut blob = vec![0u8; REGISTER_CONTEXT_SIZE];
        assert_eq!(context.serialize(&mut blob), REGISTER_CONTEXT_SIZE);
        let restored = RegisterContext::deserialize(&blob);
        assert_eq!(context, restored);

        let mut blob_again = vec![0u8; REGISTER_CONTEXT_SIZE];
        restored.serialize(&mut blob_again);
        assert_eq!(blob, blob_again);
    }

    #[test]
    fn test_gpr_value_read_write() {
        let mut context = sample_context();
        let mut dest = [0u8; 8];
        assert_eq!(
            context
                .get_register_value(REGISTER_SET_GPR, 0, &mut dest)
                .unwrap(),
            8
        );
        assert_eq!(u64::from_le_bytes(dest), 0xDEAD_1007);

        context
            .set_register_value(REGISTER_SET_GPR, 16, &0xbeef_u64.to_le_bytes())
            .unwrap();
        assert_eq!(context.gpr.rip, 0xbeef);
    }

    #[test]
    fn test_pseudo_registers_are_views() {
        let mut context = RegisterContext::default();
        context.gpr.rax = 0x1122_3344_5566_7788;

        // eax is the low 32 bit view of rax.
        let mut dest = [0u8; 8];
        assert_eq!(
            context
                .get_register_value(REGISTER_SET_GPR, 21, &mut dest)
                .unwrap(),
            4
        );
        assert_eq!(&dest[..4], &0x5566_7788_u32.to_le_bytes());

        // ah is byte 1 of rax.
        assert_eq!(
            context
                .get_register_value(REGISTER_SET_GPR, 53, &mut dest)
                .unwrap(),
            1
        );
        assert_eq!(dest[0], 0x66);

        // Writing ax must only touch the low 16 bits.
        context
            .set_register_value(REGISTER_SET_GPR, 37, &[0xcd, 0xab])
            .unwrap();
        assert_eq!(context.gpr.rax, 0x1122_3344_5566_abcd);
    }

    #[test]
    fn test_exception_set_is_read_only() {
        let mut context = sample_context();
        let mut dest = [0u8; 8];
        assert_eq!(
            context
                .get_register_value(REGISTER_SET_EXC, 0, &mut dest)
                .unwrap(),
            4
        );
        assert!(matches!(
            context.set_register_value(REGISTER_SET_EXC, 0, &dest),
            Err(StubError::RegisterSetReadOnly)
        ));
    }

    #[test]
    fn test_unknown_ids_fail() {
        let context = RegisterContext::default();
        let mut dest = [0u8; 8];
        assert!(matches!(
            context.get_register_value(9, 0, &mut dest),
            Err(StubError::InvalidRegisterSetId)
        ));
        assert!(matches!(
            context.get_register_value(REGISTER_SET_GPR, 73, &mut dest),
            Err(StubError::InvalidRegisterId)
        ));
        assert!(matches!(
            context.get_register_value(REGISTER_SET_FPU, 34, &mut dest),
            Err(StubError::InvalidRegisterId)
        ));
        assert!(matches!(
            context.get_register_value(REGISTER_SET_EXC, 3, &mut dest),
            Err(StubError::InvalidRegisterId)
        ));
    }
}
