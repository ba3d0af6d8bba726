//! # Register Set Descriptors
//!
//! Static description of every register the remote protocol can name on
//! x86_64: the three register sets, the id of each register inside its
//! state, wire encoding/format, DWARF and eh_frame numbers, and - for the
//! partial views like `eax` or `ah` - which full registers contain their
//! value and which registers a write invalidates.
//!
//! The first set is the aggregate placeholder set; it carries no registers
//! of its own. Set order and register order inside each set are fixed, the
//! register map builder assigns the protocol-visible numbers from them.

/// How a register value is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterEncoding {
    Uint,
    Sint,
    Ieee754,
    Vector,
}

impl RegisterEncoding {
    pub fn wire_name(&self) -> &'static str {
        match self {
            RegisterEncoding::Uint => "uint",
            RegisterEncoding::Sint => "sint",
            RegisterEncoding::Ieee754 => "ieee754",
            RegisterEncoding::Vector => "vector",
        }
    }
}

/// How a debugger should display a register by default
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterFormat {
    Binary,
    Decimal,
    Hex,
    Float,
    VectorOfUint8,
}

impl RegisterFormat {
    pub fn wire_name(&self) -> &'static str {
        match self {
            RegisterFormat::Binary => "binary",
            RegisterFormat::Decimal => "decimal",
            RegisterFormat::Hex => "hex",
            RegisterFormat::Float => "float",
            RegisterFormat::VectorOfUint8 => "vector-uint8",
        }
    }
}

/// Architecture independent role of a register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericRegister {
    Pc,
    Sp,
    Fp,
    Ra,
    Flags,
    Arg(u8),
}

impl GenericRegister {
    pub fn wire_name(&self) -> &'static str {
        match self {
            GenericRegister::Pc => "pc",
            GenericRegister::Sp => "sp",
            GenericRegister::Fp => "fp",
            GenericRegister::Ra => "ra",
            GenericRegister::Flags => "flags",
            GenericRegister::Arg(1) => "arg1",
            GenericRegister::Arg(2) => "arg2",
            GenericRegister::Arg(3) => "arg3",
            GenericRegister::Arg(4) => "arg4",
            GenericRegister::Arg(5) => "arg5",
            GenericRegister::Arg(6) => "arg6",
            GenericRegister::Arg(7) => "arg7",
            GenericRegister::Arg(_) => "arg8",
        }
    }
}

/// Description of one register of one register set
#[derive(Debug)]
pub struct RegisterDescriptor {
    /// Register set this register belongs to
    pub set: u32,
    /// Id of the register inside its set's state
    pub id: u32,
    pub name: &'static str,
    pub alt_name: Option<&'static str>,
    pub encoding: RegisterEncoding,
    pub format: RegisterFormat,
    /// Size of the register value in bytes
    pub size: usize,
    /// Byte offset inside the containing register, for partial views
    pub contained_offset: usize,
    pub ehframe: Option<u32>,
    pub dwarf: Option<u32>,
    pub generic: Option<GenericRegister>,
    /// Names of the registers that store this register's value, if the
    /// register is a view into other registers
    pub container_registers: Option<&'static [&'static str]>,
    /// Names of the registers a write to this register invalidates
    pub invalidate_registers: Option<&'static [&'static str]>,
}

impl RegisterDescriptor {
    /// A register whose value lives inside other registers
    pub fn is_contained(&self) -> bool {
        self.container_registers.is_some()
    }
}

/// One register set of the architecture
#[derive(Debug)]
pub struct RegisterSetDescriptor {
    pub name: &'static str,
    pub registers: &'static [RegisterDescriptor],
}

use super::{REGISTER_SET_EXC, REGISTER_SET_FPU, REGISTER_SET_GPR};
use RegisterEncoding::{Uint, Vector};
use RegisterFormat::{Hex, VectorOfUint8};

const fn gpr(
    id: u32,
    name: &'static str,
    alt_name: Option<&'static str>,
    ehframe_dwarf: Option<u32>,
    generic: Option<GenericRegister>,
    invalidate_registers: Option<&'static [&'static str]>,
) -> RegisterDescriptor {
    RegisterDescriptor {
        set: REGISTER_SET_GPR,
        id,
        name,
        alt_name,
        encoding: Uint,
        format: Hex,
        size: 8,
        contained_offset: 0,
        ehframe: ehframe_dwarf,
        dwarf: ehframe_dwarf,
        generic,
        container_registers: None,
        invalidate_registers,
    }
}

const fn gpr_pseudo(
    id: u32,
    name: &'static str,
    size: usize,
    contained_offset: usize,
    container_registers: &'static [&'static str],
    invalidate_registers: &'static [&'static str],
) -> RegisterDescriptor {
    RegisterDescriptor {
        set: REGISTER_SET_GPR,
        id,
        name,
        alt_name: None,
        encoding: Uint,
        format: Hex,
        size,
        contained_offset,
        ehframe: None,
        dwarf: None,
        generic: None,
        container_registers: Some(container_registers),
        invalidate_registers: Some(invalidate_registers),
    }
}

const fn fpu_uint(id: u32, name: &'static str, size: usize) -> RegisterDescriptor {
    RegisterDescriptor {
        set: REGISTER_SET_FPU,
        id,
        name,
        alt_name: None,
        encoding: Uint,
        format: Hex,
        size,
        contained_offset: 0,
        ehframe: None,
        dwarf: None,
        generic: None,
        container_registers: None,
        invalidate_registers: None,
    }
}

const fn fpu_vector(id: u32, name: &'static str, size: usize, ehframe_dwarf: u32) -> RegisterDescriptor {
    RegisterDescriptor {
        set: REGISTER_SET_FPU,
        id,
        name,
        alt_name: None,
        encoding: Vector,
        format: VectorOfUint8,
        size,
        contained_offset: 0,
        ehframe: Some(ehframe_dwarf),
        dwarf: Some(ehframe_dwarf),
        generic: None,
        container_registers: None,
        invalidate_registers: None,
    }
}

const fn exc(id: u32, name: &'static str, size: usize) -> RegisterDescriptor {
    RegisterDescriptor {
        set: REGISTER_SET_EXC,
        id,
        name,
        alt_name: None,
        encoding: Uint,
        format: Hex,
        size,
        contained_offset: 0,
        ehframe: None,
        dwarf: None,
        generic: None,
        container_registers: None,
        invalidate_registers: None,
    }
}

const CONTAINED_RAX: &[&str] = &["rax"];
const CONTAINED_RBX: &[&str] = &["rbx"];
const CONTAINED_RCX: &[&str] = &["rcx"];
const CONTAINED_RDX: &[&str] = &["rdx"];
const CONTAINED_RDI: &[&str] = &["rdi"];
const CONTAINED_RSI: &[&str] = &["rsi"];
const CONTAINED_RBP: &[&str] = &["rbp"];
const CONTAINED_RSP: &[&str] = &["rsp"];
const CONTAINED_R8: &[&str] = &["r8"];
const CONTAINED_R9: &[&str] = &["r9"];
const CONTAINED_R10: &[&str] = &["r10"];
const CONTAINED_R11: &[&str] = &["r11"];
const CONTAINED_R12: &[&str] = &["r12"];
const CONTAINED_R13: &[&str] = &["r13"];
const CONTAINED_R14: &[&str] = &["r14"];
const CONTAINED_R15: &[&str] = &["r15"];

const INVALIDATE_RAX: &[&str] = &["rax", "eax", "ax", "ah", "al"];
const INVALIDATE_RBX: &[&str] = &["rbx", "ebx", "bx", "bh", "bl"];
const INVALIDATE_RCX: &[&str] = &["rcx", "ecx", "cx", "ch", "cl"];
const INVALIDATE_RDX: &[&str] = &["rdx", "edx", "dx", "dh", "dl"];
const INVALIDATE_RDI: &[&str] = &["rdi", "edi", "di", "dil"];
const INVALIDATE_RSI: &[&str] = &["rsi", "esi", "si", "sil"];
const INVALIDATE_RBP: &[&str] = &["rbp", "ebp", "bp", "bpl"];
const INVALIDATE_RSP: &[&str] = &["rsp", "esp", "sp", "spl"];
const INVALIDATE_R8: &[&str] = &["r8", "r8d", "r8w", "r8l"];
const INVALIDATE_R9: &[&str] = &["r9", "r9d", "r9w", "r9l"];
const INVALIDATE_R10: &[&str] = &["r10", "r10d", "r10w", "r10l"];
const INVALIDATE_R11: &[&str] = &["r11", "r11d", "r11w", "r11l"];
const INVALIDATE_R12: &[&str] = &["r12", "r12d", "r12w", "r12l"];
const INVALIDATE_R13: &[&str] = &["r13", "r13d", "r13w", "r13l"];
const INVALIDATE_R14: &[&str] = &["r14", "r14d", "r14w", "r14l"];
const INVALIDATE_R15: &[&str] = &["r15", "r15d", "r15w", "r15l"];

/// General purpose registers, full ones first, then the partial views
static GPR_REGISTERS: [RegisterDescriptor; 73] = [
    gpr(0, "rax", None, Some(0), None, Some(INVALIDATE_RAX)),
    gpr(1, "rbx", None, Some(3), None, Some(INVALIDATE_RBX)),
    gpr(2, "rcx", Some("arg4"), Some(2), Some(GenericRegister::Arg(4)), Some(INVALIDATE_RCX)),
    gpr(3, "rdx", Some("arg3"), Some(1), Some(GenericRegister::Arg(3)), Some(INVALIDATE_RDX)),
    gpr(4, "rdi", Some("arg1"), Some(5), Some(GenericRegister::Arg(1)), Some(INVALIDATE_RDI)),
    gpr(5, "rsi", Some("arg2"), Some(4), Some(GenericRegister::Arg(2)), Some(INVALIDATE_RSI)),
    gpr(6, "rbp", Some("fp"), Some(6), Some(GenericRegister::Fp), Some(INVALIDATE_RBP)),
    gpr(7, "rsp", Some("sp"), Some(7), Some(GenericRegister::Sp), Some(INVALIDATE_RSP)),
    gpr(8, "r8", Some("arg5"), Some(8), Some(GenericRegister::Arg(5)), Some(INVALIDATE_R8)),
    gpr(9, "r9", Some("arg6"), Some(9), Some(GenericRegister::Arg(6)), Some(INVALIDATE_R9)),
    gpr(10, "r10", None, Some(10), None, Some(INVALIDATE_R10)),
    gpr(11, "r11", None, Some(11), None, Some(INVALIDATE_R11)),
    gpr(12, "r12", None, Some(12), None, Some(INVALIDATE_R12)),
    gpr(13, "r13", None, Some(13), None, Some(INVALIDATE_R13)),
    gpr(14, "r14", None, Some(14), None, Some(INVALIDATE_R14)),
    gpr(15, "r15", None, Some(15), None, Some(INVALIDATE_R15)),
    gpr(16, "rip", Some("pc"), Some(16), Some(GenericRegister::Pc), None),
    gpr(17, "rflags", Some("flags"), None, Some(GenericRegister::Flags), None),
    gpr(18, "cs", None, None, None, None),
    gpr(19, "fs", None, None, None, None),
    gpr(20, "gs", None, None, None, None),
    gpr_pseudo(21, "eax", 4, 0, CONTAINED_RAX, INVALIDATE_RAX),
    gpr_pseudo(22, "ebx", 4, 0, CONTAINED_RBX, INVALIDATE_RBX),
    gpr_pseudo(23, "ecx", 4, 0, CONTAINED_RCX, INVALIDATE_RCX),
    gpr_pseudo(24, "edx", 4, 0, CONTAINED_RDX, INVALIDATE_RDX),
    gpr_pseudo(25, "edi", 4, 0, CONTAINED_RDI, INVALIDATE_RDI),
    gpr_pseudo(26, "esi", 4, 0, CONTAINED_RSI, INVALIDATE_RSI),
    gpr_pseudo(27, "ebp", 4, 0, CONTAINED_RBP, INVALIDATE_RBP),
    gpr_pseudo(28, "esp", 4, 0, CONTAINED_RSP, INVALIDATE_RSP),
    gpr_pseudo(29, "r8d", 4, 0, CONTAINED_R8, INVALIDATE_R8),
    gpr_pseudo(30, "r9d", 4, 0, CONTAINED_R9, INVALIDATE_R9),
    gpr_pseudo(31, "r10d", 4, 0, CONTAINED_R10, INVALIDATE_R10),
    gpr_pseudo(32, "r11d", 4, 0, CONTAINED_R11, INVALIDATE_R11),
    gpr_pseudo(33, "r12d", 4, 0, CONTAINED_R12, INVALIDATE_R12),
    gpr_pseudo(34, "r13d", 4, 0, CONTAINED_R13, INVALIDATE_R13),
    gpr_pseudo(35, "r14d", 4, 0, CONTAINED_R14, INVALIDATE_R14),
    gpr_pseudo(36, "r15d", 4, 0, CONTAINED_R15, INVALIDATE_R15),
    gpr_pseudo(37, "ax", 2, 0, CONTAINED_RAX, INVALIDATE_RAX),
    gpr_pseudo(38, "bx", 2, 0, CONTAINED_RBX, INVALIDATE_RBX),
    gpr_pseudo(39, "cx", 2, 0, CONTAINED_RCX, INVALIDATE_RCX),
    gpr_pseudo(40, "dx", 2, 0, CONTAINED_RDX, INVALIDATE_RDX),
    gpr_pseudo(41, "di", 2, 0, CONTAINED_RDI, INVALIDATE_RDI),
    gpr_pseudo(42, "si", 2, 0, CONTAINED_RSI, INVALIDATE_RSI),
    gpr_pseudo(43, "bp", 2, 0, CONTAINED_RBP, INVALIDATE_RBP),
    gpr_pseudo(44, "sp", 2, 0, CONTAINED_RSP, INVALIDATE_RSP),
    gpr_pseudo(45, "r8w", 2, 0, CONTAINED_R8, INVALIDATE_R8),
    gpr_pseudo(46, "r9w", 2, 0, CONTAINED_R9, INVALIDATE_R9),
    gpr_pseudo(47, "r10w", 2, 0, CONTAINED_R10, INVALIDATE_R10),
    gpr_pseudo(48, "r11w", 2, 0, CONTAINED_R11, INVALIDATE_R11),
    gpr_pseudo(49, "r12w", 2, 0, CONTAINED_R12, INVALIDATE_R12),
    gpr_pseudo(50, "r13w", 2, 0, CONTAINED_R13, INVALIDATE_R13),
    gpr_pseudo(51, "r14w", 2, 0, CONTAINED_R14, INVALIDATE_R14),
    gpr_pseudo(52, "r15w", 2, 0, CONTAINED_R15, INVALIDATE_R15),
    gpr_pseudo(53, "ah", 1, 1, CONTAINED_RAX, INVALIDATE_RAX),
    gpr_pseudo(54, "bh", 1, 1, CONTAINED_RBX, INVALIDATE_RBX),
    gpr_pseudo(55, "ch", 1, 1, CONTAINED_RCX, INVALIDATE_RCX),
    gpr_pseudo(56, "dh", 1, 1, CONTAINED_RDX, INVALIDATE_RDX),
    gpr_pseudo(57, "al", 1, 0, CONTAINED_RAX, INVALIDATE_RAX),
    gpr_pseudo(58, "bl", 1, 0, CONTAINED_RBX, INVALIDATE_RBX),
    gpr_pseudo(59, "cl", 1, 0, CONTAINED_RCX, INVALIDATE_RCX),
    gpr_pseudo(60, "dl", 1, 0, CONTAINED_RDX, INVALIDATE_RDX),
    gpr_pseudo(61, "dil", 1, 0, CONTAINED_RDI, INVALIDATE_RDI),
    gpr_pseudo(62, "sil", 1, 0, CONTAINED_RSI, INVALIDATE_RSI),
    gpr_pseudo(63, "bpl", 1, 0, CONTAINED_RBP, INVALIDATE_RBP),
    gpr_pseudo(64, "spl", 1, 0, CONTAINED_RSP, INVALIDATE_RSP),
    gpr_pseudo(65, "r8l", 1, 0, CONTAINED_R8, INVALIDATE_R8),
    gpr_pseudo(66, "r9l", 1, 0, CONTAINED_R9, INVALIDATE_R9),
    gpr_pseudo(67, "r10l", 1, 0, CONTAINED_R10, INVALIDATE_R10),
    gpr_pseudo(68, "r11l", 1, 0, CONTAINED_R11, INVALIDATE_R11),
    gpr_pseudo(69, "r12l", 1, 0, CONTAINED_R12, INVALIDATE_R12),
    gpr_pseudo(70, "r13l", 1, 0, CONTAINED_R13, INVALIDATE_R13),
    gpr_pseudo(71, "r14l", 1, 0, CONTAINED_R14, INVALIDATE_R14),
    gpr_pseudo(72, "r15l", 1, 0, CONTAINED_R15, INVALIDATE_R15),
];

/// Floating point registers, FXSAVE layout without AVX
static FPU_REGISTERS: [RegisterDescriptor; 34] = [
    fpu_uint(0, "fctrl", 2),
    fpu_uint(1, "fstat", 2),
    fpu_uint(2, "ftag", 1),
    fpu_uint(3, "fop", 2),
    fpu_uint(4, "fioff", 4),
    fpu_uint(5, "fiseg", 2),
    fpu_uint(6, "fooff", 4),
    fpu_uint(7, "foseg", 2),
    fpu_uint(8, "mxcsr", 4),
    fpu_uint(9, "mxcsrmask", 4),
    fpu_vector(10, "stmm0", 10, 33),
    fpu_vector(11, "stmm1", 10, 34),
    fpu_vector(12, "stmm2", 10, 35),
    fpu_vector(13, "stmm3", 10, 36),
    fpu_vector(14, "stmm4", 10, 37),
    fpu_vector(15, "stmm5", 10, 38),
    fpu_vector(16, "stmm6", 10, 39),
    fpu_vector(17, "stmm7", 10, 40),
    fpu_vector(18, "xmm0", 16, 17),
    fpu_vector(19, "xmm1", 16, 18),
    fpu_vector(20, "xmm2", 16, 19),
    fpu_vector(21, "xmm3", 16, 20),
    fpu_vector(22, "xmm4", 16, 21),
    fpu_vector(23, "xmm5", 16, 22),
    fpu_vector(24, "xmm6", 16, 23),
    fpu_vector(25, "xmm7", 16, 24),
    fpu_vector(26, "xmm8", 16, 25),
    fpu_vector(27, "xmm9", 16, 26),
    fpu_vector(28, "xmm10", 16, 27),
    fpu_vector(29, "xmm11", 16, 28),
    fpu_vector(30, "xmm12", 16, 29),
    fpu_vector(31, "xmm13", 16, 30),
    fpu_vector(32, "xmm14", 16, 31),
    fpu_vector(33, "xmm15", 16, 32),
];

/// Exception state registers
static EXC_REGISTERS: [RegisterDescriptor; 3] = [
    exc(0, "trapno", 4),
    exc(1, "err", 4),
    exc(2, "faultvaddr", 8),
];

/// All register sets in the fixed architecture order
///
/// Index into this slice is the register set id.
pub static REGISTER_SETS: [RegisterSetDescriptor; 4] = [
    RegisterSetDescriptor {
        name: "x86_64 Registers",
        registers: &[],
    },
    RegisterSetDescriptor {
        name: "General Purpose Registers",
        registers: &GPR_REGISTERS,
    },
    RegisterSetDescriptor {
        name: "Floating Point Registers",
        registers: &FPU_REGISTERS,
    },
    RegisterSetDescriptor {
        name: "Exception State Registers",
        registers: &EXC_REGISTERS,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_ids_match_indices() {
        for (index, set) in REGISTER_SETS.iter().enumerate() {
            for register in set.registers {
                assert_eq!(register.set as usize, index, "register {}", register.name);
            }
        }
    }

    #[test]
    fn test_contained_registers_have_invalidate_lists() {
        for set in &REGISTER_SETS {
            for register in set.registers {
                if register.is_contained() {
                    assert!(
                        register.invalidate_registers.is_some(),
                        "partial view {} without invalidate list",
                        register.name
                    );
                }
            }
        }
    }

    #[test]
    fn test_container_names_resolve() {
        let names: Vec<&str> = REGISTER_SETS
            .iter()
            .flat_map(|set| set.registers.iter().map(|r| r.name))
            .collect();
        for set in &REGISTER_SETS {
            for register in set.registers {
                for name in register.container_registers.unwrap_or(&[]) {
                    assert!(names.contains(name), "unknown container {name}");
                }
                for name in register.invalidate_registers.unwrap_or(&[]) {
                    assert!(names.contains(name), "unknown invalidated register {name}");
                }
            }
        }
    }
}
