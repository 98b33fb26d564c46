//! Guest instruction decoding.
//!
//! Decoding is a pure function of `(address, word)`. Bit patterns that have no
//! meaning (or that this translator does not implement) come back as
//! [`Opcode::Undefined`] so the IR builder can turn them into a guest trap.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Eq,
    Ne,
    Cs,
    Cc,
    Mi,
    Pl,
    Vs,
    Vc,
    Hi,
    Ls,
    Ge,
    Lt,
    Gt,
    Le,
    Al,
    Nv,
}

impl Condition {
    pub fn from_bits(bits: u32) -> Self {
        use Condition::*;
        [Eq, Ne, Cs, Cc, Mi, Pl, Vs, Vc, Hi, Ls, Ge, Lt, Gt, Le, Al, Nv][(bits & 0xf) as usize]
    }

    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn invert(self) -> Self {
        Self::from_bits(self.bits() ^ 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftType {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

impl ShiftType {
    fn from_bits(bits: u32) -> Self {
        [Self::Lsl, Self::Lsr, Self::Asr, Self::Ror][(bits & 3) as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddSubOp {
    Add,
    Sub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Orr,
    Eor,
    Ands,
}

impl LogicOp {
    fn from_bits(bits: u32) -> Self {
        [Self::And, Self::Orr, Self::Eor, Self::Ands][(bits & 3) as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveWideOp {
    Movn,
    Movz,
    Movk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondSelectOp {
    Csel,
    Csinc,
    Csinv,
    Csneg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchRegKind {
    Br,
    Blr,
    Ret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// One decoded instruction class with its operands.
///
/// Register fields are raw 5-bit indices; whether 31 names SP or the zero
/// register depends on the operand position and is resolved by the IR builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    AddSubImm {
        op: AddSubOp,
        set_flags: bool,
        sf: bool,
        rd: u8,
        rn: u8,
        /// Effective immediate, already shifted.
        imm: u64,
        /// 0 or 12.
        shift: u8,
    },
    LogicalImm {
        op: LogicOp,
        sf: bool,
        rd: u8,
        rn: u8,
        imm: u64,
    },
    MoveWide {
        op: MoveWideOp,
        sf: bool,
        rd: u8,
        imm16: u16,
        shift: u8,
    },
    Adr {
        page: bool,
        rd: u8,
        offset: i64,
    },
    LogicalReg {
        op: LogicOp,
        invert: bool,
        sf: bool,
        rd: u8,
        rn: u8,
        rm: u8,
        shift: ShiftType,
        amount: u8,
    },
    AddSubReg {
        op: AddSubOp,
        set_flags: bool,
        sf: bool,
        rd: u8,
        rn: u8,
        rm: u8,
        shift: ShiftType,
        amount: u8,
    },
    MulAdd {
        sub: bool,
        sf: bool,
        rd: u8,
        rn: u8,
        rm: u8,
        ra: u8,
    },
    Div {
        signed: bool,
        sf: bool,
        rd: u8,
        rn: u8,
        rm: u8,
    },
    ShiftReg {
        shift: ShiftType,
        sf: bool,
        rd: u8,
        rn: u8,
        rm: u8,
    },
    CondSelect {
        op: CondSelectOp,
        sf: bool,
        rd: u8,
        rn: u8,
        rm: u8,
        cond: Condition,
    },
    Branch {
        link: bool,
        offset: i64,
    },
    BranchCond {
        cond: Condition,
        offset: i64,
    },
    CompareBranch {
        nonzero: bool,
        sf: bool,
        rt: u8,
        offset: i64,
    },
    BranchReg {
        kind: BranchRegKind,
        rn: u8,
    },
    LoadStore {
        load: bool,
        /// log2 of the access size in bytes.
        size: u8,
        rt: u8,
        rn: u8,
        offset: u64,
    },
    FpArith {
        op: FpOp,
        rd: u8,
        rn: u8,
        rm: u8,
    },
    FmovToFp {
        rd: u8,
        rn: u8,
    },
    FmovFromFp {
        rd: u8,
        rn: u8,
    },
    Svc(u16),
    Brk(u16),
    Nop,
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub address: u64,
    pub word: u32,
    pub opcode: Opcode,
}

impl DecodedInstruction {
    pub fn is_undefined(&self) -> bool {
        matches!(self.opcode, Opcode::Undefined)
    }

    /// True for instructions after which straight-line decoding must stop.
    pub fn ends_block(&self) -> bool {
        matches!(
            self.opcode,
            Opcode::Branch { .. }
                | Opcode::BranchCond { .. }
                | Opcode::CompareBranch { .. }
                | Opcode::BranchReg { .. }
                | Opcode::Svc(_)
                | Opcode::Brk(_)
                | Opcode::Undefined
        )
    }

    /// Target of a direct (pc-relative) branch.
    pub fn branch_target(&self) -> Option<u64> {
        match self.opcode {
            Opcode::Branch { offset, .. }
            | Opcode::BranchCond { offset, .. }
            | Opcode::CompareBranch { offset, .. } => {
                Some(self.address.wrapping_add(offset as u64))
            }
            _ => None,
        }
    }

    pub fn next_address(&self) -> u64 {
        self.address.wrapping_add(4)
    }
}

type ClassDecoder = fn(u64, u32) -> Opcode;

// Keyed by the major class field, bits 28:25.
static CLASS_TABLE: [ClassDecoder; 16] = [
    undefined,
    undefined,
    undefined,
    undefined,
    loads_stores,
    dp_register,
    loads_stores,
    dp_simd_fp,
    dp_immediate,
    dp_immediate,
    branch_system,
    branch_system,
    loads_stores,
    dp_register,
    loads_stores,
    dp_simd_fp,
];

pub fn decode(address: u64, word: u32) -> DecodedInstruction {
    let opcode = CLASS_TABLE[((word >> 25) & 0xf) as usize](address, word);
    DecodedInstruction {
        address,
        word,
        opcode,
    }
}

fn bits(word: u32, lo: u32, len: u32) -> u32 {
    (word >> lo) & ((1 << len) - 1)
}

fn reg(word: u32, lo: u32) -> u8 {
    bits(word, lo, 5) as u8
}

fn sign_extend(value: u32, len: u32) -> i64 {
    let shift = 64 - len;
    ((value as i64) << shift) >> shift
}

fn undefined(_: u64, _: u32) -> Opcode {
    Opcode::Undefined
}

fn dp_immediate(_: u64, word: u32) -> Opcode {
    let sf = bits(word, 31, 1) != 0;
    let rd = reg(word, 0);
    let rn = reg(word, 5);

    match bits(word, 23, 3) {
        0 | 1 => {
            let imm = (bits(word, 5, 19) << 2) | bits(word, 29, 2);
            let page = sf;
            let offset = sign_extend(imm, 21);
            Opcode::Adr {
                page,
                rd,
                offset: if page { offset << 12 } else { offset },
            }
        }
        2 | 3 => {
            let shift = bits(word, 22, 2);
            if shift > 1 {
                return Opcode::Undefined;
            }
            let shift = (shift * 12) as u8;
            let imm12 = bits(word, 10, 12) as u64;
            Opcode::AddSubImm {
                op: if bits(word, 30, 1) != 0 {
                    AddSubOp::Sub
                } else {
                    AddSubOp::Add
                },
                set_flags: bits(word, 29, 1) != 0,
                sf,
                rd,
                rn,
                imm: imm12 << shift,
                shift,
            }
        }
        4 => {
            let n = bits(word, 22, 1);
            if !sf && n != 0 {
                return Opcode::Undefined;
            }
            let width = if sf { 64 } else { 32 };
            match decode_bit_masks(n, bits(word, 10, 6), bits(word, 16, 6), width) {
                Some(imm) => Opcode::LogicalImm {
                    op: LogicOp::from_bits(bits(word, 29, 2)),
                    sf,
                    rd,
                    rn,
                    imm,
                },
                None => Opcode::Undefined,
            }
        }
        5 => {
            let hw = bits(word, 21, 2);
            if !sf && hw >= 2 {
                return Opcode::Undefined;
            }
            let op = match bits(word, 29, 2) {
                0 => MoveWideOp::Movn,
                2 => MoveWideOp::Movz,
                3 => MoveWideOp::Movk,
                _ => return Opcode::Undefined,
            };
            Opcode::MoveWide {
                op,
                sf,
                rd,
                imm16: bits(word, 5, 16) as u16,
                shift: (hw * 16) as u8,
            }
        }
        _ => Opcode::Undefined,
    }
}

/// Expands an `N:immr:imms` logical immediate into its `width`-bit value.
///
/// Returns `None` for patterns that do not describe a repeating bitmask:
/// element size below two bits, all-ones elements, or an element wider than
/// `width`.
pub fn decode_bit_masks(n: u32, imms: u32, immr: u32, width: u32) -> Option<u64> {
    let combined = (n << 6) | (!imms & 0x3f);
    if combined == 0 {
        return None;
    }
    let len = 31 - combined.leading_zeros();
    if len < 1 {
        return None;
    }

    let esize = 1u32 << len;
    if esize > width {
        return None;
    }

    let levels = esize - 1;
    let s = imms & levels;
    let r = immr & levels;
    if s == levels {
        return None;
    }

    let emask = if esize == 64 { !0u64 } else { (1u64 << esize) - 1 };
    let welem = (1u64 << (s + 1)) - 1;
    let elem = if r == 0 {
        welem
    } else {
        ((welem >> r) | (welem << (esize - r))) & emask
    };

    let mut imm = 0u64;
    let mut pos = 0;
    while pos < width {
        imm |= elem << pos;
        pos += esize;
    }
    Some(if width == 64 {
        imm
    } else {
        imm & 0xffff_ffff
    })
}

fn branch_system(_: u64, word: u32) -> Opcode {
    if bits(word, 26, 5) == 0b00101 {
        return Opcode::Branch {
            link: bits(word, 31, 1) != 0,
            offset: sign_extend(bits(word, 0, 26), 26) << 2,
        };
    }

    if word & 0xff00_0010 == 0x5400_0000 {
        return Opcode::BranchCond {
            cond: Condition::from_bits(bits(word, 0, 4)),
            offset: sign_extend(bits(word, 5, 19), 19) << 2,
        };
    }

    if bits(word, 25, 6) == 0b011010 {
        return Opcode::CompareBranch {
            nonzero: bits(word, 24, 1) != 0,
            sf: bits(word, 31, 1) != 0,
            rt: reg(word, 0),
            offset: sign_extend(bits(word, 5, 19), 19) << 2,
        };
    }

    if bits(word, 24, 8) == 0xd4 {
        let imm16 = bits(word, 5, 16) as u16;
        return match (bits(word, 21, 3), bits(word, 2, 3), bits(word, 0, 2)) {
            (0b000, 0, 0b01) => Opcode::Svc(imm16),
            (0b001, 0, 0b00) => Opcode::Brk(imm16),
            _ => Opcode::Undefined,
        };
    }

    // Hints and barriers have no architectural effect on a single-core model.
    if word & 0xffff_f01f == 0xd503_201f || word & 0xffff_f01f == 0xd503_301f {
        return Opcode::Nop;
    }

    let rn = reg(word, 5);
    match word & 0xffff_fc1f {
        0xd61f_0000 => Opcode::BranchReg {
            kind: BranchRegKind::Br,
            rn,
        },
        0xd63f_0000 => Opcode::BranchReg {
            kind: BranchRegKind::Blr,
            rn,
        },
        0xd65f_0000 => Opcode::BranchReg {
            kind: BranchRegKind::Ret,
            rn,
        },
        _ => Opcode::Undefined,
    }
}

fn loads_stores(_: u64, word: u32) -> Opcode {
    // Only the unsigned scaled offset form of integer LDR/STR.
    if bits(word, 24, 6) != 0b111001 {
        return Opcode::Undefined;
    }
    let size = bits(word, 30, 2) as u8;
    let load = match bits(word, 22, 2) {
        0 => false,
        1 => true,
        _ => return Opcode::Undefined,
    };
    Opcode::LoadStore {
        load,
        size,
        rt: reg(word, 0),
        rn: reg(word, 5),
        offset: (bits(word, 10, 12) as u64) << size,
    }
}

fn dp_register(_: u64, word: u32) -> Opcode {
    let sf = bits(word, 31, 1) != 0;
    let rd = reg(word, 0);
    let rn = reg(word, 5);
    let rm = reg(word, 16);

    match bits(word, 24, 5) {
        0b01010 => {
            let amount = bits(word, 10, 6) as u8;
            if !sf && amount >= 32 {
                return Opcode::Undefined;
            }
            Opcode::LogicalReg {
                op: LogicOp::from_bits(bits(word, 29, 2)),
                invert: bits(word, 21, 1) != 0,
                sf,
                rd,
                rn,
                rm,
                shift: ShiftType::from_bits(bits(word, 22, 2)),
                amount,
            }
        }
        0b01011 => {
            let amount = bits(word, 10, 6) as u8;
            let shift = ShiftType::from_bits(bits(word, 22, 2));
            if bits(word, 21, 1) != 0 || shift == ShiftType::Ror || (!sf && amount >= 32) {
                return Opcode::Undefined;
            }
            Opcode::AddSubReg {
                op: if bits(word, 30, 1) != 0 {
                    AddSubOp::Sub
                } else {
                    AddSubOp::Add
                },
                set_flags: bits(word, 29, 1) != 0,
                sf,
                rd,
                rn,
                rm,
                shift,
                amount,
            }
        }
        0b11011 => {
            if bits(word, 29, 2) != 0 || bits(word, 21, 3) != 0 {
                return Opcode::Undefined;
            }
            Opcode::MulAdd {
                sub: bits(word, 15, 1) != 0,
                sf,
                rd,
                rn,
                rm,
                ra: reg(word, 10),
            }
        }
        0b11010 => match (bits(word, 21, 3), bits(word, 29, 2)) {
            (0b110, 0) => match bits(word, 10, 6) {
                0b000010 => Opcode::Div {
                    signed: false,
                    sf,
                    rd,
                    rn,
                    rm,
                },
                0b000011 => Opcode::Div {
                    signed: true,
                    sf,
                    rd,
                    rn,
                    rm,
                },
                op @ 0b001000..=0b001011 => Opcode::ShiftReg {
                    shift: ShiftType::from_bits(op),
                    sf,
                    rd,
                    rn,
                    rm,
                },
                _ => Opcode::Undefined,
            },
            (0b100, 0) | (0b100, 2) => {
                let op = match (bits(word, 30, 1), bits(word, 10, 2)) {
                    (0, 0) => CondSelectOp::Csel,
                    (0, 1) => CondSelectOp::Csinc,
                    (1, 0) => CondSelectOp::Csinv,
                    (1, 1) => CondSelectOp::Csneg,
                    _ => return Opcode::Undefined,
                };
                Opcode::CondSelect {
                    op,
                    sf,
                    rd,
                    rn,
                    rm,
                    cond: Condition::from_bits(bits(word, 12, 4)),
                }
            }
            _ => Opcode::Undefined,
        },
        _ => Opcode::Undefined,
    }
}

fn dp_simd_fp(_: u64, word: u32) -> Opcode {
    let rd = reg(word, 0);
    let rn = reg(word, 5);

    // Scalar double-precision arithmetic.
    if word & 0xffe0_0c00 == 0x1e60_0800 {
        let op = match bits(word, 12, 4) {
            0b0000 => FpOp::Mul,
            0b0001 => FpOp::Div,
            0b0010 => FpOp::Add,
            0b0011 => FpOp::Sub,
            _ => return Opcode::Undefined,
        };
        return Opcode::FpArith {
            op,
            rd,
            rn,
            rm: reg(word, 16),
        };
    }

    match word & 0xffff_fc00 {
        0x9e66_0000 => Opcode::FmovFromFp { rd, rn },
        0x9e67_0000 => Opcode::FmovToFp { rd, rn },
        _ => Opcode::Undefined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode;
    use proptest::prelude::*;

    fn expand(esize: u32, ones: u32, rotate: u32, width: u32) -> u64 {
        let emask = if esize == 64 { !0 } else { (1u64 << esize) - 1 };
        let welem = (1u64 << ones) - 1;
        let elem = if rotate == 0 {
            welem
        } else {
            ((welem >> rotate) | (welem << (esize - rotate))) & emask
        };
        let mut imm = 0;
        for i in 0..width / esize {
            imm |= elem << (i * esize);
        }
        imm
    }

    #[test]
    fn test_known_logical_immediates() {
        // and x0, x0, #0xff
        let insn = decode(0, 0x9240_1c00);
        assert_eq!(
            insn.opcode,
            Opcode::LogicalImm {
                op: LogicOp::And,
                sf: true,
                rd: 0,
                rn: 0,
                imm: 0xff
            }
        );

        // orr w0, wzr, #0x55555555
        let insn = decode(0, 0x3200_f3e0);
        assert_eq!(
            insn.opcode,
            Opcode::LogicalImm {
                op: LogicOp::Orr,
                sf: false,
                rd: 0,
                rn: 31,
                imm: 0x5555_5555
            }
        );
    }

    #[test]
    fn test_every_valid_bitmask_expands() {
        for (esize, prefix) in [
            (2u32, 0b111100u32),
            (4, 0b111000),
            (8, 0b110000),
            (16, 0b100000),
            (32, 0),
            (64, 0),
        ] {
            for s in 0..esize - 1 {
                for r in 0..esize {
                    let n = (esize == 64) as u32;
                    let imms = prefix | s;
                    let expected = expand(esize, s + 1, r, 64);
                    assert_eq!(
                        decode_bit_masks(n, imms, r, 64),
                        Some(expected),
                        "esize={esize} s={s} r={r}"
                    );
                    if esize < 64 {
                        assert_eq!(
                            decode_bit_masks(n, imms, r, 32),
                            Some(expected & 0xffff_ffff)
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_logical_immediate_space_is_total() {
        for n in 0..2 {
            for immr in 0..64 {
                for imms in 0..64 {
                    let word = encode::logical_imm(true, LogicOp::Orr, n, immr, imms, 1, 2);
                    let insn = decode(0x1000, word);
                    let all_ones = imms & 0x3f == 0x3f && n == 1;
                    match insn.opcode {
                        Opcode::LogicalImm { imm, .. } => {
                            assert!(!all_ones);
                            assert_ne!(imm, 0);
                            assert_ne!(imm, !0);
                        }
                        Opcode::Undefined => {}
                        other => panic!("unexpected {other:?}"),
                    }
                }
            }
        }
    }

    #[test]
    fn test_reserved_shift_is_undefined() {
        let word = encode::add_sub_imm(true, AddSubOp::Add, false, 2, 1, 0, 5);
        assert!(decode(0, word).is_undefined());
        let word = encode::add_sub_imm(true, AddSubOp::Add, false, 3, 1, 0, 5);
        assert!(decode(0, word).is_undefined());
    }

    #[test]
    fn test_branch_targets() {
        let insn = decode(0x1000, encode::b(-8));
        assert_eq!(insn.branch_target(), Some(0xff8));
        let insn = decode(0x1000, encode::b_cond(Condition::Ne, 0x40));
        assert_eq!(insn.branch_target(), Some(0x1040));
        let insn = decode(0x1000, encode::cbz(true, 3, -4));
        assert_eq!(insn.branch_target(), Some(0xffc));
        assert!(decode(0x1000, encode::ret(30)).ends_block());
        assert!(!decode(0x1000, encode::nop()).ends_block());
    }

    #[test]
    fn test_exceptions_and_system() {
        assert_eq!(decode(0, encode::svc(0x10)).opcode, Opcode::Svc(0x10));
        assert_eq!(decode(0, encode::brk(0x3e8)).opcode, Opcode::Brk(0x3e8));
        assert_eq!(decode(0, 0xd503_3fdf).opcode, Opcode::Nop);
        assert!(decode(0, 0).is_undefined());
        assert!(decode(0, 0xffff_ffff).is_undefined());
    }

    proptest! {
        #[test]
        fn prop_add_sub_immediate_roundtrip(
            sf: bool, sub: bool, flags: bool,
            shift in 0u32..2, imm12 in 0u32..4096,
            rd in 0u8..32, rn in 0u8..32,
        ) {
            let op = if sub { AddSubOp::Sub } else { AddSubOp::Add };
            let word = encode::add_sub_imm(sf, op, flags, shift, imm12, rn, rd);
            match decode(0, word).opcode {
                Opcode::AddSubImm { imm, shift: sh, .. } => {
                    prop_assert_eq!(sh as u32, shift * 12);
                    let reencoded = encode::add_sub_imm(
                        sf, op, flags, (sh / 12) as u32, (imm >> sh) as u32, rn, rd,
                    );
                    prop_assert_eq!(reencoded, word);
                    prop_assert!(imm < 1 << 24);
                }
                other => prop_assert!(false, "unexpected {:?}", other),
            }
        }

        #[test]
        fn prop_decode_is_total(word: u32, address in 0u64..(1 << 48)) {
            let insn = decode(address & !3, word);
            prop_assert_eq!(insn.word, word);
            if let Some(target) = insn.branch_target() {
                prop_assert_eq!(target & 3, 0);
            }
        }
    }
}
