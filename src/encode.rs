//! Encoders for the guest instruction forms the decoder understands.

use crate::decoder::{
    AddSubOp, BranchRegKind, CondSelectOp, Condition, FpOp, LogicOp, MoveWideOp, ShiftType,
};

fn field(value: u32, lo: u32, len: u32) -> u32 {
    (value & ((1 << len) - 1)) << lo
}

fn rd_rn(rd: u8, rn: u8) -> u32 {
    field(rd as u32, 0, 5) | field(rn as u32, 5, 5)
}

fn branch_offset(offset: i64, len: u32) -> u32 {
    field((offset >> 2) as u32, 0, len)
}

pub fn add_sub_imm(
    sf: bool,
    op: AddSubOp,
    set_flags: bool,
    shift: u32,
    imm12: u32,
    rn: u8,
    rd: u8,
) -> u32 {
    field(sf as u32, 31, 1)
        | field((op == AddSubOp::Sub) as u32, 30, 1)
        | field(set_flags as u32, 29, 1)
        | 0b10001 << 24
        | field(shift, 22, 2)
        | field(imm12, 10, 12)
        | rd_rn(rd, rn)
}

pub fn add_imm(rd: u8, rn: u8, imm12: u32) -> u32 {
    add_sub_imm(true, AddSubOp::Add, false, 0, imm12, rn, rd)
}

pub fn sub_imm(rd: u8, rn: u8, imm12: u32) -> u32 {
    add_sub_imm(true, AddSubOp::Sub, false, 0, imm12, rn, rd)
}

pub fn subs_imm(rd: u8, rn: u8, imm12: u32) -> u32 {
    add_sub_imm(true, AddSubOp::Sub, true, 0, imm12, rn, rd)
}

pub fn cmp_imm(rn: u8, imm12: u32) -> u32 {
    subs_imm(31, rn, imm12)
}

pub fn logical_imm(sf: bool, op: LogicOp, n: u32, immr: u32, imms: u32, rn: u8, rd: u8) -> u32 {
    field(sf as u32, 31, 1)
        | field(op as u32, 29, 2)
        | 0b100100 << 23
        | field(n, 22, 1)
        | field(immr, 16, 6)
        | field(imms, 10, 6)
        | rd_rn(rd, rn)
}

pub fn move_wide(sf: bool, op: MoveWideOp, hw: u32, imm16: u16, rd: u8) -> u32 {
    let opc = match op {
        MoveWideOp::Movn => 0,
        MoveWideOp::Movz => 2,
        MoveWideOp::Movk => 3,
    };
    field(sf as u32, 31, 1)
        | field(opc, 29, 2)
        | 0b100101 << 23
        | field(hw, 21, 2)
        | field(imm16 as u32, 5, 16)
        | field(rd as u32, 0, 5)
}

pub fn movz(rd: u8, imm16: u16, hw: u32) -> u32 {
    move_wide(true, MoveWideOp::Movz, hw, imm16, rd)
}

pub fn movk(rd: u8, imm16: u16, hw: u32) -> u32 {
    move_wide(true, MoveWideOp::Movk, hw, imm16, rd)
}

pub fn adr(page: bool, rd: u8, imm21: i64) -> u32 {
    let imm = imm21 as u32;
    field(page as u32, 31, 1)
        | field(imm, 29, 2)
        | 0b10000 << 24
        | field(imm >> 2, 5, 19)
        | field(rd as u32, 0, 5)
}

#[allow(clippy::too_many_arguments)]
pub fn logical_reg(
    sf: bool,
    op: LogicOp,
    invert: bool,
    shift: ShiftType,
    amount: u32,
    rm: u8,
    rn: u8,
    rd: u8,
) -> u32 {
    field(sf as u32, 31, 1)
        | field(op as u32, 29, 2)
        | 0b01010 << 24
        | field(shift as u32, 22, 2)
        | field(invert as u32, 21, 1)
        | field(rm as u32, 16, 5)
        | field(amount, 10, 6)
        | rd_rn(rd, rn)
}

pub fn orr_reg(rd: u8, rn: u8, rm: u8) -> u32 {
    logical_reg(true, LogicOp::Orr, false, ShiftType::Lsl, 0, rm, rn, rd)
}

pub fn mov_reg(rd: u8, rm: u8) -> u32 {
    orr_reg(rd, 31, rm)
}

#[allow(clippy::too_many_arguments)]
pub fn add_sub_reg(
    sf: bool,
    op: AddSubOp,
    set_flags: bool,
    shift: ShiftType,
    amount: u32,
    rm: u8,
    rn: u8,
    rd: u8,
) -> u32 {
    field(sf as u32, 31, 1)
        | field((op == AddSubOp::Sub) as u32, 30, 1)
        | field(set_flags as u32, 29, 1)
        | 0b01011 << 24
        | field(shift as u32, 22, 2)
        | field(rm as u32, 16, 5)
        | field(amount, 10, 6)
        | rd_rn(rd, rn)
}

pub fn add_reg(rd: u8, rn: u8, rm: u8) -> u32 {
    add_sub_reg(true, AddSubOp::Add, false, ShiftType::Lsl, 0, rm, rn, rd)
}

pub fn sub_reg(rd: u8, rn: u8, rm: u8) -> u32 {
    add_sub_reg(true, AddSubOp::Sub, false, ShiftType::Lsl, 0, rm, rn, rd)
}

pub fn cmp_reg(rn: u8, rm: u8) -> u32 {
    add_sub_reg(true, AddSubOp::Sub, true, ShiftType::Lsl, 0, rm, rn, 31)
}

pub fn madd(sf: bool, sub: bool, rd: u8, rn: u8, rm: u8, ra: u8) -> u32 {
    field(sf as u32, 31, 1)
        | 0b11011 << 24
        | field(rm as u32, 16, 5)
        | field(sub as u32, 15, 1)
        | field(ra as u32, 10, 5)
        | rd_rn(rd, rn)
}

pub fn mul(rd: u8, rn: u8, rm: u8) -> u32 {
    madd(true, false, rd, rn, rm, 31)
}

fn dp_2src(sf: bool, opcode: u32, rd: u8, rn: u8, rm: u8) -> u32 {
    field(sf as u32, 31, 1)
        | 0b11010110 << 21
        | field(rm as u32, 16, 5)
        | field(opcode, 10, 6)
        | rd_rn(rd, rn)
}

pub fn div(sf: bool, signed: bool, rd: u8, rn: u8, rm: u8) -> u32 {
    dp_2src(sf, 0b10 | signed as u32, rd, rn, rm)
}

pub fn shift_reg(sf: bool, shift: ShiftType, rd: u8, rn: u8, rm: u8) -> u32 {
    dp_2src(sf, 0b1000 | shift as u32, rd, rn, rm)
}

pub fn cond_select(
    sf: bool,
    op: CondSelectOp,
    cond: Condition,
    rd: u8,
    rn: u8,
    rm: u8,
) -> u32 {
    let (o, o2) = match op {
        CondSelectOp::Csel => (0, 0),
        CondSelectOp::Csinc => (0, 1),
        CondSelectOp::Csinv => (1, 0),
        CondSelectOp::Csneg => (1, 1),
    };
    field(sf as u32, 31, 1)
        | field(o, 30, 1)
        | 0b11010100 << 21
        | field(rm as u32, 16, 5)
        | field(cond.bits(), 12, 4)
        | field(o2, 10, 2)
        | rd_rn(rd, rn)
}

pub fn cset(rd: u8, cond: Condition) -> u32 {
    cond_select(true, CondSelectOp::Csinc, cond.invert(), rd, 31, 31)
}

pub fn b(offset: i64) -> u32 {
    0x1400_0000 | branch_offset(offset, 26)
}

pub fn bl(offset: i64) -> u32 {
    0x9400_0000 | branch_offset(offset, 26)
}

pub fn b_cond(cond: Condition, offset: i64) -> u32 {
    0x5400_0000 | field(branch_offset(offset, 19), 5, 19) | cond.bits()
}

fn compare_branch(nonzero: bool, sf: bool, rt: u8, offset: i64) -> u32 {
    field(sf as u32, 31, 1)
        | 0b011010 << 25
        | field(nonzero as u32, 24, 1)
        | field(branch_offset(offset, 19), 5, 19)
        | field(rt as u32, 0, 5)
}

pub fn cbz(sf: bool, rt: u8, offset: i64) -> u32 {
    compare_branch(false, sf, rt, offset)
}

pub fn cbnz(sf: bool, rt: u8, offset: i64) -> u32 {
    compare_branch(true, sf, rt, offset)
}

pub fn branch_reg(kind: BranchRegKind, rn: u8) -> u32 {
    let base = match kind {
        BranchRegKind::Br => 0xd61f_0000,
        BranchRegKind::Blr => 0xd63f_0000,
        BranchRegKind::Ret => 0xd65f_0000,
    };
    base | field(rn as u32, 5, 5)
}

pub fn br(rn: u8) -> u32 {
    branch_reg(BranchRegKind::Br, rn)
}

pub fn blr(rn: u8) -> u32 {
    branch_reg(BranchRegKind::Blr, rn)
}

pub fn ret(rn: u8) -> u32 {
    branch_reg(BranchRegKind::Ret, rn)
}

pub fn svc(imm16: u16) -> u32 {
    0xd400_0001 | field(imm16 as u32, 5, 16)
}

pub fn brk(imm16: u16) -> u32 {
    0xd420_0000 | field(imm16 as u32, 5, 16)
}

pub fn nop() -> u32 {
    0xd503_201f
}

/// `offset` is in bytes and must be a multiple of the access size.
pub fn load_store(load: bool, size: u8, rt: u8, rn: u8, offset: u64) -> u32 {
    field(size as u32, 30, 2)
        | 0b111001 << 24
        | field(load as u32, 22, 2)
        | field((offset >> size) as u32, 10, 12)
        | rd_rn(rt, rn)
}

pub fn ldr(rt: u8, rn: u8, offset: u64) -> u32 {
    load_store(true, 3, rt, rn, offset)
}

pub fn str(rt: u8, rn: u8, offset: u64) -> u32 {
    load_store(false, 3, rt, rn, offset)
}

pub fn fp_arith(op: FpOp, rd: u8, rn: u8, rm: u8) -> u32 {
    let opcode = match op {
        FpOp::Mul => 0b0000,
        FpOp::Div => 0b0001,
        FpOp::Add => 0b0010,
        FpOp::Sub => 0b0011,
    };
    0x1e60_0800 | field(rm as u32, 16, 5) | field(opcode, 12, 4) | rd_rn(rd, rn)
}

pub fn fmov_to_fp(rd: u8, rn: u8) -> u32 {
    0x9e67_0000 | rd_rn(rd, rn)
}

pub fn fmov_from_fp(rd: u8, rn: u8) -> u32 {
    0x9e66_0000 | rd_rn(rd, rn)
}

/// Little-endian byte image of a program.
pub fn assemble(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}
