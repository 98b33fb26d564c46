use crate::decoder::{
    decode, AddSubOp, BranchRegKind, CondSelectOp, DecodedInstruction, FpOp, LogicOp,
    MoveWideOp, Opcode, ShiftType,
};

pub fn words(bin: &[u8]) -> anyhow::Result<Vec<u32>> {
    let chunks = bin.chunks_exact(4);
    if !chunks.remainder().is_empty() {
        anyhow::bail!("invalid binary: length {} is not a multiple of 4", bin.len());
    }
    Ok(chunks
        .into_iter()
        .map(|w| w.try_into().map(u32::from_le_bytes))
        .collect::<Result<_, _>>()?)
}

pub fn disasm(pc_base: u64, progn: &[u32]) -> Vec<String> {
    progn
        .iter()
        .enumerate()
        .map(|(i, &word)| {
            let insn = decode(pc_base + i as u64 * 4, word);
            format!(
                "{:#010x}: {word:08x} {} {}",
                insn.address,
                if insn.is_undefined() { "!" } else { " " },
                format_instruction(&insn)
            )
        })
        .collect()
}

fn xreg(sf: bool, r: u8, sp: bool) -> String {
    match (r, sp, sf) {
        (31, true, true) => "sp".to_string(),
        (31, true, false) => "wsp".to_string(),
        (31, false, true) => "xzr".to_string(),
        (31, false, false) => "wzr".to_string(),
        (r, _, true) => format!("x{r}"),
        (r, _, false) => format!("w{r}"),
    }
}

fn shifted(shift: ShiftType, amount: u8) -> String {
    if amount == 0 {
        return String::new();
    }
    let name = match shift {
        ShiftType::Lsl => "lsl",
        ShiftType::Lsr => "lsr",
        ShiftType::Asr => "asr",
        ShiftType::Ror => "ror",
    };
    format!(", {name} #{amount}")
}

pub fn format_instruction(insn: &DecodedInstruction) -> String {
    match insn.opcode {
        Opcode::AddSubImm {
            op,
            set_flags,
            sf,
            rd,
            rn,
            imm,
            shift,
        } => {
            let name = match (op, set_flags) {
                (AddSubOp::Add, false) => "add",
                (AddSubOp::Add, true) => "adds",
                (AddSubOp::Sub, false) => "sub",
                (AddSubOp::Sub, true) => "subs",
            };
            format!(
                "{name} {}, {}, #{:#x}{}",
                xreg(sf, rd, !set_flags),
                xreg(sf, rn, true),
                imm >> shift,
                if shift != 0 { ", lsl #12" } else { "" }
            )
        }
        Opcode::LogicalImm {
            op,
            sf,
            rd,
            rn,
            imm,
        } => {
            let name = match op {
                LogicOp::And => "and",
                LogicOp::Orr => "orr",
                LogicOp::Eor => "eor",
                LogicOp::Ands => "ands",
            };
            format!(
                "{name} {}, {}, #{imm:#x}",
                xreg(sf, rd, op != LogicOp::Ands),
                xreg(sf, rn, false)
            )
        }
        Opcode::MoveWide {
            op,
            sf,
            rd,
            imm16,
            shift,
        } => {
            let name = match op {
                MoveWideOp::Movn => "movn",
                MoveWideOp::Movz => "movz",
                MoveWideOp::Movk => "movk",
            };
            format!(
                "{name} {}, #{imm16:#x}{}",
                xreg(sf, rd, false),
                if shift != 0 {
                    format!(", lsl #{shift}")
                } else {
                    String::new()
                }
            )
        }
        Opcode::Adr { page, rd, offset } => {
            let target = if page {
                (insn.address & !0xfff).wrapping_add(offset as u64)
            } else {
                insn.address.wrapping_add(offset as u64)
            };
            format!(
                "{} x{rd}, {target:#x}",
                if page { "adrp" } else { "adr" }
            )
        }
        Opcode::LogicalReg {
            op,
            invert,
            sf,
            rd,
            rn,
            rm,
            shift,
            amount,
        } => {
            let name = match (op, invert) {
                (LogicOp::And, false) => "and",
                (LogicOp::And, true) => "bic",
                (LogicOp::Orr, false) => "orr",
                (LogicOp::Orr, true) => "orn",
                (LogicOp::Eor, false) => "eor",
                (LogicOp::Eor, true) => "eon",
                (LogicOp::Ands, false) => "ands",
                (LogicOp::Ands, true) => "bics",
            };
            format!(
                "{name} {}, {}, {}{}",
                xreg(sf, rd, false),
                xreg(sf, rn, false),
                xreg(sf, rm, false),
                shifted(shift, amount)
            )
        }
        Opcode::AddSubReg {
            op,
            set_flags,
            sf,
            rd,
            rn,
            rm,
            shift,
            amount,
        } => {
            let name = match (op, set_flags) {
                (AddSubOp::Add, false) => "add",
                (AddSubOp::Add, true) => "adds",
                (AddSubOp::Sub, false) => "sub",
                (AddSubOp::Sub, true) => "subs",
            };
            format!(
                "{name} {}, {}, {}{}",
                xreg(sf, rd, false),
                xreg(sf, rn, false),
                xreg(sf, rm, false),
                shifted(shift, amount)
            )
        }
        Opcode::MulAdd {
            sub,
            sf,
            rd,
            rn,
            rm,
            ra,
        } => format!(
            "{} {}, {}, {}, {}",
            if sub { "msub" } else { "madd" },
            xreg(sf, rd, false),
            xreg(sf, rn, false),
            xreg(sf, rm, false),
            xreg(sf, ra, false)
        ),
        Opcode::Div {
            signed,
            sf,
            rd,
            rn,
            rm,
        } => format!(
            "{} {}, {}, {}",
            if signed { "sdiv" } else { "udiv" },
            xreg(sf, rd, false),
            xreg(sf, rn, false),
            xreg(sf, rm, false)
        ),
        Opcode::ShiftReg {
            shift,
            sf,
            rd,
            rn,
            rm,
        } => {
            let name = match shift {
                ShiftType::Lsl => "lslv",
                ShiftType::Lsr => "lsrv",
                ShiftType::Asr => "asrv",
                ShiftType::Ror => "rorv",
            };
            format!(
                "{name} {}, {}, {}",
                xreg(sf, rd, false),
                xreg(sf, rn, false),
                xreg(sf, rm, false)
            )
        }
        Opcode::CondSelect {
            op,
            sf,
            rd,
            rn,
            rm,
            cond,
        } => {
            let name = match op {
                CondSelectOp::Csel => "csel",
                CondSelectOp::Csinc => "csinc",
                CondSelectOp::Csinv => "csinv",
                CondSelectOp::Csneg => "csneg",
            };
            format!(
                "{name} {}, {}, {}, {cond:?}",
                xreg(sf, rd, false),
                xreg(sf, rn, false),
                xreg(sf, rm, false)
            )
        }
        Opcode::Branch { link, .. } => format!(
            "{} {:#x}",
            if link { "bl" } else { "b" },
            insn.branch_target().unwrap_or_default()
        ),
        Opcode::BranchCond { cond, .. } => format!(
            "b.{cond:?} {:#x}",
            insn.branch_target().unwrap_or_default()
        )
        .to_lowercase(),
        Opcode::CompareBranch {
            nonzero, sf, rt, ..
        } => format!(
            "{} {}, {:#x}",
            if nonzero { "cbnz" } else { "cbz" },
            xreg(sf, rt, false),
            insn.branch_target().unwrap_or_default()
        ),
        Opcode::BranchReg { kind, rn } => match kind {
            BranchRegKind::Br => format!("br x{rn}"),
            BranchRegKind::Blr => format!("blr x{rn}"),
            BranchRegKind::Ret if rn == 30 => "ret".to_string(),
            BranchRegKind::Ret => format!("ret x{rn}"),
        },
        Opcode::LoadStore {
            load,
            size,
            rt,
            rn,
            offset,
        } => {
            let suffix = ["b", "h", "", ""][size as usize];
            format!(
                "{}{suffix} {}, [{}, #{offset:#x}]",
                if load { "ldr" } else { "str" },
                xreg(size == 3, rt, false),
                xreg(true, rn, true)
            )
        }
        Opcode::FpArith { op, rd, rn, rm } => {
            let name = match op {
                FpOp::Add => "fadd",
                FpOp::Sub => "fsub",
                FpOp::Mul => "fmul",
                FpOp::Div => "fdiv",
            };
            format!("{name} d{rd}, d{rn}, d{rm}")
        }
        Opcode::FmovToFp { rd, rn } => format!("fmov d{rd}, {}", xreg(true, rn, false)),
        Opcode::FmovFromFp { rd, rn } => format!("fmov {}, d{rn}", xreg(true, rd, false)),
        Opcode::Svc(imm) => format!("svc #{imm:#x}"),
        Opcode::Brk(imm) => format!("brk #{imm:#x}"),
        Opcode::Nop => "nop".to_string(),
        Opcode::Undefined => "undefined".to_string(),
    }
}
