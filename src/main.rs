use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use a64jit::*;

const STACK_SIZE: u64 = 1 << 20;

// Linux-style system call numbers, passed in x8.
const SYS_WRITE: u64 = 64;
const SYS_EXIT: u64 = 93;

const WRITE_CHUNK: u64 = 0x1000;

fn parse_address(s: &str) -> anyhow::Result<u64> {
    Ok(match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => s.parse()?,
    })
}

/// Copies `len` guest bytes at `address` to `out` a chunk at a time.
fn write_guest(
    memory: &GuestMemory,
    address: u64,
    len: u64,
    out: &mut impl Write,
) -> anyhow::Result<u64> {
    let mut buf = [0; WRITE_CHUNK as usize];
    let mut done = 0;
    while done < len {
        let n = (len - done).min(WRITE_CHUNK) as usize;
        memory.read(address.wrapping_add(done), &mut buf[..n])?;
        out.write_all(&buf[..n])?;
        done += n as u64;
    }
    Ok(done)
}

#[argopt::subcmd]
fn run(
    #[opt(long, default_value = "0x10000")] base: String,
    #[opt(long)] entry: Option<String>,
    #[opt(long)] low_power: bool,
    #[opt(long)] arch32: bool,
    #[opt(long, default_value = "256")] max_insts: usize,
    bin: PathBuf,
) -> anyhow::Result<()> {
    let bin = std::fs::read(bin)?;
    let base = parse_address(&base)?;
    let entry = entry.as_deref().map(parse_address).transpose()?.unwrap_or(base);

    let image_size = (bin.len() as u64).div_ceil(GUEST_PAGE_SIZE) * GUEST_PAGE_SIZE;
    let memory = Arc::new(GuestMemory::new(base, image_size + STACK_SIZE));
    memory.load(base, &bin)?;
    memory.map(base + image_size, STACK_SIZE)?;

    let jit = JitContext::new(
        Arc::clone(&memory),
        JitConfig {
            is_64_bit: !arch32,
            low_power,
            max_instructions: max_insts,
            ..Default::default()
        },
    )?;
    let mut ctx = jit.create_execution_context();
    ctx.set_sp(base + image_size + STACK_SIZE);

    let mut pc = entry;
    loop {
        match jit.execute(&mut ctx, pc)? {
            ExitReason::Supervisor(_) => match ctx.x(8) {
                SYS_WRITE => {
                    let mut stdout = std::io::stdout().lock();
                    let written = write_guest(&memory, ctx.x(1), ctx.x(2), &mut stdout)?;
                    ctx.set_x(0, written);
                }
                SYS_EXIT => {
                    log::info!("*** guest exited with status {}", ctx.x(0));
                    break;
                }
                nr => anyhow::bail!("unsupported system call {nr} at pc={:#x}", ctx.pc().wrapping_sub(4)),
            },
            reason => anyhow::bail!("guest stopped at pc={:#x}: {reason:?}", ctx.pc()),
        }
        pc = ctx.pc();
    }

    std::io::stdout().flush()?;
    Ok(())
}

#[argopt::subcmd]
fn disasm(#[opt(long, default_value = "0")] base: String, bin: PathBuf) -> anyhow::Result<()> {
    let bin = std::fs::read(bin)?;
    let base = parse_address(&base)?;

    for instr in disasm::disasm(base, &disasm::words(&bin)?) {
        println!("{}", instr);
    }

    Ok(())
}

#[argopt::cmd_group(commands = [run, disasm])]
fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();
}
