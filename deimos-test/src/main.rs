use clap::Parser;
use deimos_core::board::{layout, Board, Config, RunResult};
use deimos_core::bus::AccessWidth;
use deimos_core::system_bus::SystemBus;
use goblin::elf::program_header::PT_LOAD;
use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Signature file to output signature to
    #[arg(long, short)]
    signature: Option<String>,
    /// Stop after this many executed instructions
    #[arg(long, default_value_t = 100_000_000)]
    max_steps: u64,
    /// Elf file to run
    elf: String,
}

fn main() -> std::io::Result<ExitCode> {
    let args = Args::parse();

    let mut buf = Vec::new();

    let mut file = File::open(args.elf)?;
    file.read_to_end(&mut buf)?;

    let elf_header = goblin::elf::Elf::parse(&buf).expect("failed to parse elf file");

    let mut board = Board::new(Config::default()).expect("failed to build board");

    for header in elf_header
        .program_headers
        .iter()
        .filter(|h| h.p_type == PT_LOAD)
    {
        board.load_physical(header.p_paddr, &buf[header.file_range()]);
    }
    board.initialize(if elf_header.entry != 0 {
        elf_header.entry
    } else {
        layout::RAM_BASE
    });

    // riscv-tests report their result through the `tohost` word rather than the platform's
    // system controller: an odd value is (code << 1) | 1 with 0 meaning pass.
    let tohost = elf_header.syms.iter().find_map(|sym| {
        (elf_header.strtab.get_at(sym.st_name) == Some("tohost")).then_some(sym.st_value)
    });

    // Run
    let mut steps = 0;
    let mut exit_code = ExitCode::SUCCESS;
    loop {
        match board.run(10_000) {
            RunResult::PoweredOff => break,
            RunResult::BudgetExhausted => {}
        }
        if let Some(tohost) = tohost {
            let value = board.memory_map().read_debug(tohost, AccessWidth::Doubleword);
            if value & 1 == 1 {
                if value != 1 {
                    log::error!("guest reported failure: tohost = {value:#x}");
                    exit_code = ExitCode::FAILURE;
                }
                break;
            }
        }
        steps += 10_000;
        if steps >= args.max_steps {
            log::warn!("giving up after {steps} steps");
            exit_code = ExitCode::FAILURE;
            break;
        }
    }

    if let Some(path) = args.signature {
        let mut signature_start = None;
        let mut signature_end = None;
        for sym in elf_header.syms.iter() {
            let Some(name) = elf_header.strtab.get_at(sym.st_name) else {
                continue;
            };
            if name == "begin_signature" {
                signature_start = Some(sym.st_value);
            } else if name == "end_signature" {
                signature_end = Some(sym.st_value);
            }
        }
        let signature_start = signature_start.expect("missing symbol `begin_signature`");
        let signature_end = signature_end.expect("missing symbol `end_signature`");

        assert!(signature_start % 16 == 0);
        assert!(signature_end % 4 == 0);
        assert!(signature_start <= signature_end);

        let mut signature = Vec::new();

        let core = board.core_mut();
        for address in (signature_start..signature_end).step_by(4) {
            let word = core
                .load_debug(address, AccessWidth::Word)
                .expect("guest memory error while reading signature");
            signature.push(word as u32);
        }

        let mut file = File::create(path)?;
        for word in signature {
            writeln!(file, "{word:08x}")?;
        }
    }

    Ok(exit_code)
}
