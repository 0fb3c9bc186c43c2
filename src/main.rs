use anyhow::{anyhow, Context, Result};
use clap::{App, Arg, SubCommand};

use std::process;
use std::thread;
use std::time::Duration;

use memhook::hwbreak::{BreakpointKind, BreakpointSize};
use memhook::scanner::{ScanKind, ScanValue, ValueType};
use memhook::Engine;

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name("pid")
                .help("The PID of the process to attach to")
                .short("p")
                .long("pid")
                .takes_value(true)
                .required(true)
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("scan")
                .about("Run a value scan and print surviving candidates")
                .arg(
                    Arg::with_name("type")
                        .help("Value type to scan for")
                        .short("t")
                        .long("type")
                        .takes_value(true)
                        .possible_values(&["i8", "u8", "i16", "u16", "i32", "u32", "i64", "u64", "f32", "f64"])
                        .default_value("i32"),
                )
                .arg(
                    Arg::with_name("equal")
                        .help("Match values equal to this literal")
                        .long("equal")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("aob")
                        .help("Scan for a wildcard AOB pattern instead of a numeric type (e.g. \"48 8B ?? 00\")")
                        .long("aob")
                        .takes_value(true)
                        .conflicts_with_all(&["type", "equal"]),
                ),
        )
        .subcommand(
            SubCommand::with_name("watch")
                .about("Track accesses to an address via a hardware breakpoint")
                .arg(
                    Arg::with_name("address")
                        .help("Address to watch, in hex")
                        .index(1)
                        .required(true),
                )
                .arg(
                    Arg::with_name("kind")
                        .help("Access kind to trap on")
                        .short("k")
                        .long("kind")
                        .takes_value(true)
                        .possible_values(&["execute", "write", "read-write"])
                        .default_value("write"),
                )
                .arg(
                    Arg::with_name("seconds")
                        .help("How long to watch before reporting and detaching")
                        .short("s")
                        .long("seconds")
                        .takes_value(true)
                        .default_value("5"),
                ),
        )
        .subcommand(
            SubCommand::with_name("patch")
                .about("NOP out or invert the jump at an address")
                .arg(
                    Arg::with_name("address")
                        .help("Address to patch, in hex")
                        .index(1)
                        .required(true),
                )
                .arg(
                    Arg::with_name("invert-jump")
                        .help("Invert a conditional jump's condition instead of NOPing it out")
                        .long("invert-jump"),
                )
                .arg(
                    Arg::with_name("desc")
                        .help("Description recorded alongside the patch")
                        .long("desc")
                        .takes_value(true)
                        .default_value("cli patch"),
                ),
        )
}

fn parse_hex_address(s: &str) -> Result<u64> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(s, 16).with_context(|| format!("`{}` is not a valid hex address", s))
}

fn run_scan(engine: &Engine, matches: &clap::ArgMatches) -> Result<()> {
    if let Some(pattern) = matches.value_of("aob") {
        engine.scanner().new_aob_scan(pattern)?;
        while engine.scanner().is_running() {
            thread::sleep(Duration::from_millis(50));
        }
        let candidates = engine.scanner().candidates();
        serde_json::to_writer_pretty(std::io::stdout(), &candidates)?;
        println!();
        log::info!("aob scan complete: {} candidates", candidates.len());
        return Ok(());
    }

    let value_type = match matches.value_of("type").unwrap() {
        "i8" => ValueType::I8,
        "u8" => ValueType::U8,
        "i16" => ValueType::I16,
        "u16" => ValueType::U16,
        "i32" => ValueType::I32,
        "u32" => ValueType::U32,
        "i64" => ValueType::I64,
        "u64" => ValueType::U64,
        "f32" => ValueType::F32,
        "f64" => ValueType::F64,
        _ => unreachable!(),
    };

    let kind = match matches.value_of("equal") {
        Some(literal) => {
            let parsed: i64 = literal.parse().context("--equal expects an integer literal")?;
            ScanKind::Equal(ScanValue::I64(parsed))
        }
        None => ScanKind::Unknown,
    };

    engine.scanner().new_scan(value_type, kind)?;
    while engine.scanner().is_running() {
        thread::sleep(Duration::from_millis(50));
    }

    let candidates = engine.scanner().candidates();
    serde_json::to_writer_pretty(std::io::stdout(), &candidates)?;
    println!();
    log::info!("scan complete: {} candidates", candidates.len());
    Ok(())
}

fn run_watch(engine: &Engine, matches: &clap::ArgMatches) -> Result<()> {
    let address = parse_hex_address(matches.value_of("address").unwrap())?;
    let kind = match matches.value_of("kind").unwrap() {
        "execute" => BreakpointKind::Execute,
        "write" => BreakpointKind::Write,
        "read-write" => BreakpointKind::ReadWrite,
        _ => unreachable!(),
    };
    let seconds: u64 = matches.value_of("seconds").unwrap().parse().context("--seconds must be an integer")?;

    engine.track_address(address, kind, BreakpointSize::Four)?;
    thread::sleep(Duration::from_secs(seconds));
    engine.stop_tracking()?;

    let records = engine.tracker().records();
    serde_json::to_writer_pretty(std::io::stdout(), &records)?;
    println!();
    Ok(())
}

fn run_patch(engine: &Engine, matches: &clap::ArgMatches) -> Result<()> {
    let address = parse_hex_address(matches.value_of("address").unwrap())?;
    let desc = matches.value_of("desc").unwrap().to_string();

    if matches.is_present("invert-jump") {
        engine.invert_cond_jump(address, desc)?;
    } else {
        engine.nop(address, desc)?;
    }

    log::info!("patched {:#x}", address);
    Ok(())
}

fn run() -> Result<()> {
    let matches = app().get_matches();

    let pid: i32 = matches.value_of("pid").unwrap().parse().context("--pid must be an integer")?;

    let engine = Engine::new();
    engine.attach(pid)?;

    let result = match matches.subcommand() {
        ("scan", Some(sub)) => run_scan(&engine, sub),
        ("watch", Some(sub)) => run_watch(&engine, sub),
        ("patch", Some(sub)) => run_patch(&engine, sub),
        _ => Err(anyhow!("a subcommand is required (scan, watch, patch)")),
    };

    engine.detach();
    result
}

fn main() {
    env_logger::init();

    process::exit(match run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Fatal: {:#}", e);
            1
        }
    });
}
