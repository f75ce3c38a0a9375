//! Dump and structurally validate a mutation's replay log.
//!
//! Prints one line per record and exits nonzero when the log breaks the
//! format rules: unknown version or kind, an oversized write payload,
//! trailing bytes that do not fill a record, or a first record that is not
//! `begin`.

mod cli;

use std::fs::File;
use std::io::BufReader;
use std::process::exit;

use clap::Parser;

use fffc::events::{read_event, LogEvent, EVENT_SIZE};
use libafl_bolts::Error;

fn describe(index: usize, event: &LogEvent) -> String {
    match event {
        LogEvent::Begin {
            call_count,
            stack_start,
        } => {
            format!("{index:6}  begin     call={call_count} stack={stack_start:#x}")
        }
        LogEvent::Allocate { location, length } => {
            format!("{index:6}  allocate  loc={location:#x} len={length}")
        }
        LogEvent::Copy { src, dest, length } => {
            format!("{index:6}  copy      src={src:#x} dest={dest:#x} len={length}")
        }
        LogEvent::Write {
            location,
            length,
            value,
        } => {
            let bytes = value[..*length as usize]
                .iter()
                .map(|byte| format!("{byte:02x}"))
                .collect::<Vec<_>>()
                .join(" ");
            format!("{index:6}  write     loc={location:#x} len={length} value=[{bytes}]")
        }
    }
}

fn main() -> Result<(), Error> {
    env_logger::init();

    let cli = cli::Cli::parse();

    let total = std::fs::metadata(&cli.log)?.len();
    let trailing = total % EVENT_SIZE as u64;
    if trailing != 0 {
        println!(
            "{}: {trailing} trailing bytes do not fill a record",
            cli.log.display()
        );
    }

    let mut reader = BufReader::new(File::open(&cli.log)?);
    let mut index = 0usize;
    let mut broken = trailing != 0;
    let mut first_is_begin = false;

    while let Some(record) = read_event(&mut reader) {
        match LogEvent::decode(&record) {
            Ok(event) => {
                if index == 0 {
                    first_is_begin = matches!(event, LogEvent::Begin { .. });
                }
                if !cli.quiet {
                    println!("{}", describe(index, &event));
                }
            }
            Err(err) => {
                println!("{index:6}  malformed: {err}");
                broken = true;
            }
        }
        index += 1;
    }

    if index > 0 && !first_is_begin {
        println!("log does not start with a begin record");
        broken = true;
    }

    println!(
        "{}: {index} records{}",
        cli.log.display(),
        if broken { ", malformed" } else { "" }
    );

    if broken {
        exit(1);
    }
    log::info!("Finished");
    Ok(())
}
