//!
//! dtlog_check.rs
//! CLI wrapper around `playlist_3pc::checker`: run after a multi-process
//! run to verify every process's DT-log agrees on every key it decided.
use std::process;

use clap::{App, Arg};

use playlist_3pc::checker::check_last_run;

fn main() {
    let matches = App::new("dtlog-check")
        .version("0.1.0")
        .about("Checks DT-logs left behind by a playlist-3pc run for cross-process agreement")
        .arg(
            Arg::with_name("num_procs")
                .help("Number of processes in the run")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("log_dir")
                .help("Directory containing dt_log_<id>.log files")
                .required(true)
                .index(2),
        )
        .get_matches();

    let num_procs: u32 = match matches.value_of("num_procs").unwrap().parse() {
        Ok(n) => n,
        Err(e) => {
            eprintln!("dtlog-check: bad num_procs: {}", e);
            process::exit(2);
        }
    };
    let log_dir = matches.value_of("log_dir").unwrap();

    stderrlog::new().module(module_path!()).verbosity(3).init().ok();

    match check_last_run(num_procs, log_dir) {
        Ok(report) if report.ok() => {
            println!("OK: {} keys checked, no disagreements", report.keys_checked);
        }
        Ok(report) => {
            println!("FAIL: {} keys checked, {} disagreement(s):", report.keys_checked, report.mismatches.len());
            for m in &report.mismatches {
                println!("  {}: committed by {:?}, aborted by {:?}", m.key, m.committed_by, m.aborted_by);
            }
            process::exit(1);
        }
        Err(e) => {
            eprintln!("dtlog-check: {}", e);
            process::exit(2);
        }
    }
}
