//! Configuration syntax checker.
//!
//! Parses a task file with the same code path as the daemon and prints the
//! resulting task record as JSON, so images can validate their task sets at
//! build time. Exits non-zero on any parse error.

use std::path::PathBuf;
use std::process::exit;

use structopt::StructOpt;

use rinit::config;
use rinit::logger;

#[derive(Debug, StructOpt)]
#[structopt(name = "rinit-check", about = "Validate rinit task configuration files.")]
struct Opt {
    /// Task files to check.
    #[structopt(parse(from_os_str), required = true)]
    files: Vec<PathBuf>,

    /// Print the parsed task records as JSON.
    #[structopt(long)]
    dump: bool,
}

fn main() {
    logger::init();
    let opt = Opt::from_args();

    let mut failures = 0;
    for file in &opt.files {
        match config::task_from_file(file) {
            Ok(task) => {
                if opt.dump {
                    match serde_json::to_string_pretty(&task) {
                        Ok(json) => println!("{}", json),
                        Err(e) => {
                            eprintln!("{}: could not serialize task: {}", file.display(), e);
                            failures += 1;
                        }
                    }
                } else {
                    println!("{}: OK (task '{}')", file.display(), task.name);
                }
            }
            Err(e) => {
                eprintln!("{}: {}", file.display(), e);
                failures += 1;
            }
        }
    }
    if failures > 0 {
        exit(1);
    }
}
