//! Seeks every tracked journal's cursor to its current end, so a
//! subsequently-started agent skips every entry that exists right now.

use std::io::{self, Write as _};
use std::path::Path;

use clap::Parser;
use mygrate_agent::{init_tracing, SharedArgs};
use mygrate_follower::read_index;
use mygrate_tracking::{cursor_path, read_position, CursorHandle};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Seeks every tracked binlog's cursor to its current end")]
struct Cli {
    /// Skip the interactive confirmation prompt.
    #[arg(short = 'f', long)]
    force: bool,

    #[command(flatten)]
    shared: SharedArgs,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.shared.verbose);

    if !cli.force && !confirm()? {
        std::process::exit(1);
    }

    let config = cli.shared.load_config()?;
    let journals = read_index(&config.database.binlog_index)?;

    for journal in journals {
        skip_to_end(&journal, &config.tracker.tracking_dir)?;
    }

    Ok(())
}

fn skip_to_end(journal: &Path, tracking_dir: &Path) -> anyhow::Result<()> {
    let cursor_file = cursor_path(tracking_dir, journal);
    let old_position = read_position(&cursor_file)?;
    let size = std::fs::metadata(journal)?.len();

    let mut cursor = CursorHandle::open(&cursor_file)?;
    cursor.write(&size.to_string())?;

    info!(journal = %journal.display(), from = %old_position, to = size, "cursor advanced to end");
    println!("changing {} from {} to {}", cursor_file.display(), old_position, size);
    Ok(())
}

fn confirm() -> anyhow::Result<bool> {
    println!("This utility will seek the binlog tracking files to the end of all");
    println!("existing entries. All previous entries will be skipped. There is no");
    println!("easy way to undo this operation!");
    println!();

    loop {
        print!("Are you sure?  N/y: ");
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().read_line(&mut answer)?;
        match answer.trim() {
            "y" | "Y" => return Ok(true),
            "n" | "N" | "" => return Ok(false),
            _ => continue,
        }
    }
}
