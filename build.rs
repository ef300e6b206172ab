//! Build script that renders the `machina(1)` manual page.
//!
//! The CLI definitions live in `src/cli/mod.rs` so the binary and this script
//! share one source of truth for the flag surface.

use std::env;
use std::io::Write;
use std::path::Path;

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli/mod.rs"]
mod cli;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut stdout = std::io::stdout();
    for tracked in ["build.rs", "src/cli/mod.rs"] {
        writeln!(stdout, "cargo:rerun-if-changed={tracked}")?;
    }

    let out_dir = env::var_os("OUT_DIR").ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "OUT_DIR was not set")
    })?;

    let mut rendered = Vec::new();
    Man::new(cli::Cli::command()).render(&mut rendered)?;
    std::fs::write(Path::new(&out_dir).join("machina.1"), rendered)?;

    Ok(())
}
