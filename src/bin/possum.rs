//! Administrative CLI for inspecting and manipulating a possum store
//! directory by hand. Not a daemon: one operation per invocation.

use std::io::{self, Read, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use possum::{Handle, Limits};

#[derive(Parser)]
#[command(name = "possum", about = "Inspect and manipulate a possum store")]
struct Cli {
    /// Path to the store directory, created if it doesn't exist.
    #[arg(short, long, default_value = "possum-data")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a value, read from stdin, under KEY.
    Put {
        key: String,
    },
    /// Print the value stored under KEY to stdout.
    Get {
        key: String,
    },
    /// Print size and last-used time for KEY.
    Stat {
        key: String,
    },
    /// List every key starting with PREFIX (default: all keys).
    List {
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Delete KEY.
    Rm {
        key: String,
    },
    /// Rewrite every key starting with FROM to instead start with TO.
    Mv {
        from: String,
        to: String,
    },
    /// Lower the store's max_value_length_sum, evicting immediately if needed.
    SetMaxSize {
        bytes: u64,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let handle = Handle::open(&cli.dir)?;

    match cli.command {
        Command::Put { key } => {
            let mut value = Vec::new();
            io::stdin().read_to_end(&mut value)?;
            let n = handle.single_write(key.as_bytes(), &value)?;
            eprintln!("wrote {n} bytes");
        }
        Command::Get { key } => {
            let stat = handle
                .single_stat(key.as_bytes())?
                .ok_or(possum::Error::NoSuchKey)?;
            let mut buf = vec![0u8; stat.size as usize];
            let mut offset = 0u64;
            while (offset as usize) < buf.len() {
                let n = handle.single_read_at(key.as_bytes(), &mut buf[offset as usize..], offset)?;
                if n == 0 {
                    break;
                }
                offset += n as u64;
            }
            io::stdout().write_all(&buf[..offset as usize])?;
        }
        Command::Stat { key } => {
            let stat = handle
                .single_stat(key.as_bytes())?
                .ok_or(possum::Error::NoSuchKey)?;
            println!("size: {}", stat.size);
            println!("last_used: {}.{:09}", stat.last_used.secs, stat.last_used.nanos);
        }
        Command::List { prefix } => {
            for item in handle.list_items(prefix.as_bytes())? {
                println!("{}\t{}", String::from_utf8_lossy(&item.key), item.stat.size);
            }
        }
        Command::Rm { key } => {
            let stat = handle.single_delete(key.as_bytes())?;
            eprintln!("deleted {} bytes", stat.size);
        }
        Command::Mv { from, to } => {
            handle.move_prefix(from.as_bytes(), to.as_bytes())?;
        }
        Command::SetMaxSize { bytes } => {
            let mut limits = Limits::default();
            limits.max_value_length_sum = bytes;
            handle.set_limits(limits)?;
        }
    }

    Ok(())
}
