#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use efs::{FileBlockDevice, FileKind, FileSystem, FormatOptions, O_CREAT, O_RDONLY, O_WRONLY};
use rand::Rng;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "efs", about = "ExtentFS — an ext4-inspired filesystem in a file")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a fresh filesystem image.
    Mkfs {
        /// Path to the image file.
        image: PathBuf,
        /// Image size in MiB (defaults to the file's current size).
        #[arg(long)]
        size_mib: Option<u64>,
        /// Block size in bytes.
        #[arg(long, default_value_t = 4096)]
        block_size: u32,
    },
    /// Print superblock geometry and free counts.
    Info {
        /// Path to the image file.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Verify allocator invariants (bitmaps vs descriptor vs superblock).
    Check {
        /// Path to the image file.
        image: PathBuf,
    },
    /// Run the interactive shell on a mounted image.
    Shell {
        /// Path to the image file.
        image: PathBuf,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Mkfs {
            image,
            size_mib,
            block_size,
        } => mkfs(&image, size_mib, block_size),
        Command::Info { image, json } => info(&image, json),
        Command::Check { image } => check(&image),
        Command::Shell { image } => shell(&image),
    }
}

// ── mkfs / info / check ─────────────────────────────────────────────────────

fn mkfs(image: &PathBuf, size_mib: Option<u64>, block_size: u32) -> Result<()> {
    let opts = FormatOptions {
        block_size,
        ..FormatOptions::default()
    };
    let fs = match size_mib {
        Some(mib) => {
            let blocks = mib
                .checked_mul(1024 * 1024)
                .map(|bytes| bytes / u64::from(block_size))
                .context("image size overflows")?;
            let dev = FileBlockDevice::create(image, block_size, blocks)
                .with_context(|| format!("failed to create {}", image.display()))?;
            efs::format(Box::new(dev), &opts)?
        }
        None => efs::init_filesystem(image, &opts)
            .with_context(|| format!("failed to format {}", image.display()))?,
    };
    let report = fs.df();
    println!(
        "formatted {}: {} blocks of {} bytes, {} inodes",
        image.display(),
        report.total_blocks,
        report.block_size,
        report.total_inodes
    );
    Ok(())
}

fn info(image: &PathBuf, json: bool) -> Result<()> {
    let fs = FileSystem::open_path(image)
        .with_context(|| format!("failed to mount {}", image.display()))?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&fs.df()).context("serialize output")?
        );
        return Ok(());
    }
    let sb = fs.superblock();
    println!("ExtentFS image: {}", image.display());
    println!("block_size: {}", sb.block_size);
    println!("fs_size_blocks: {}", sb.fs_size_blocks);
    println!("blocks_per_group: {}", sb.blocks_per_group);
    println!("inodes_per_group: {}", sb.inodes_per_group);
    println!("first_data_block: {}", sb.first_data_block);
    println!("total_inodes: {}", sb.total_inodes);
    println!("free_blocks: {}", sb.free_blocks_count);
    println!("free_inodes: {}", sb.free_inodes_count);
    Ok(())
}

fn check(image: &PathBuf) -> Result<()> {
    let fs = FileSystem::open_path(image)
        .with_context(|| format!("failed to mount {}", image.display()))?;
    match fs.verify_allocator_invariants() {
        Ok(()) => {
            println!("{}: clean", image.display());
            Ok(())
        }
        Err(err) => bail!("{}: {err}", image.display()),
    }
}

// ── Shell ───────────────────────────────────────────────────────────────────

fn shell(image: &PathBuf) -> Result<()> {
    let mut fs = FileSystem::open_path(image)
        .with_context(|| format!("failed to mount {}", image.display()))?;
    println!("ExtentFS shell — `help` lists commands, `exit` leaves.");

    let stdin = io::stdin();
    loop {
        print!("efs:{}$ ", fs.getcwd());
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let args: Vec<&str> = line.split_whitespace().collect();
        let Some((&cmd, rest)) = args.split_first() else {
            continue;
        };
        if cmd == "exit" || cmd == "quit" {
            break;
        }
        if let Err(err) = dispatch(&mut fs, cmd, rest) {
            println!("{cmd}: {err}");
        }
    }
    fs.sync()?;
    Ok(())
}

fn dispatch(fs: &mut FileSystem, cmd: &str, args: &[&str]) -> Result<()> {
    match cmd {
        "help" => {
            println!(
                "commands: pwd ls cd mkdir rmdir rm cat touch echo cp mv chmod chown\n          df du ln rndfile stat lstat readlink help exit"
            );
            Ok(())
        }
        "pwd" => {
            println!("{}", fs.getcwd());
            Ok(())
        }
        "ls" => cmd_ls(fs, args),
        "cd" => {
            fs.chdir(args.first().copied().unwrap_or("/"))?;
            Ok(())
        }
        "mkdir" => {
            let path = required(args, 0, "missing operand")?;
            fs.mkdir(path, 0o755)?;
            Ok(())
        }
        "rmdir" => cmd_rmdir(fs, args),
        "rm" => {
            let path = required(args, 0, "missing operand")?;
            fs.unlink(path)?;
            Ok(())
        }
        "cat" => cmd_cat(fs, args),
        "touch" => {
            let path = required(args, 0, "missing operand")?;
            let fd = fs.openf(path, O_CREAT | O_WRONLY, 0o644)?;
            fs.close(fd)?;
            Ok(())
        }
        "echo" => cmd_echo(fs, args),
        "cp" => cmd_cp(fs, args),
        "mv" => cmd_mv(fs, args),
        "chmod" => cmd_chmod(fs, args),
        "chown" => cmd_chown(fs, args),
        "df" => cmd_df(fs),
        "du" => {
            let path = args.first().copied().unwrap_or(".");
            let st = fs.stat(path)?;
            println!("{}K\t{path}", st.size.div_ceil(1024));
            Ok(())
        }
        "ln" => cmd_ln(fs, args),
        "rndfile" => cmd_rndfile(fs, args),
        "stat" => cmd_stat(fs, args, true),
        "lstat" => cmd_stat(fs, args, false),
        "readlink" => {
            let path = required(args, 0, "missing operand")?;
            println!("{}", fs.read_link(path)?);
            Ok(())
        }
        other => bail!("unknown command `{other}` (try `help`)"),
    }
}

fn required<'a>(args: &[&'a str], idx: usize, msg: &'static str) -> Result<&'a str> {
    args.get(idx).copied().context(msg)
}

fn read_whole_file(fs: &mut FileSystem, path: &str) -> Result<Vec<u8>> {
    let fd = fs.openf(path, O_RDONLY, 0)?;
    let mut out = Vec::new();
    loop {
        let chunk = fs.read(fd, 1024 * 1024, None)?;
        if chunk.is_empty() {
            break;
        }
        out.extend_from_slice(&chunk);
    }
    fs.close(fd)?;
    Ok(out)
}

fn write_whole_file(fs: &mut FileSystem, path: &str, data: &[u8], append: bool) -> Result<()> {
    let flags = if append {
        O_CREAT | O_WRONLY
    } else {
        O_CREAT | O_WRONLY | efs::O_TRUNC
    };
    let fd = fs.openf(path, flags, 0o644)?;
    let offset = if append {
        Some(fs.stat(path)?.size)
    } else {
        None
    };
    fs.write(fd, data, offset)?;
    fs.close(fd)?;
    Ok(())
}

fn cmd_ls(fs: &mut FileSystem, args: &[&str]) -> Result<()> {
    let path = args.first().copied().unwrap_or(".");
    for entry in fs.readdir(path)? {
        let name = entry.name_str();
        if name == "." || name == ".." {
            continue;
        }
        match entry.file_type {
            efs_types_ft::DIRECTORY => println!("{name}/"),
            efs_types_ft::SYMLINK => {
                let target = fs
                    .read_link(&join_path(path, &name))
                    .unwrap_or_else(|_| "?".to_owned());
                println!("{name} -> {target}");
            }
            _ => println!("{name}"),
        }
    }
    Ok(())
}

/// Directory-entry type bytes, re-stated locally to keep the shell free of
/// the low-level crates.
mod efs_types_ft {
    pub const DIRECTORY: u8 = 2;
    pub const SYMLINK: u8 = 7;
}

fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{}/{name}", dir.trim_end_matches('/'))
    }
}

fn cmd_rmdir(fs: &mut FileSystem, args: &[&str]) -> Result<()> {
    if args.first() == Some(&"-r") {
        let path = required(args, 1, "missing operand")?;
        fs.rmdir_recursive(path)?;
    } else {
        let path = required(args, 0, "missing operand")?;
        fs.rmdir(path)?;
    }
    Ok(())
}

fn cmd_cat(fs: &mut FileSystem, args: &[&str]) -> Result<()> {
    let path = required(args, 0, "missing operand")?;
    let data = read_whole_file(fs, path)?;
    let mut stdout = io::stdout();
    stdout.write_all(&data)?;
    if !data.ends_with(b"\n") {
        println!();
    }
    Ok(())
}

/// `echo TEXT` prints; `echo TEXT > FILE` writes, `>>` appends.
fn cmd_echo(fs: &mut FileSystem, args: &[&str]) -> Result<()> {
    if let Some(pos) = args.iter().position(|a| *a == ">" || *a == ">>") {
        let append = args[pos] == ">>";
        let path = required(args, pos + 1, "missing redirect target")?;
        let mut text = args[..pos].join(" ");
        text.push('\n');
        write_whole_file(fs, path, text.as_bytes(), append)?;
    } else {
        println!("{}", args.join(" "));
    }
    Ok(())
}

fn cmd_cp(fs: &mut FileSystem, args: &[&str]) -> Result<()> {
    let src = required(args, 0, "missing source")?;
    let dst = required(args, 1, "missing destination")?;
    let data = read_whole_file(fs, src)?;
    write_whole_file(fs, dst, &data, false)?;
    Ok(())
}

fn cmd_mv(fs: &mut FileSystem, args: &[&str]) -> Result<()> {
    let src = required(args, 0, "missing source")?;
    let dst = required(args, 1, "missing destination")?;
    let st = fs.lstat(src)?;
    if st.kind != FileKind::Regular {
        bail!("only regular files can be moved");
    }
    // Move as link-then-unlink so the inode (and its data) is untouched.
    fs.link(src, dst)?;
    fs.unlink(src)?;
    Ok(())
}

fn cmd_chmod(fs: &mut FileSystem, args: &[&str]) -> Result<()> {
    let mode = required(args, 0, "missing mode")?;
    let path = required(args, 1, "missing operand")?;
    let mode = u32::from_str_radix(mode, 8).context("mode must be octal")?;
    fs.chmod(path, mode)?;
    Ok(())
}

fn cmd_chown(fs: &mut FileSystem, args: &[&str]) -> Result<()> {
    let owner = required(args, 0, "missing owner[:group]")?;
    let path = required(args, 1, "missing operand")?;
    let (uid, gid) = match owner.split_once(':') {
        Some((u, g)) => (u.parse()?, g.parse()?),
        None => (owner.parse()?, fs.stat(path)?.gid),
    };
    fs.chown(path, uid, gid)?;
    Ok(())
}

fn cmd_df(fs: &mut FileSystem) -> Result<()> {
    let report = fs.df();
    let used = report.total_blocks - report.free_blocks;
    println!("Filesystem     blocks      used      free  Use%");
    println!(
        "{:<12} {:>8} {:>9} {:>9} {:>4}%",
        "extentfs",
        report.total_blocks,
        used,
        report.free_blocks,
        used * 100 / report.total_blocks.max(1)
    );
    println!(
        "inodes: {} total, {} free",
        report.total_inodes, report.free_inodes
    );
    Ok(())
}

/// `ln TARGET LINK` makes a hard link, `ln -s TARGET LINK` a symlink.
fn cmd_ln(fs: &mut FileSystem, args: &[&str]) -> Result<()> {
    if args.first() == Some(&"-s") {
        let target = required(args, 1, "missing target")?;
        let link = required(args, 2, "missing link name")?;
        fs.symlink(target, link)?;
    } else {
        let target = required(args, 0, "missing target")?;
        let link = required(args, 1, "missing link name")?;
        fs.link(target, link)?;
    }
    Ok(())
}

/// `rndfile NAME SIZE` fills NAME with random printable bytes. SIZE takes
/// B/K/M suffixes.
fn cmd_rndfile(fs: &mut FileSystem, args: &[&str]) -> Result<()> {
    let path = required(args, 0, "missing operand (usage: rndfile NAME SIZE)")?;
    let size = parse_size(required(args, 1, "missing size")?)?;

    let fd = fs.openf(path, O_CREAT | O_WRONLY | efs::O_TRUNC, 0o644)?;
    let mut rng = rand::thread_rng();
    let mut remaining = size;
    let mut chunk = vec![0_u8; usize::try_from(size.min(1024 * 1024)).unwrap_or(1024 * 1024)];
    while remaining > 0 {
        let len = chunk.len().min(usize::try_from(remaining).unwrap_or(chunk.len()));
        for byte in &mut chunk[..len] {
            *byte = rng.gen_range(0x20..0x7F);
        }
        fs.write(fd, &chunk[..len], None)?;
        remaining -= len as u64;
    }
    fs.close(fd)?;
    println!("created {path} with {size} random bytes");
    Ok(())
}

fn parse_size(raw: &str) -> Result<u64> {
    let upper = raw.to_ascii_uppercase();
    let (digits, multiplier) = match upper.as_bytes().last() {
        Some(b'B') => (&upper[..upper.len() - 1], 1),
        Some(b'K') => (&upper[..upper.len() - 1], 1024),
        Some(b'M') => (&upper[..upper.len() - 1], 1024 * 1024),
        Some(b'G') => bail!("size too large"),
        _ => (upper.as_str(), 1),
    };
    let value: u64 = digits.parse().context("invalid size")?;
    let size = value.checked_mul(multiplier).context("size overflows")?;
    if size == 0 {
        bail!("size must be positive");
    }
    if size > 512 * 1024 * 1024 {
        bail!("size too large");
    }
    Ok(size)
}

fn cmd_stat(fs: &mut FileSystem, args: &[&str], follow: bool) -> Result<()> {
    let path = required(args, 0, "missing operand")?;
    let st = if follow { fs.stat(path)? } else { fs.lstat(path)? };
    let kind = match st.kind {
        FileKind::Regular => "regular file",
        FileKind::Directory => "directory",
        FileKind::Symlink => "symbolic link",
    };
    println!("  File: {path}");
    println!("  Size: {:<12} Links: {:<6} {kind}", st.size, st.links_count);
    println!(
        " Inode: {:<12} Mode: {:o}  Uid: {}  Gid: {}",
        st.ino,
        st.mode & 0o7777,
        st.uid,
        st.gid
    );
    println!("Access: {}  Modify: {}  Change: {}", st.atime, st.mtime, st.ctime);
    if st.kind == FileKind::Symlink {
        println!("Target: {}", fs.read_link(path)?);
    }
    Ok(())
}
