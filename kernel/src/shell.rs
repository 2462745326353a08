//! Interactive shell
//!
//! Command dispatch over the scheduler, PMM, block layer and VFS. The
//! command surface is operational tooling, not a stable interface. All
//! output goes through a caller-supplied writer so the dispatcher can be
//! exercised without a console; the interactive loop feeds it lines from
//! the keyboard and serial port.
//!
//! Paths are accepted in mount-colon form (`root:/dir/file`) and in
//! Unix-ish form (`/dev/ram0`), where a leading component naming a mount
//! selects it and anything else resolves inside the current mount.

use alloc::{format, string::String, vec, vec::Vec};
use core::fmt::{self, Write as _};

use crate::block::{self, partition, ramdisk::RamDisk, BlockDevice};
use crate::error::KernelError;
use crate::fs::{self, exfat, NodeType};
use crate::mm::PMM;
use crate::sched;

/// Shell state: the current working directory.
pub struct Shell {
    cwd_mount: String,
    cwd_path: String,
}

impl Default for Shell {
    fn default() -> Self {
        Self::new()
    }
}

type CmdResult = Result<(), KernelError>;

impl Shell {
    pub fn new() -> Self {
        Self {
            cwd_mount: String::new(),
            cwd_path: String::from("/"),
        }
    }

    /// Execute one command line, writing output to `out`.
    pub fn exec(&mut self, line: &str, out: &mut dyn fmt::Write) -> fmt::Result {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        let (command, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((c, r)) => (c, r.trim()),
            None => (trimmed, ""),
        };
        let args: Vec<&str> = rest.split_whitespace().collect();

        let result = match command {
            "help" => self.cmd_help(out),
            "echo" => {
                writeln!(out, "{rest}").ok();
                Ok(())
            }
            "info" => self.cmd_info(out),
            "clear" => {
                #[cfg(all(target_arch = "x86_64", target_os = "none"))]
                crate::vga::clear();
                Ok(())
            }
            "ps" => self.cmd_ps(out),
            "mem" => self.cmd_mem(out),
            "free" => {
                let free = PMM.lock().free_bytes();
                writeln!(out, "{free:#x}").ok();
                Ok(())
            }
            "used" => {
                let (total, free) = {
                    let pmm = PMM.lock();
                    (pmm.total_physical_bytes(), pmm.free_bytes())
                };
                writeln!(out, "{:#x}", total.saturating_sub(free)).ok();
                Ok(())
            }
            "mkram" => self.cmd_mkram(&args, out),
            "mount" => self.cmd_mount(&args, out),
            "mounts" => self.cmd_mounts(out),
            "scan" => {
                let found = partition::scan();
                writeln!(out, "{found} partition(s) registered").ok();
                Ok(())
            }
            "ls" => self.cmd_ls(&args, out),
            "cd" => self.cmd_cd(&args),
            "pwd" => {
                if self.cwd_mount.is_empty() {
                    writeln!(out, "(no mount)").ok();
                } else {
                    writeln!(out, "{}:{}", self.cwd_mount, self.cwd_path).ok();
                }
                Ok(())
            }
            "mkexfat" => self.cmd_mkexfat(&args),
            "mkfs" => match args.split_first() {
                Some((&"exfat", dev_args)) => self.cmd_mkexfat(dev_args),
                _ => Err(KernelError::InvalidArgument),
            },
            "cat" => self.cmd_cat(&args, out),
            "stat" => self.cmd_stat(&args, out),
            "touch" => self.with_resolved(&args, fs::create),
            "write" => self.cmd_write(rest),
            "rm" => self.with_resolved(&args, fs::unlink),
            "fill" => self.cmd_fill(&args),
            _ => {
                writeln!(out, "unknown command. type 'help'").ok();
                Ok(())
            }
        };

        if let Err(e) = result {
            writeln!(out, "error: {e}")?;
        }
        Ok(())
    }

    fn cmd_help(&self, out: &mut dyn fmt::Write) -> CmdResult {
        let lines = [
            "Built-in commands:",
            "  help                         show this help",
            "  echo <text>                  echo text",
            "  info                         system info",
            "  clear                        clear screen",
            "  ps                           list threads",
            "  mem | free | used            memory totals",
            "  mkram <name> <hex-bytes>     create a RAM disk",
            "  scan                         scan disks for MBR partitions",
            "  mount <fs> <mnt> [dev]       mount a filesystem",
            "  mounts                       list mounts",
            "  ls [path] | cd <path> | pwd  directories",
            "  mkexfat <dev> [label]        format a device as exFAT",
            "  mkfs exfat <dev> [label]     same as mkexfat",
            "  cat <path>                   print a file",
            "  stat <path>                  file size and type",
            "  touch <path>                 create an empty file",
            "  write <path> <text>          write text at offset 0",
            "  rm <path>                    remove a file",
            "  fill <path> <hex-size> [ch]  fill a file with a byte",
        ];
        for line in lines {
            writeln!(out, "{line}").ok();
        }
        Ok(())
    }

    fn cmd_info(&self, out: &mut dyn fmt::Write) -> CmdResult {
        writeln!(out, "OnyxOS {} (x86_64)", env!("CARGO_PKG_VERSION")).ok();
        writeln!(out, "cooperative kernel shell. try 'help'.").ok();
        Ok(())
    }

    fn cmd_ps(&self, out: &mut dyn fmt::Write) -> CmdResult {
        let mut info = [sched::ThreadInfo {
            id: 0,
            state: sched::ThreadState::Done,
            stack_pointer: 0,
        }; sched::MAX_THREADS];
        let count = sched::threads(&mut info);
        let current = sched::current_id();

        writeln!(out, "ID   STATE   RSP                 CUR").ok();
        for thread in &info[..count] {
            let state = match thread.state {
                sched::ThreadState::Ready => "ready",
                sched::ThreadState::Running => "run",
                sched::ThreadState::Done => "done",
            };
            writeln!(
                out,
                "{:<4} {:<7} {:#018x}  {}",
                thread.id,
                state,
                thread.stack_pointer,
                if current == Some(thread.id) { "*" } else { "" }
            )
            .ok();
        }
        Ok(())
    }

    fn cmd_mem(&self, out: &mut dyn fmt::Write) -> CmdResult {
        let (total, usable, free) = {
            let pmm = PMM.lock();
            (
                pmm.total_physical_bytes(),
                pmm.total_usable_bytes(),
                pmm.free_bytes(),
            )
        };
        writeln!(out, "Physical total: {total:#x} bytes").ok();
        writeln!(out, "Usable:         {usable:#x} bytes").ok();
        writeln!(out, "Free:           {free:#x} bytes").ok();
        writeln!(out, "Used:           {:#x} bytes", total.saturating_sub(free)).ok();
        Ok(())
    }

    fn cmd_mkram(&self, args: &[&str], out: &mut dyn fmt::Write) -> CmdResult {
        let (&name, rest) = args.split_first().ok_or(KernelError::InvalidArgument)?;
        let (&size_text, _) = rest.split_first().ok_or(KernelError::InvalidArgument)?;
        let bytes = parse_hex(size_text)?;
        let disk = RamDisk::create(name, bytes)?;
        writeln!(
            out,
            "ramdisk {}: {:#x} bytes",
            disk.name(),
            disk.sector_count() * block::SECTOR_SIZE as u64
        )
        .ok();
        Ok(())
    }

    fn cmd_mount(&mut self, args: &[&str], out: &mut dyn fmt::Write) -> CmdResult {
        match *args {
            [fs_name, mount_name] => fs::mount(fs_name, mount_name, None)?,
            [fs_name, mount_name, dev] => fs::mount(fs_name, mount_name, Some(dev))?,
            _ => return Err(KernelError::InvalidArgument),
        }
        writeln!(out, "mounted {} on {}", args[0], args[1]).ok();
        // drop into the fresh mount
        self.cwd_mount = String::from(args[1]);
        self.cwd_path = String::from("/");
        Ok(())
    }

    fn cmd_mounts(&self, out: &mut dyn fmt::Write) -> CmdResult {
        writeln!(out, "Mounts:").ok();
        for name in fs::mount_names() {
            writeln!(out, "  {name}").ok();
        }
        Ok(())
    }

    fn cmd_ls(&self, args: &[&str], out: &mut dyn fmt::Write) -> CmdResult {
        let path = match args.first() {
            Some(&arg) => self.resolve(arg)?,
            None => self.cwd_canonical()?,
        };
        let node = fs::open(&path)?;
        if node.node_type() != NodeType::Directory {
            let meta = fs::stat(&path)?;
            writeln!(out, "{path}  {:#x}", meta.size).ok();
            return Ok(());
        }
        let mut index = 0;
        while let Some(name) = node.readdir(index)? {
            let child = join_child(&path, &name);
            match fs::stat(&child) {
                Ok(meta) if meta.is_dir() => writeln!(out, "{name}/").ok(),
                Ok(meta) => writeln!(out, "{name}  {:#x}", meta.size).ok(),
                Err(_) => writeln!(out, "{name}").ok(),
            };
            index += 1;
        }
        Ok(())
    }

    fn cmd_cd(&mut self, args: &[&str]) -> CmdResult {
        let (&arg, _) = args.split_first().ok_or(KernelError::InvalidArgument)?;
        let path = self.resolve(arg)?;
        let meta = fs::stat(&path)?;
        if !meta.is_dir() {
            return Err(KernelError::InvalidArgument);
        }
        let (mount, sub) = fs::split_path(&path)?;
        self.cwd_mount = String::from(mount);
        self.cwd_path = String::from(sub);
        Ok(())
    }

    fn cmd_mkexfat(&self, args: &[&str]) -> CmdResult {
        let (&dev_name, rest) = args.split_first().ok_or(KernelError::InvalidArgument)?;
        let dev = block::find(dev_name).ok_or(KernelError::NotFound)?;
        exfat::mkfs::format(&dev, rest.first().copied())
    }

    fn cmd_cat(&self, args: &[&str], out: &mut dyn fmt::Write) -> CmdResult {
        let (&arg, _) = args.split_first().ok_or(KernelError::InvalidArgument)?;
        let node = fs::open(&self.resolve(arg)?)?;
        let mut buf = vec![0u8; 512];
        let mut offset = 0u64;
        loop {
            let n = node.read(offset, &mut buf)?;
            if n == 0 {
                break;
            }
            for &byte in &buf[..n] {
                let ch = if byte.is_ascii_graphic() || byte == b' ' || byte == b'\n' {
                    byte as char
                } else {
                    '.'
                };
                write!(out, "{ch}").ok();
            }
            offset += n as u64;
        }
        writeln!(out).ok();
        Ok(())
    }

    fn cmd_stat(&self, args: &[&str], out: &mut dyn fmt::Write) -> CmdResult {
        let (&arg, _) = args.split_first().ok_or(KernelError::InvalidArgument)?;
        let path = self.resolve(arg)?;
        let meta = fs::stat(&path)?;
        writeln!(
            out,
            "{path}: size {:#x} type {}",
            meta.size,
            if meta.is_dir() { "dir" } else { "file" }
        )
        .ok();
        Ok(())
    }

    fn cmd_write(&self, rest: &str) -> CmdResult {
        let (path_arg, text) = rest
            .split_once(char::is_whitespace)
            .ok_or(KernelError::InvalidArgument)?;
        let text = text.trim();
        let text = text
            .strip_prefix('"')
            .and_then(|t| t.strip_suffix('"'))
            .unwrap_or(text);

        let path = self.resolve(path_arg)?;
        let node = match fs::open(&path) {
            Ok(node) => node,
            Err(KernelError::NotFound) => {
                fs::create(&path)?;
                fs::open(&path)?
            }
            Err(e) => return Err(e),
        };
        node.write(0, text.as_bytes())?;
        Ok(())
    }

    fn cmd_fill(&self, args: &[&str]) -> CmdResult {
        let (&path_arg, rest) = args.split_first().ok_or(KernelError::InvalidArgument)?;
        let (&size_text, rest) = rest.split_first().ok_or(KernelError::InvalidArgument)?;
        let size = parse_hex(size_text)?;
        let fill_byte = rest
            .first()
            .and_then(|s| s.bytes().next())
            .unwrap_or(b'A');

        let path = self.resolve(path_arg)?;
        if fs::open(&path).is_err() {
            fs::create(&path)?;
        }
        let node = fs::open(&path)?;

        let chunk = vec![fill_byte; 512];
        let mut offset = 0u64;
        while offset < size {
            let put = ((size - offset) as usize).min(chunk.len());
            node.write(offset, &chunk[..put])?;
            offset += put as u64;
        }
        Ok(())
    }

    /// Apply a path-based VFS operation to a resolved argument.
    fn with_resolved(
        &self,
        args: &[&str],
        op: fn(&str) -> Result<(), KernelError>,
    ) -> CmdResult {
        let (&arg, _) = args.split_first().ok_or(KernelError::InvalidArgument)?;
        op(&self.resolve(arg)?)
    }

    fn cwd_canonical(&self) -> Result<String, KernelError> {
        if self.cwd_mount.is_empty() {
            return Err(KernelError::NotFound);
        }
        Ok(format!("{}:{}", self.cwd_mount, self.cwd_path))
    }

    /// Turn a command argument into canonical `mount:/sub` form.
    fn resolve(&self, arg: &str) -> Result<String, KernelError> {
        if arg.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        if arg.contains(':') {
            let (mount, sub) = fs::split_path(arg)?;
            return Ok(format!("{mount}:{}", normalize(sub)));
        }
        if let Some(absolute) = arg.strip_prefix('/') {
            // a leading component naming a mount selects that mount
            let (head, tail) = match absolute.split_once('/') {
                Some((h, t)) => (h, t),
                None => (absolute, ""),
            };
            if fs::is_mounted(head) {
                return Ok(format!("{head}:{}", normalize(tail)));
            }
            if self.cwd_mount.is_empty() {
                return Err(KernelError::NotFound);
            }
            return Ok(format!("{}:{}", self.cwd_mount, normalize(absolute)));
        }
        if self.cwd_mount.is_empty() {
            return Err(KernelError::NotFound);
        }
        let joined = format!("{}/{arg}", self.cwd_path);
        Ok(format!("{}:{}", self.cwd_mount, normalize(&joined)))
    }
}

/// Collapse `.`/`..`/empty components; result always starts with `/`.
fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        String::from("/")
    } else {
        let mut result = String::new();
        for part in parts {
            result.push('/');
            result.push_str(part);
        }
        result
    }
}

/// Append a child name to a canonical path.
fn join_child(path: &str, name: &str) -> String {
    if path.ends_with('/') {
        format!("{path}{name}")
    } else {
        format!("{path}/{name}")
    }
}

/// Parse a hex number with optional `0x` prefix.
fn parse_hex(text: &str) -> Result<u64, KernelError> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(digits, 16).map_err(|_| KernelError::InvalidArgument)
}

/// Entry of the interactive shell thread.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn shell_thread(_arg: usize) {
    struct Console;
    impl fmt::Write for Console {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            crate::print!("{}", s);
            Ok(())
        }
    }

    crate::println!();
    crate::println!("Entering shell. Type 'help'.");

    let mut shell = Shell::new();
    let mut console = Console;
    let mut line = [0u8; 256];
    loop {
        crate::print!("onyx> ");
        let len = crate::input::readline(&mut line);
        let text = core::str::from_utf8(&line[..len]).unwrap_or("");
        shell.exec(text, &mut console).ok();
        crate::sched::yield_now();
    }
}
