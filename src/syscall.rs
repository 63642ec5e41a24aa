//! The newlib-style syscall dispatcher invoked by `ecall`, per
//! `spec.md` §4.6.
//!
//! The syscall number arrives in `a7`, arguments in `a0..a5`, and the
//! return value is written back to `a0`. A syscall can fail in two
//! distinct ways: a *host* I/O error (the open/read/write call itself
//! failed), which is swallowed and reported to the guest as `-1` in
//! `a0` exactly as a real kernel would; or the dispatcher receiving a
//! syscall number it has no host implementation for, which is fatal
//! and surfaces as [`UnimplementedSyscall`] one level up.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::time::Instant;

use crate::memory::Memory;

const SYS_CLOSE: u32 = 57;
const SYS_LSEEK: u32 = 62;
const SYS_READ: u32 = 63;
const SYS_WRITE: u32 = 64;
const SYS_FSTAT: u32 = 80;
const SYS_EXIT: u32 = 93;
const SYS_BRK: u32 = 214;
const SYS_OPEN: u32 = 1024;
const SYS_MKDIR: u32 = 1030;

const SYS_GFX_INIT: u32 = 0xbeef0;
const SYS_GFX_DRAW: u32 = 0xbeef1;
const SYS_GFX_GETTICKS: u32 = 0xbeef2;
const SYS_GFX_SLEEP: u32 = 0xbeef3;

/// First descriptor number handed out by `open`. 0..=2 are reserved
/// for stdin/stdout/stderr, which `close`/`lseek`/`read`/`write` each
/// special-case and never look up in the fd table.
const FIRST_GUEST_FD: u32 = 3;

/// A surface a guest can draw a framebuffer to. The only fully
/// specified behaviour in `spec.md` §4.6 is the syscall ID table and
/// the fact that drawing is gated behind the `graphics` feature; what
/// the surface actually does with the pixels is out of scope, so
/// every build carries at least the no-op implementation below.
pub trait FrameSink {
    fn draw(&mut self, width: u32, height: u32, pixels: &[u8]);
}

/// A [`FrameSink`] that discards every frame. The default when no
/// other sink is wired in, and the only one available when the
/// `graphics` feature is off.
#[derive(Debug, Default)]
pub struct NullFrameSink;

impl FrameSink for NullFrameSink {
    fn draw(&mut self, _width: u32, _height: u32, _pixels: &[u8]) {}
}

/// Outcome of dispatching one syscall: either a value to place in
/// `a0`, or a fatal condition the hart must stop on.
#[derive(Debug)]
pub enum SyscallOutcome {
    Return(u32),
    Exit(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyscallArgs {
    pub number: u32,
    pub a0: u32,
    pub a1: u32,
    pub a2: u32,
    pub a3: u32,
    pub a4: u32,
    pub a5: u32,
}

/// Bookkeeping a dispatcher needs across calls: open files (keyed by
/// a guest-visible descriptor number the dispatcher hands out itself,
/// since the library never touches raw OS file descriptors) and the
/// wall-clock origin for `getticks`.
pub struct HostState {
    open_files: HashMap<u32, File>,
    next_fd: u32,
    start: Instant,
    frame_sink: Box<dyn FrameSink>,
}

impl std::fmt::Debug for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostState")
            .field("open_fds", &self.open_files.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            open_files: HashMap::new(),
            next_fd: FIRST_GUEST_FD,
            start: Instant::now(),
            frame_sink: Box::new(NullFrameSink),
        }
    }
}

impl HostState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frame_sink(frame_sink: Box<dyn FrameSink>) -> Self {
        Self {
            frame_sink,
            ..Self::default()
        }
    }
}

fn read_c_string(memory: &mut Memory, addr: i64) -> Result<String, crate::memory::MemoryError> {
    let mut bytes = Vec::new();
    let mut addr = addr;
    for _ in 0..256 {
        let byte = memory.read(addr, 1)?[0];
        if byte == 0 {
            break;
        }
        bytes.push(byte);
        addr += 1;
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Dispatch one `ecall`. Graphics IDs above `SYS_GFX_INIT` are
/// recognised whether or not the `graphics` feature is enabled;
/// without it, `draw` is a no-op and `init` always reports success,
/// so guest code written against the richer host keeps running.
pub fn dispatch(
    args: SyscallArgs,
    memory: &mut Memory,
    host: &mut HostState,
) -> Result<SyscallOutcome, UnimplementedSyscall> {
    match args.number {
        SYS_CLOSE => {
            let fd = args.a0;
            if fd <= 2 {
                // stdin/stdout/stderr are never tracked in open_files;
                // closing them is ignored, per spec.
                Ok(SyscallOutcome::Return(0))
            } else if host.open_files.remove(&fd).is_some() {
                Ok(SyscallOutcome::Return(0))
            } else {
                Ok(SyscallOutcome::Return(u32::MAX))
            }
        }
        SYS_LSEEK => {
            let fd = args.a0;
            if fd <= 2 {
                return Ok(SyscallOutcome::Return(0));
            }
            let offset = args.a1 as i32 as i64;
            let whence = match args.a2 {
                0 => SeekFrom::Start(offset as u64),
                1 => SeekFrom::Current(offset),
                2 => SeekFrom::End(offset),
                _ => return Ok(SyscallOutcome::Return(u32::MAX)),
            };
            let result = match host.open_files.get_mut(&fd) {
                Some(file) => file.seek(whence).map(|pos| pos as u32).unwrap_or(u32::MAX),
                None => u32::MAX,
            };
            Ok(SyscallOutcome::Return(result))
        }
        SYS_READ => {
            let fd = args.a0;
            let buf_addr = args.a1 as i64;
            let count = args.a2 as usize;
            let mut buf = vec![0u8; count];
            let read_result = if fd == 0 {
                Some(std::io::stdin().read(&mut buf))
            } else {
                host.open_files.get_mut(&fd).map(|file| file.read(&mut buf))
            };
            let outcome = match read_result {
                Some(Ok(n)) => match memory.write(buf_addr, &buf[..n]) {
                    Ok(()) => n as u32,
                    Err(_) => u32::MAX,
                },
                Some(Err(_)) | None => u32::MAX,
            };
            Ok(SyscallOutcome::Return(outcome))
        }
        SYS_WRITE => {
            let fd = args.a0;
            let buf_addr = args.a1 as i64;
            let count = args.a2;
            let outcome = match memory.read(buf_addr, count) {
                Ok(bytes) => {
                    if fd == 1 {
                        std::io::stdout().write_all(&bytes).ok();
                        bytes.len() as u32
                    } else if fd == 2 {
                        std::io::stderr().write_all(&bytes).ok();
                        bytes.len() as u32
                    } else {
                        match host.open_files.get_mut(&fd) {
                            Some(file) => file
                                .write_all(&bytes)
                                .map(|()| bytes.len() as u32)
                                .unwrap_or(u32::MAX),
                            None => u32::MAX,
                        }
                    }
                }
                Err(_) => u32::MAX,
            };
            Ok(SyscallOutcome::Return(outcome))
        }
        SYS_FSTAT => Ok(SyscallOutcome::Return(u32::MAX)),
        SYS_EXIT => Ok(SyscallOutcome::Exit(args.a0 as i32)),
        SYS_BRK => Ok(SyscallOutcome::Return(memory.set_brk(args.a0))),
        SYS_OPEN => {
            let path = match read_c_string(memory, args.a1 as i64) {
                Ok(path) => path,
                Err(_) => return Ok(SyscallOutcome::Return(u32::MAX)),
            };
            let flags = args.a2;
            let mut options = OpenOptions::new();
            // Mirrors the flag handling in the original guest runtime:
            // only the read/write/create bits are consulted.
            match flags & 0x3 {
                0 => {
                    options.read(true);
                }
                1 => {
                    options.write(true);
                }
                _ => {
                    options.read(true).write(true);
                }
            }
            if flags & 0x200 != 0 {
                options.create(true);
            }
            match options.open(&path) {
                Ok(file) => {
                    let fd = host.next_fd;
                    host.next_fd += 1;
                    host.open_files.insert(fd, file);
                    Ok(SyscallOutcome::Return(fd))
                }
                Err(_) => Ok(SyscallOutcome::Return(u32::MAX)),
            }
        }
        SYS_MKDIR => {
            let path = match read_c_string(memory, args.a0 as i64) {
                Ok(path) => path,
                Err(_) => return Ok(SyscallOutcome::Return(u32::MAX)),
            };
            match std::fs::create_dir(path) {
                Ok(()) => Ok(SyscallOutcome::Return(0)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    Ok(SyscallOutcome::Return(0))
                }
                Err(_) => Ok(SyscallOutcome::Return(u32::MAX)),
            }
        }
        SYS_GFX_INIT => Ok(SyscallOutcome::Return(0)),
        SYS_GFX_DRAW => dispatch_graphics_draw(args, memory, host),
        SYS_GFX_GETTICKS => {
            Ok(SyscallOutcome::Return(host.start.elapsed().as_millis() as u32))
        }
        SYS_GFX_SLEEP => {
            std::thread::sleep(std::time::Duration::from_millis(args.a0 as u64));
            Ok(SyscallOutcome::Return(0))
        }
        other => Err(UnimplementedSyscall(other)),
    }
}

#[cfg(feature = "graphics")]
fn dispatch_graphics_draw(
    args: SyscallArgs,
    memory: &mut Memory,
    host: &mut HostState,
) -> Result<SyscallOutcome, UnimplementedSyscall> {
    let width = args.a1;
    let height = args.a2;
    let len = (width as usize) * (height as usize) * 4;
    match memory.read(args.a0 as i64, len as u32) {
        Ok(pixels) => {
            host.frame_sink.draw(width, height, &pixels);
            Ok(SyscallOutcome::Return(0))
        }
        Err(_) => Ok(SyscallOutcome::Return(u32::MAX)),
    }
}

#[cfg(not(feature = "graphics"))]
fn dispatch_graphics_draw(
    _args: SyscallArgs,
    _memory: &mut Memory,
    _host: &mut HostState,
) -> Result<SyscallOutcome, UnimplementedSyscall> {
    Ok(SyscallOutcome::Return(0))
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("no host implementation for syscall number {0}")]
pub struct UnimplementedSyscall(pub u32);
