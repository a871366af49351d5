//! Frame-by-frame stack unwinder
//!
//! Rebuilds the call chain from a captured register context. Two strategies
//! sit behind the same interface, selected once per session by capability:
//! **OS-assisted** when the symbol service came up for the target (it knows
//! unwind tables), else the **manual frame-pointer chain** walk that assumes
//! the standard saved-frame-pointer calling convention.
//!
//! Unwinding is strictly sequential: every step depends on words read from
//! the previous frame, so frames come out of a lazy iterator, each one fully
//! resolved through the symbol cascade before the next is attempted. The
//! walk stops on a failed required read or a zero frame pointer, and the
//! worst case is a truncated frame sequence, never a hard error to the
//! embedding tool.

use crate::domain::types::{ProcessHandle, WordWidth};
use crate::memory::ProcessMemory;
use crate::resolve::{Resolver, SymbolInfo};
use log::{debug, warn};

/// Registers captured at the point of crash or suspension.
#[derive(Debug, Clone, Copy)]
pub struct RegisterContext {
    /// Program counter.
    pub pc: u64,
    /// Stack pointer.
    pub sp: u64,
    /// Frame pointer.
    pub fp: u64,
    pub width: WordWidth,
}

/// One raw stack frame, before symbol resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RawFrame {
    pub pc: u64,
    pub ret: u64,
    pub fp: u64,
    pub sp: u64,
    /// Up to four parameter words read from the frame, best effort.
    pub params: [u64; 4],
}

/// A resolved stack frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub pc: u64,
    pub ret: u64,
    pub fp: u64,
    pub sp: u64,
    pub params: [u64; 4],
    /// Present when the cascade found a symbol for `pc`; a frame with no
    /// resolvable module or symbol is still reported.
    pub symbol: Option<SymbolInfo>,
}

#[derive(Debug, Clone, Copy)]
pub struct UnwindOptions {
    /// Hard cap on produced frames; stops runaway walks through cyclic or
    /// corrupt frame chains.
    pub max_frames: usize,
}

impl Default for UnwindOptions {
    fn default() -> Self {
        Self { max_frames: 256 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnwindMode {
    Assisted,
    Manual,
}

/// Stack unwinder for one target process.
///
/// The borrow of the resolver (`'s`) is kept apart from the resolver's own
/// collaborator lifetime (`'a`) so a session can borrow a locally scoped
/// resolver.
pub struct Unwinder<'s, 'a> {
    resolver: &'s Resolver<'a>,
    memory: &'s dyn ProcessMemory,
    options: UnwindOptions,
}

impl<'s, 'a> Unwinder<'s, 'a> {
    pub fn new(resolver: &'s Resolver<'a>, memory: &'s dyn ProcessMemory) -> Self {
        Self { resolver, memory, options: UnwindOptions::default() }
    }

    #[must_use]
    pub fn with_options(mut self, options: UnwindOptions) -> Self {
        self.options = options;
        self
    }

    /// Start an unwind session from `ctx`.
    ///
    /// The symbol service is brought up here (OS-assisted stepping needs it,
    /// and the cascade reuses it opportunistically) and cleaned up when the
    /// returned session is dropped, on every exit path. Each call re-walks
    /// from the context; sessions are not restartable.
    pub fn unwind(&self, target: ProcessHandle, ctx: &RegisterContext) -> UnwindSession<'s, 'a> {
        let mode = if self.resolver.service_ready(target) {
            UnwindMode::Assisted
        } else {
            UnwindMode::Manual
        };
        debug!("unwinding {target} from pc={:#x} fp={:#x} ({mode:?})", ctx.pc, ctx.fp);
        UnwindSession {
            resolver: self.resolver,
            memory: self.memory,
            options: self.options,
            target,
            ctx: *ctx,
            mode,
            last: None,
            produced: 0,
            done: false,
        }
    }
}

/// Lazy, finite iterator of resolved frames, innermost first.
pub struct UnwindSession<'s, 'a> {
    resolver: &'s Resolver<'a>,
    memory: &'s dyn ProcessMemory,
    options: UnwindOptions,
    target: ProcessHandle,
    ctx: RegisterContext,
    mode: UnwindMode,
    last: Option<RawFrame>,
    produced: usize,
    done: bool,
}

impl UnwindSession<'_, '_> {
    fn read_word(&self, addr: u64) -> Option<u64> {
        self.memory.read_word(addr, self.ctx.width).ok()
    }

    /// Best-effort parameter words from two words above `fp`. A failed read
    /// (or a slot address past the end of the address space) leaves the
    /// remainder zero and never aborts the frame.
    fn read_params(&self, fp: u64) -> [u64; 4] {
        let w = self.ctx.width.bytes();
        let mut params = [0u64; 4];
        for (i, slot) in params.iter_mut().enumerate() {
            let Some(addr) = fp.checked_add((2 + i as u64) * w) else { break };
            match self.read_word(addr) {
                Some(value) => *slot = value,
                None => break,
            }
        }
        params
    }

    /// Initial frame, straight from the captured registers. The first
    /// return address sits one word above the frame pointer.
    fn seed(&self) -> Option<RawFrame> {
        if self.ctx.fp == 0 {
            return None;
        }
        let w = self.ctx.width.bytes();
        let ret = self.read_word(self.ctx.fp.checked_add(w)?)?;
        Some(RawFrame {
            pc: self.ctx.pc,
            ret,
            fp: self.ctx.fp,
            sp: self.ctx.sp,
            params: self.read_params(self.ctx.fp),
        })
    }

    /// Manual step: the saved frame pointer lives at the current frame
    /// pointer, the caller's return address one word above it. Either
    /// required read failing ends the walk, as does a saved frame pointer so
    /// close to the end of the address space that the chain cannot continue.
    fn step_manual(&self, prev: &RawFrame) -> Option<RawFrame> {
        let w = self.ctx.width.bytes();
        let fp = self.read_word(prev.fp)?;
        if fp == 0 {
            // Chain terminator; surfaced so next() applies the sanity stop.
            return Some(RawFrame { pc: prev.ret, fp: 0, ..RawFrame::default() });
        }
        let ret = self.read_word(fp.checked_add(w)?)?;
        Some(RawFrame {
            pc: prev.ret,
            ret,
            fp,
            sp: prev.fp.checked_add(2 * w)?,
            params: self.read_params(fp),
        })
    }

    fn step_assisted(&self, prev: &RawFrame) -> Option<RawFrame> {
        self.resolver.unwind_step(self.target, self.memory, prev)
    }
}

impl Iterator for UnwindSession<'_, '_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.done {
            return None;
        }
        if self.produced >= self.options.max_frames {
            warn!("unwind stopped at {} frames", self.produced);
            self.done = true;
            return None;
        }

        let raw = match self.last {
            None => self.seed(),
            Some(prev) => match self.mode {
                UnwindMode::Manual => self.step_manual(&prev),
                UnwindMode::Assisted => self.step_assisted(&prev),
            },
        };
        let Some(raw) = raw else {
            self.done = true;
            return None;
        };
        // Sanity bound: a zero frame pointer means the chain ran into noise.
        if raw.fp == 0 {
            self.done = true;
            return None;
        }
        self.last = Some(raw);
        self.produced += 1;
        debug!(
            "frame {:>3}: pc={:#010x} ret={:#010x} fp={:#010x} sp={:#010x} params={:x?}",
            self.produced, raw.pc, raw.ret, raw.fp, raw.sp, raw.params
        );

        let symbol = match self.resolver.resolve(self.target, raw.pc) {
            Ok(symbol) => symbol,
            Err(e) => {
                // Target memory went away under us; keep this frame and the
                // ones before it, stop after.
                warn!("resolution aborted at {:#x}: {e}", raw.pc);
                self.done = true;
                None
            }
        };
        Some(Frame {
            pc: raw.pc,
            ret: raw.ret,
            fp: raw.fp,
            sp: raw.sp,
            params: raw.params,
            symbol,
        })
    }
}

impl Drop for UnwindSession<'_, '_> {
    fn drop(&mut self) {
        self.resolver.end_session(self.target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BufferMemory;
    use crate::modules::ModuleMap;
    use crate::resolve::exports::fixtures::pe_image_with_exports;
    use crate::resolve::SymbolSource;
    use crate::service::mock::MockService;

    const TARGET: ProcessHandle = ProcessHandle(1);
    const W: u64 = 8;

    fn put_word(mem: &mut Vec<u8>, base: u64, addr: u64, value: u64) {
        let o = (addr - base) as usize;
        mem[o..o + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Stack with a three-frame chain terminated by a zero frame pointer.
    fn chain_of_three() -> (BufferMemory, RegisterContext) {
        let base = 0x1000u64;
        let mut stack = vec![0u8; 0x200];
        let (f0, f1, f2) = (0x1000, 0x1040, 0x1080);

        put_word(&mut stack, base, f0, f1);
        put_word(&mut stack, base, f0 + W, 0x5001);
        put_word(&mut stack, base, f0 + 2 * W, 0xa0);
        put_word(&mut stack, base, f0 + 3 * W, 0xa1);
        put_word(&mut stack, base, f1, f2);
        put_word(&mut stack, base, f1 + W, 0x5002);
        put_word(&mut stack, base, f2, 0);
        put_word(&mut stack, base, f2 + W, 0x5003);

        let mut memory = BufferMemory::new();
        memory.add_region(base, stack);
        let ctx = RegisterContext { pc: 0x9000, sp: 0xff0, fp: f0, width: WordWidth::Eight };
        (memory, ctx)
    }

    #[test]
    fn test_manual_chain_produces_frames_in_pc_order() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (memory, ctx) = chain_of_three();
        let tracker = ModuleMap::new();
        let resolver = Resolver::new(&tracker, &memory, None);
        let unwinder = Unwinder::new(&resolver, &memory);

        let frames: Vec<Frame> = unwinder.unwind(TARGET, &ctx).collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].pc, 0x9000);
        assert_eq!(frames[1].pc, 0x5001);
        assert_eq!(frames[2].pc, 0x5002);
        assert_eq!(frames[2].ret, 0x5003);
        // Unresolvable pcs still yield frames, just without symbols.
        assert!(frames.iter().all(|f| f.symbol.is_none()));
        // Innermost frame's parameter words were readable.
        assert_eq!(frames[0].params[0], 0xa0);
        assert_eq!(frames[0].params[1], 0xa1);
    }

    #[test]
    fn test_manual_chain_with_32bit_words() {
        let base = 0x1000u64;
        let mut stack = vec![0u8; 0x40];
        // Single frame: saved fp is zero, return address one 4-byte word up.
        stack[4..8].copy_from_slice(&0xcafe_u32.to_le_bytes());
        let mut memory = BufferMemory::new();
        memory.add_region(base, stack);

        let tracker = ModuleMap::new();
        let resolver = Resolver::new(&tracker, &memory, None);
        let unwinder = Unwinder::new(&resolver, &memory);

        let ctx = RegisterContext { pc: 0x9000, sp: 0xff0, fp: 0x1000, width: WordWidth::Four };
        let frames: Vec<Frame> = unwinder.unwind(TARGET, &ctx).collect();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].ret, 0xcafe);
    }

    #[test]
    fn test_zero_frame_pointer_context_yields_no_frames() {
        let memory = BufferMemory::new();
        let tracker = ModuleMap::new();
        let resolver = Resolver::new(&tracker, &memory, None);
        let unwinder = Unwinder::new(&resolver, &memory);

        let ctx = RegisterContext { pc: 0x9000, sp: 0xff0, fp: 0, width: WordWidth::Eight };
        assert_eq!(unwinder.unwind(TARGET, &ctx).count(), 0);
    }

    #[test]
    fn test_unreadable_stack_yields_no_frames() {
        let memory = BufferMemory::new();
        let tracker = ModuleMap::new();
        let resolver = Resolver::new(&tracker, &memory, None);
        let unwinder = Unwinder::new(&resolver, &memory);

        let ctx = RegisterContext { pc: 0x9000, sp: 0xff0, fp: 0x1000, width: WordWidth::Eight };
        assert_eq!(unwinder.unwind(TARGET, &ctx).count(), 0);
    }

    #[test]
    fn test_cyclic_chain_is_bounded_by_max_frames() {
        let base = 0x1000u64;
        let mut stack = vec![0u8; 0x40];
        put_word(&mut stack, base, 0x1000, 0x1000); // frame points at itself
        put_word(&mut stack, base, 0x1008, 0x5001);
        let mut memory = BufferMemory::new();
        memory.add_region(base, stack);

        let tracker = ModuleMap::new();
        let resolver = Resolver::new(&tracker, &memory, None);
        let unwinder =
            Unwinder::new(&resolver, &memory).with_options(UnwindOptions { max_frames: 8 });

        let ctx = RegisterContext { pc: 0x9000, sp: 0xff0, fp: 0x1000, width: WordWidth::Eight };
        assert_eq!(unwinder.unwind(TARGET, &ctx).count(), 8);
    }

    #[test]
    fn test_corrupt_saved_frame_pointer_truncates_the_walk() {
        let base = 0x1000u64;
        let mut stack = vec![0u8; 0x40];
        // Saved fp at the very end of the address space; the next frame's
        // return-address slot would overflow.
        put_word(&mut stack, base, 0x1000, u64::MAX);
        put_word(&mut stack, base, 0x1008, 0x5001);
        let mut memory = BufferMemory::new();
        memory.add_region(base, stack);

        let tracker = ModuleMap::new();
        let resolver = Resolver::new(&tracker, &memory, None);
        let unwinder = Unwinder::new(&resolver, &memory);

        let ctx = RegisterContext { pc: 0x9000, sp: 0xff0, fp: 0x1000, width: WordWidth::Eight };
        let frames: Vec<Frame> = unwinder.unwind(TARGET, &ctx).collect();
        // The seed frame survives; the corrupt step ends the walk.
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].ret, 0x5001);

        // A context already pointing at the edge yields nothing at all.
        let ctx = RegisterContext { pc: 0x9000, sp: 0xff0, fp: u64::MAX, width: WordWidth::Eight };
        assert_eq!(unwinder.unwind(TARGET, &ctx).count(), 0);
    }

    #[test]
    fn test_frames_carry_resolved_symbols() {
        let image_base = 0x1000_0000;
        let (mut memory, module) =
            pe_image_with_exports(image_base, &[(0x1000, "DllEntry")], false);

        // One-frame stack whose pc lands a few bytes into the export.
        let stack_base = 0x2000u64;
        let mut stack = vec![0u8; 0x40];
        put_word(&mut stack, stack_base, 0x2000, 0);
        put_word(&mut stack, stack_base, 0x2008, 0x5001);
        memory.add_region(stack_base, stack);

        let mut tracker = ModuleMap::new();
        tracker.insert(TARGET, module, "/nonexistent/lib.dll");
        let resolver = Resolver::new(&tracker, &memory, None);
        let unwinder = Unwinder::new(&resolver, &memory);

        let ctx = RegisterContext {
            pc: image_base + 0x1005,
            sp: 0xff0,
            fp: 0x2000,
            width: WordWidth::Eight,
        };
        let frames: Vec<Frame> = unwinder.unwind(TARGET, &ctx).collect();
        assert_eq!(frames.len(), 1);
        let symbol = frames[0].symbol.as_ref().unwrap();
        assert_eq!(symbol.name, "DllEntry");
        assert_eq!(symbol.displacement, 5);
        assert_eq!(symbol.source, SymbolSource::Export);
    }

    #[test]
    fn test_assisted_mode_uses_service_steps_and_cleans_up() {
        let (memory, ctx) = chain_of_three();
        let tracker = ModuleMap::new();

        let service = MockService::default();
        service.steps.borrow_mut().push(RawFrame {
            pc: 0x5001,
            ret: 0x5002,
            fp: 0x1040,
            sp: 0x1010,
            params: [0; 4],
        });
        service.steps.borrow_mut().push(RawFrame {
            pc: 0x5002,
            ret: 0,
            fp: 0x1080,
            sp: 0x1050,
            params: [0; 4],
        });

        let resolver = Resolver::new(&tracker, &memory, Some(&service));
        let unwinder = Unwinder::new(&resolver, &memory);

        let frames: Vec<Frame> = unwinder.unwind(TARGET, &ctx).collect();
        // Seed frame plus the two scripted steps.
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].pc, 0x5001);
        assert_eq!(frames[2].pc, 0x5002);

        // Session end ran the cleanup exactly once.
        assert_eq!(*service.init_count.borrow(), 1);
        assert_eq!(*service.cleanup_count.borrow(), 1);
    }

    #[test]
    fn test_early_drop_still_cleans_up_service() {
        let (memory, ctx) = chain_of_three();
        let tracker = ModuleMap::new();
        let service = MockService::default();
        let resolver = Resolver::new(&tracker, &memory, Some(&service));
        let unwinder = Unwinder::new(&resolver, &memory);

        {
            let mut session = unwinder.unwind(TARGET, &ctx);
            let _ = session.next();
            // Dropped mid-walk.
        }
        assert_eq!(*service.cleanup_count.borrow(), 1);

        // A fresh session initializes again.
        let _ = unwinder.unwind(TARGET, &ctx).count();
        assert_eq!(*service.init_count.borrow(), 2);
        assert_eq!(*service.cleanup_count.borrow(), 2);
    }
}
