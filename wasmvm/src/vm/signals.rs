//! Trap delivery.
//!
//! Generated code carries no unwinding tables, so traps never unwind through
//! JIT frames. Instead the invoke path installs a sigsetjmp sentinel before
//! entering generated code; every trap source funnels into `raise_trap`,
//! which records the trap kind and performs the long-range jump back to the
//! sentinel. CPU-raised traps (#DE from idiv, guard-page faults from linear
//! memory) arrive through a process-wide signal handler that takes the same
//! path.

use std::cell::{Cell, UnsafeCell};
use std::ffi::{c_int, c_void};
use std::sync::OnceLock;

use crate::vm::TrapKind;

// sigsetjmp is a macro in glibc; the real symbol is __sigsetjmp. The buffer
// is opaque to us — 512 aligned bytes covers every libc in use here.
#[repr(C, align(16))]
pub(crate) struct SigJmpBuf([u8; 512]);

impl SigJmpBuf {
    fn new() -> Self {
        Self([0; 512])
    }
}

unsafe extern "C" {
    #[cfg_attr(target_os = "linux", link_name = "__sigsetjmp")]
    fn sigsetjmp(env: *mut SigJmpBuf, savemask: c_int) -> c_int;
    fn siglongjmp(env: *mut SigJmpBuf, val: c_int) -> !;
}

/// One invocation's unwind sentinel. Lives on the invoking thread's stack
/// for the duration of the call into generated code.
pub(crate) struct UnwindPoint {
    buf: UnsafeCell<SigJmpBuf>,
    trap: Cell<TrapKind>,
    message: Cell<Option<String>>,
}

thread_local! {
    static ACTIVE_POINT: Cell<*const UnwindPoint> = const { Cell::new(std::ptr::null()) };
    static ACTIVE_MEMORY_SPAN: Cell<(usize, usize)> = const { Cell::new((0, 0)) };
}

static HANDLERS: OnceLock<Result<(), String>> = OnceLock::new();

/// Install the process-wide SIGFPE/SIGSEGV/SIGBUS handlers once.
pub(crate) fn install_handlers() -> Result<(), String> {
    HANDLERS
        .get_or_init(|| {
            for signo in [libc::SIGFPE, libc::SIGSEGV, libc::SIGBUS] {
                let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
                action.sa_sigaction = trap_signal_handler as usize;
                action.sa_flags = libc::SA_SIGINFO;
                unsafe {
                    libc::sigemptyset(&mut action.sa_mask);
                    if libc::sigaction(signo, &action, std::ptr::null_mut()) != 0 {
                        return Err(format!(
                            "sigaction({signo}) failed: {}",
                            std::io::Error::last_os_error()
                        ));
                    }
                }
            }
            Ok(())
        })
        .clone()
}

/// Run `enter` with a fresh unwind sentinel and the given linear-memory span
/// registered for fault classification. Returns the raw return value, or the
/// trap that unwound the call.
///
/// Nesting is supported (a host function may re-enter generated code); the
/// previous sentinel and span are restored on exit.
pub(crate) unsafe fn call_with_unwind<F>(
    memory_span: (usize, usize),
    enter: F,
) -> Result<u64, (TrapKind, Option<String>)>
where
    F: FnOnce() -> u64,
{
    let point = UnwindPoint {
        buf: UnsafeCell::new(SigJmpBuf::new()),
        trap: Cell::new(TrapKind::Unreachable),
        message: Cell::new(None),
    };
    let previous_point = ACTIVE_POINT.with(|cell| cell.replace(&point));
    let previous_span = ACTIVE_MEMORY_SPAN.with(|cell| cell.replace(memory_span));

    // savemask=1 so siglongjmp restores the signal mask the handler ran with
    let resumed = unsafe { sigsetjmp(point.buf.get(), 1) };
    let result = if resumed == 0 {
        Ok(enter())
    } else {
        Err((point.trap.get(), point.message.take()))
    };

    ACTIVE_POINT.with(|cell| cell.set(previous_point));
    ACTIVE_MEMORY_SPAN.with(|cell| cell.set(previous_span));
    result
}

/// Record the trap and jump to the innermost sentinel. Called from the trap
/// stubs, the host-call dispatcher, and the signal handler; never returns.
///
/// Aborts if no sentinel is installed — that means generated code ran
/// outside `call_with_unwind`, which is a bug, not a recoverable state.
pub(crate) fn raise_trap(kind: TrapKind, message: Option<String>) -> ! {
    let point = ACTIVE_POINT.with(|cell| cell.get());
    if point.is_null() {
        eprintln!("wasm trap '{kind}' raised with no active invocation");
        std::process::abort();
    }
    unsafe {
        (*point).trap.set(kind);
        (*point).message.set(message);
        siglongjmp((*point).buf.get(), 1);
    }
}

// Entry points whose addresses are burned into trap stubs by the writer.
// Each is reached with a 16-byte-aligned stack via the stub preamble.

pub(crate) extern "sysv64" fn on_unreachable() -> ! {
    raise_trap(TrapKind::Unreachable, None)
}

pub(crate) extern "sysv64" fn on_fp_error() -> ! {
    raise_trap(TrapKind::FpError, None)
}

pub(crate) extern "sysv64" fn on_call_indirect_range() -> ! {
    raise_trap(TrapKind::IndirectCallRange, None)
}

pub(crate) extern "sysv64" fn on_call_indirect_type() -> ! {
    raise_trap(TrapKind::IndirectCallType, None)
}

pub(crate) extern "sysv64" fn on_stack_overflow() -> ! {
    raise_trap(TrapKind::StackOverflow, None)
}

unsafe extern "C" fn trap_signal_handler(
    signo: c_int,
    info: *mut libc::siginfo_t,
    _context: *mut c_void,
) {
    let point = ACTIVE_POINT.with(|cell| cell.get());
    if point.is_null() {
        restore_default_and_return(signo);
        return;
    }

    let kind = match signo {
        libc::SIGFPE => TrapKind::IntegerDivide,
        libc::SIGSEGV | libc::SIGBUS => {
            let addr = unsafe { fault_address(info) };
            let (base, len) = ACTIVE_MEMORY_SPAN.with(|cell| cell.get());
            if base != 0 && addr >= base && addr < base + len {
                TrapKind::MemoryOutOfBounds
            } else {
                // a genuine crash, not a guard-page hit
                restore_default_and_return(signo);
                return;
            }
        }
        _ => {
            restore_default_and_return(signo);
            return;
        }
    };

    unsafe {
        (*point).trap.set(kind);
        siglongjmp((*point).buf.get(), 1);
    }
}

/// Reinstalling SIG_DFL and returning re-executes the faulting instruction
/// under the default disposition, producing the normal crash/core path.
fn restore_default_and_return(signo: c_int) {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signo, &action, std::ptr::null_mut());
    }
}

#[cfg(target_os = "linux")]
unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
    unsafe { (*info).si_addr() as usize }
}

#[cfg(not(target_os = "linux"))]
unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
    unsafe { (*info).si_addr as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_trap_unwinds_to_the_sentinel() {
        install_handlers().expect("handlers should install");
        let result = unsafe {
            call_with_unwind((0, 0), || {
                raise_trap(TrapKind::StackOverflow, None);
            })
        };
        assert!(matches!(result, Err((TrapKind::StackOverflow, None))));
    }

    #[test]
    fn sentinels_nest() {
        install_handlers().expect("handlers should install");
        let outer = unsafe {
            call_with_unwind((0, 0), || {
                let inner = unsafe {
                    call_with_unwind((0, 0), || {
                        raise_trap(TrapKind::Unreachable, None);
                    })
                };
                assert!(matches!(inner, Err((TrapKind::Unreachable, _))));
                41 + 1
            })
        };
        assert_eq!(outer.unwrap(), 42);
    }

    #[test]
    fn host_message_travels_with_the_trap() {
        install_handlers().expect("handlers should install");
        let result = unsafe {
            call_with_unwind((0, 0), || {
                raise_trap(TrapKind::HostError, Some("boom".to_string()));
            })
        };
        let (kind, message) = result.unwrap_err();
        assert_eq!(kind, TrapKind::HostError);
        assert_eq!(message.as_deref(), Some("boom"));
    }
}
