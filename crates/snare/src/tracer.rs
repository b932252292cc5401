//! `snare trace`: naive function-entry tracer.
//!
//! Every export of a `.text` section whose first bytes match a known prologue
//! gets a breakpoint at its entry, and each hit prints the function name:
//!
//! - `48 89 5C 24 xx` (`mov [rsp+xx], rbx`): a toggle pair at the entry and
//!   at the next instruction. The entry trap swaps itself for the second one
//!   and re-runs the original instruction; the second trap swaps back. The
//!   function is traced again on its next call without single-stepping.
//! - `FF 25 xx xx xx xx` (`jmp [rip+disp32]`, absolute on x86): an import
//!   thunk. The entry trap stays armed and moves the instruction pointer
//!   straight to the jump's target.
//!
//! This is byte pattern matching, not disassembly; anything else is skipped.

use std::sync::{Arc, Weak};

use snare_core::prelude::*;
use snare_utils::{debug, info, warn};

const SAVE_RBX: [u8; 4] = [0x48, 0x89, 0x5C, 0x24];
const SAVE_RBX_LEN: u64 = 5;
const JMP_INDIRECT: [u8; 2] = [0xFF, 0x25];
const JMP_INDIRECT_LEN: u64 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prologue
{
    SaveRbx,
    /// Jump through the pointer stored at `slot`
    Thunk
    {
        slot: Address
    },
}

fn classify(architecture: Architecture, entry: Address, bytes: &[u8; 8]) -> Option<Prologue>
{
    if bytes.starts_with(&SAVE_RBX) {
        return Some(Prologue::SaveRbx);
    }
    if bytes.starts_with(&JMP_INDIRECT) {
        let operand = [bytes[2], bytes[3], bytes[4], bytes[5]];
        let slot = match architecture {
            Architecture::X86_64 => (entry + JMP_INDIRECT_LEN).displace(i64::from(i32::from_le_bytes(operand))),
            Architecture::X86 => Address::new(u64::from(u32::from_le_bytes(operand))),
        };
        return Some(Prologue::Thunk { slot });
    }
    None
}

/// A traced function
#[derive(Clone)]
struct Site
{
    module: Arc<Module>,
    section: usize,
    name: String,
    entry: Address,
}

impl Site
{
    fn announce(&self)
    {
        println!("{} at {:X}", self.name, self.entry.value());
    }

    fn flush(&self)
    {
        if let Some(section) = self.module.sections().get(self.section) {
            if let Err(err) = section.flush_instruction_cache() {
                warn!(function = %self.name, error = %err, "instruction cache flush failed");
            }
        }
    }
}

/// Install the tracer's handlers. `on_process_created` goes last: the event
/// loop holds the first event until it is registered.
pub fn install(session: &Session)
{
    session.on_exception(|_, event| {
        event.exception_not_handled();
    });
    session.on_breakpoint(|_, event| {
        event.continue_event();
    });
    session.on_module_loaded(|session, event| {
        instrument(session, &event.module);
        event.continue_event();
    });
    session.on_process_created(|session, event| {
        instrument(session, &event.module);
        event.continue_event();
    });
}

fn instrument(session: &Session, module: &Arc<Module>)
{
    let mut armed = 0usize;
    for (index, section) in module.sections().iter().enumerate() {
        if section.name() != ".text" {
            continue;
        }
        for symbol in section.symbols() {
            let mut bytes = [0u8; 8];
            if symbol.read_memory(0, &mut bytes) != bytes.len() {
                continue;
            }
            let Some(prologue) = classify(session.architecture(), symbol.base(), &bytes) else {
                continue;
            };

            let site = Site {
                module: Arc::clone(module),
                section: index,
                name: symbol.demangled_name().unwrap_or_else(|| symbol.name().to_string()),
                entry: symbol.base(),
            };
            let outcome = match prologue {
                Prologue::SaveRbx => arm_toggle_pair(session, site),
                Prologue::Thunk { slot } => arm_thunk(session, site, slot),
            };
            match outcome {
                Ok(()) => armed += 1,
                Err(err) => debug!(symbol = symbol.name(), error = %err, "function not traced"),
            }
        }
    }

    for section in module.sections() {
        if let Err(err) = section.flush_instruction_cache() {
            warn!(%section, error = %err, "instruction cache flush failed");
        }
    }
    info!(%module, armed, "module instrumented");
}

fn arm_toggle_pair(session: &Session, site: Site) -> SnareResult<()>
{
    let entry = session.add_breakpoint(site.entry)?;
    let next = match session.add_breakpoint(site.entry + SAVE_RBX_LEN) {
        Ok(next) => next,
        Err(err) => {
            session.remove_breakpoint(site.entry)?;
            return Err(err);
        }
    };

    let partner = Arc::downgrade(&next);
    let entry_site = site.clone();
    entry.on_hit(move |_, hit| {
        entry_site.announce();
        swap(hit.breakpoint.as_ref(), &partner);
        entry_site.flush();
        rewind(&hit, hit.address);
        hit.continue_event();
    });

    let partner = Arc::downgrade(&entry);
    next.on_hit(move |_, hit| {
        swap(hit.breakpoint.as_ref(), &partner);
        site.flush();
        rewind(&hit, hit.address);
        hit.continue_event();
    });

    entry.set_enabled(true)
}

fn arm_thunk(session: &Session, site: Site, slot: Address) -> SnareResult<()>
{
    let entry = session.add_breakpoint(site.entry)?;
    entry.on_hit(move |session, hit| {
        site.announce();
        // The slot is bound by the loader after the image is mapped: read it now.
        match read_pointer(session, slot) {
            Some(target) => rewind(&hit, target),
            None => {
                warn!(function = %site.name, %slot, "thunk slot unreadable, tracing stopped");
                if let Some(breakpoint) = &hit.breakpoint {
                    toggle(breakpoint, false);
                }
                site.flush();
                rewind(&hit, hit.address);
            }
        }
        hit.continue_event();
    });
    entry.set_enabled(true)
}

/// Disable the breakpoint that was hit and enable its partner.
fn swap(hit: Option<&Arc<Breakpoint>>, partner: &Weak<Breakpoint>)
{
    if let Some(hit) = hit {
        toggle(hit, false);
    }
    if let Some(partner) = partner.upgrade() {
        toggle(&partner, true);
    }
}

fn toggle(breakpoint: &Breakpoint, enabled: bool)
{
    if let Err(err) = breakpoint.set_enabled(enabled) {
        warn!(%breakpoint, enabled, error = %err, "breakpoint toggle failed");
    }
}

fn rewind(hit: &BreakpointEvent, to: Address)
{
    if let Some(thread) = hit.thread() {
        if let Err(err) = thread.context().set_instruction_pointer(to) {
            warn!(%thread, error = %err, "cannot move instruction pointer");
        }
    }
}

fn read_pointer(session: &Session, slot: Address) -> Option<Address>
{
    let size = session.architecture().pointer_size();
    let mut raw = [0u8; 8];
    (session.read_memory(slot, &mut raw[..size]) == size).then(|| Address::new(u64::from_le_bytes(raw)))
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_classify_save_rbx_prologue()
    {
        let bytes = [0x48, 0x89, 0x5C, 0x24, 0x08, 0x57, 0x48, 0x83];
        assert_eq!(
            classify(Architecture::X86_64, Address::new(0x1000), &bytes),
            Some(Prologue::SaveRbx)
        );
    }

    #[test]
    fn test_classify_rip_relative_thunk()
    {
        // jmp [rip+0x10] at 0x1000 reads the pointer at 0x1016.
        let bytes = [0xFF, 0x25, 0x10, 0x00, 0x00, 0x00, 0xCC, 0xCC];
        assert_eq!(
            classify(Architecture::X86_64, Address::new(0x1000), &bytes),
            Some(Prologue::Thunk {
                slot: Address::new(0x1016)
            })
        );

        let backwards = [0xFF, 0x25, 0xF0, 0xFF, 0xFF, 0xFF, 0xCC, 0xCC];
        assert_eq!(
            classify(Architecture::X86_64, Address::new(0x1000), &backwards),
            Some(Prologue::Thunk {
                slot: Address::new(0x0FF6)
            })
        );
    }

    #[test]
    fn test_classify_absolute_thunk_on_x86()
    {
        let bytes = [0xFF, 0x25, 0x00, 0x20, 0x40, 0x00, 0xCC, 0xCC];
        assert_eq!(
            classify(Architecture::X86, Address::new(0x401000), &bytes),
            Some(Prologue::Thunk {
                slot: Address::new(0x402000)
            })
        );
    }

    #[test]
    fn test_classify_ignores_other_code()
    {
        let bytes = [0x55, 0x48, 0x89, 0xE5, 0x90, 0x90, 0x90, 0x90];
        assert_eq!(classify(Architecture::X86_64, Address::new(0x1000), &bytes), None);
    }
}
