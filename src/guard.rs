//! Stack and recursion safety nets around prepare.
//!
//! The host runs the engine on threads with small stacks. Refusing work
//! with a clean error beats faulting on the guard page somewhere below the
//! backend parser, so every prepare first measures what is left.

use std::cell::Cell;

use crate::config::Config;
use crate::error::EngineError;

thread_local! {
    static PREPARE_DEPTH: Cell<u32> = const { Cell::new(0) };
    // Lowest usable stack address of this thread. 0 = not probed yet,
    // 1 = probe failed, measurement unavailable.
    static STACK_LOW: Cell<usize> = const { Cell::new(0) };
}

/// Holds the recursion slot for the duration of one prepare.
#[derive(Debug)]
pub struct RecursionGuard {
    _private: (),
}

/// Claim a recursion slot, failing once the configured depth is exceeded.
pub fn enter_prepare(limit: u32) -> Result<RecursionGuard, EngineError> {
    let depth = PREPARE_DEPTH.with(|d| {
        let v = d.get() + 1;
        d.set(v);
        v
    });
    if depth > limit {
        PREPARE_DEPTH.with(|d| d.set(d.get() - 1));
        return Err(EngineError::RecursionLimit { depth });
    }
    Ok(RecursionGuard { _private: () })
}

impl Drop for RecursionGuard {
    fn drop(&mut self) {
        PREPARE_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

#[cfg(target_os = "linux")]
fn thread_stack_low() -> usize {
    STACK_LOW.with(|c| {
        let cached = c.get();
        if cached != 0 {
            return cached;
        }
        let mut low = 1usize;
        unsafe {
            let mut attr: libc::pthread_attr_t = std::mem::zeroed();
            if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) == 0 {
                let mut addr: *mut libc::c_void = std::ptr::null_mut();
                let mut size: libc::size_t = 0;
                if libc::pthread_attr_getstack(&attr, &mut addr, &mut size) == 0
                    && !addr.is_null()
                {
                    low = addr as usize;
                }
                libc::pthread_attr_destroy(&mut attr);
            }
        }
        c.set(low);
        low
    })
}

/// Bytes of stack left below the current frame, if the platform can tell.
pub fn remaining_stack() -> Option<usize> {
    #[cfg(target_os = "linux")]
    {
        let low = thread_stack_low();
        if low <= 1 {
            return None;
        }
        let frame = 0u8;
        let sp = &frame as *const u8 as usize;
        Some(sp.saturating_sub(low))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackBand {
    /// Full processing.
    Full,
    /// Skip the heavy rewriter passes, still execute.
    Degraded,
    /// Refuse to prepare.
    Critical,
}

/// Classify the given remaining-stack measurement against the configured
/// bands. `None` (no measurement available) counts as full headroom.
pub fn classify(cfg: &Config, remaining: Option<usize>) -> StackBand {
    let Some(remaining) = remaining else {
        return StackBand::Full;
    };
    let kb = remaining / 1024;
    if kb < cfg.stack_hard_kb {
        StackBand::Critical
    } else if kb < cfg.stack_soft_kb {
        StackBand::Degraded
    } else {
        StackBand::Full
    }
}

/// On-deck-class queries trigger expensive native work in the host after
/// the result returns; they degrade to an empty result while ordinary
/// statements still run, so the check sits above the hard band.
pub fn on_deck_needs_empty_result(cfg: &Config, remaining: Option<usize>) -> bool {
    match remaining {
        Some(remaining) => remaining / 1024 < cfg.stack_hard_kb + cfg.stack_on_deck_extra_kb,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::from_env()
    }

    #[test]
    fn recursion_guard_counts_and_releases() {
        let g1 = enter_prepare(2).unwrap();
        let g2 = enter_prepare(2).unwrap();
        assert!(enter_prepare(2).is_err());
        drop(g2);
        let g3 = enter_prepare(2).unwrap();
        drop(g3);
        drop(g1);
    }

    #[test]
    fn recursion_error_maps_to_nomem() {
        let _g1 = enter_prepare(1).unwrap();
        let err = enter_prepare(1).unwrap_err();
        assert_eq!(err.code(), sqlite_interpose::abi::SQLITE_NOMEM);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn stack_measurement_is_sane() {
        let remaining = remaining_stack().expect("linux can measure the stack");
        // The test thread has a multi-megabyte stack and we are near its top.
        assert!(remaining > 64 * 1024);
    }

    #[test]
    fn bands_order() {
        let cfg = test_config();
        assert_eq!(classify(&cfg, None), StackBand::Full);
        assert_eq!(classify(&cfg, Some(10 * 1024 * 1024)), StackBand::Full);
        assert_eq!(
            classify(&cfg, Some((cfg.stack_soft_kb - 1) * 1024)),
            StackBand::Degraded
        );
        assert_eq!(
            classify(&cfg, Some((cfg.stack_hard_kb - 1) * 1024)),
            StackBand::Critical
        );
    }

    #[test]
    fn on_deck_threshold_sits_above_hard_band() {
        let cfg = test_config();
        let just_above_hard = (cfg.stack_hard_kb + 50) * 1024;
        assert_eq!(classify(&cfg, Some(just_above_hard)), StackBand::Degraded);
        assert!(on_deck_needs_empty_result(&cfg, Some(just_above_hard)));
        let plenty = (cfg.stack_hard_kb + cfg.stack_on_deck_extra_kb + 1) * 1024;
        assert!(!on_deck_needs_empty_result(&cfg, Some(plenty)));
    }
}
