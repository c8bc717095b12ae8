//! Nested-virtualization intercept surface.
//!
//! The dispatcher consults this hook after classifying an event and before
//! committing to normal delivery; the nested-virtualization subsystem may
//! claim the event as a VM exit instead. That subsystem also owns the
//! NMI-blocking decision, which the dispatcher queries independently before
//! delivering an external NMI.

use crate::event::EventFlags;

/// Verdict of the intercept check for one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptDisposition {
    /// Deliver normally.
    NotIntercepted,
    /// Abandon delivery; the event becomes a VM exit described by these
    /// values (their encoding is owned by the nested-virtualization layer).
    Redirected {
        exit_code: u64,
        exit_info1: u64,
        exit_info2: u64,
    },
}

pub trait InterceptHook {
    fn check_event_intercept(
        &mut self,
        vector: u8,
        flags: EventFlags,
        error_code: u32,
        cr2: u64,
    ) -> InterceptDisposition {
        let _ = (vector, flags, error_code, cr2);
        InterceptDisposition::NotIntercepted
    }

    /// Whether NMI delivery is currently blocked (e.g. by a nested guest's
    /// virtual-NMI state).
    fn nmi_blocked(&self) -> bool {
        false
    }
}

/// Hook used when no nested virtualization is active.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIntercept;

impl InterceptHook for NoIntercept {}
