//! Error reporting: route runtime error lines to the logger service.
//!
//! Error text becomes a PTYPE_TEXT message to the service registered
//! under the name `logger`. Until that service exists (early boot) the
//! line falls back to the stderr sink. The logger handle is cached once
//! found; a logger that retires mid-run simply drops further reports,
//! like the original.

use std::sync::atomic::Ordering;

use crate::log;
use crate::message::{Handle, Message, Payload, PTYPE_TEXT};
use crate::runtime::RuntimeCore;

/// Report one error line on behalf of service `source` (0 for the
/// runtime itself).
pub fn report(core: &RuntimeCore, source: Handle, text: &str) {
    let mut logger = core.logger_cache.load(Ordering::Relaxed);
    if logger == 0 {
        logger = core.handles.find_name("logger").unwrap_or(0);
        if logger != 0 {
            core.logger_cache.store(logger, Ordering::Relaxed);
        }
    }
    if logger == 0 {
        log::emit(log::LEVEL_ERROR, text);
        return;
    }
    let msg = Message {
        source,
        session: 0,
        ptype: PTYPE_TEXT,
        payload: Payload::from(text.as_bytes().to_vec()),
    };
    if !core.push(logger, msg) {
        log::emit(log::LEVEL_ERROR, text);
    }
}
