//! `snare log`: one line per debug event.

use snare_core::prelude::*;

/// Print every event and answer it the way the session would by default.
pub fn install(session: &Session)
{
    session.on_event(|_, event| {
        println!("{}", line(&event));
        event.acknowledge_default();
    });
}

fn line(event: &DebugEvent) -> String
{
    format!("[pid {}] {}", event.process_id(), event.describe())
}
