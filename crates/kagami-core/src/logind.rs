use tracing::debug;
use zbus::{
    blocking::{Connection, Proxy},
    zvariant::OwnedObjectPath,
};

use crate::errors::AuthResult;

const LOGIN1_BUS: &str = "org.freedesktop.login1";

/// Reads session state from systemd-logind to tell whether a lock screen or
/// greeter currently owns the display.
#[derive(Debug, Default, Clone)]
pub struct LogindInspector;

impl LogindInspector {
    pub fn new() -> Self {
        Self
    }

    pub fn lock_screen_active(&self) -> AuthResult<bool> {
        let records = self.sessions()?;
        let active = lock_screen_showing(&records);
        debug!(
            target: "kagami::guard",
            sessions = records.len(),
            lock_screen = active,
            "inspected logind sessions"
        );
        Ok(active)
    }

    fn sessions(&self) -> AuthResult<Vec<SessionRecord>> {
        let connection = Connection::system()?;
        let manager = Proxy::new(
            &connection,
            LOGIN1_BUS,
            "/org/freedesktop/login1",
            "org.freedesktop.login1.Manager",
        )?;
        let listed: Vec<(String, u32, String, String, OwnedObjectPath)> =
            manager.call("ListSessions", &())?;

        let mut records = Vec::with_capacity(listed.len());
        for (session_id, _uid, _user, _seat, path) in listed {
            let proxy = Proxy::new(
                &connection,
                LOGIN1_BUS,
                path.as_ref(),
                "org.freedesktop.login1.Session",
            )?;
            records.push(SessionRecord {
                id: session_id,
                class: proxy
                    .get_property::<String>("Class")
                    .ok()
                    .and_then(|s| normalize_string(Some(s)))
                    .unwrap_or_else(|| "unknown".into()),
                state: proxy
                    .get_property::<String>("State")
                    .ok()
                    .and_then(|s| normalize_string(Some(s)))
                    .unwrap_or_else(|| "unknown".into()),
                active: proxy.get_property::<bool>("Active").unwrap_or(false),
                locked_hint: proxy.get_property::<bool>("LockedHint").unwrap_or(false),
            });
        }
        Ok(records)
    }
}

#[derive(Debug, Clone)]
struct SessionRecord {
    id: String,
    class: String,
    state: String,
    active: bool,
    locked_hint: bool,
}

fn lock_screen_showing(sessions: &[SessionRecord]) -> bool {
    sessions.iter().any(|session| {
        let foreground = session.active || session.state == "active";
        let greeter = matches!(session.class.as_str(), "greeter" | "lock-screen");
        if foreground && (greeter || session.locked_hint) {
            debug!(target: "kagami::guard", session = %session.id, class = %session.class, "lock screen session");
            true
        } else {
            false
        }
    })
}

fn normalize_string(value: Option<String>) -> Option<String> {
    value.and_then(|s| {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
