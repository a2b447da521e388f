use super::Behavior;
use crate::ssh::session::SessionHandle;

/// Single-user line echo, handy for checking a client setup.
#[derive(Debug, Default)]
pub struct EchoBehavior;

impl Behavior for EchoBehavior {
    fn greeting(&self, session: &SessionHandle) -> String {
        format!(
            "Hi {}, fingerprint {}\r\nWrite \"exit\" to quit.\r\n\r\n",
            session.username().unwrap_or_default(),
            session.fingerprint().unwrap_or("unknown"),
        )
    }

    fn prompt(&self, _session: &SessionHandle) -> String {
        "entry: ".to_string()
    }

    fn on_line(&self, _session: &SessionHandle, line: &str) -> Option<String> {
        Some(format!("{}\r\n", line))
    }
}
