use crate::auth::{pubkey, AuthDecision, AuthPolicy};
use crate::ssh::session::{SessionHandle, SessionState};
use std::collections::HashMap;
use std::sync::Arc;

use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Maximum number of session channels per SSH connection.
pub const MAX_CHANNELS_PER_CONNECTION: usize = 10;

/// What the transport callbacks report back to the session task.
#[derive(Debug)]
pub enum SessionEvent {
    /// A public key was accepted.
    Authenticated,
    /// The client asked for a shell on this channel.
    ShellReady(Channel<Msg>),
}

/// Per-connection transport callbacks.
///
/// Public key is the only method offered. The decision itself belongs to
/// [`AuthPolicy`]; this handler only translates it for the transport.
pub struct SessionHandler {
    policy: Arc<AuthPolicy>,
    session: Arc<SessionHandle>,
    events: mpsc::UnboundedSender<SessionEvent>,
    channels: HashMap<ChannelId, Channel<Msg>>,
    authenticated: bool,
    auth_attempts: u32,
}

impl SessionHandler {
    pub fn new(
        policy: Arc<AuthPolicy>,
        session: Arc<SessionHandle>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            policy,
            session,
            events,
            channels: HashMap::new(),
            authenticated: false,
            auth_attempts: 0,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(MethodSet::from([MethodKind::PublicKey].as_slice())),
            partial_success: false,
        }
    }

    fn enter_authorizing(&self) {
        if self.session.state() == SessionState::Handshaking {
            self.session.set_state(SessionState::Authorizing);
        }
    }
}

impl russh::server::Handler for SessionHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        self.enter_authorizing();
        debug!(user = %user, "auth_none attempt (rejected)");
        Ok(Self::reject())
    }

    async fn auth_password(&mut self, user: &str, _password: &str) -> Result<Auth, Self::Error> {
        self.enter_authorizing();
        self.auth_attempts += 1;
        warn!(
            user = %user,
            attempt = self.auth_attempts,
            "Password auth rejected (public key only)"
        );
        Ok(Self::reject())
    }

    /// A key offered without a signature. Answers what `auth_publickey`
    /// would decide, without binding anything.
    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.enter_authorizing();
        match self.policy.check(user, public_key) {
            AuthDecision::Accepted(_) => Ok(Auth::Accept),
            AuthDecision::Rejected(reason) => {
                debug!(user = %user, reason = %reason, "Public key offer refused");
                Ok(Self::reject())
            }
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.enter_authorizing();
        self.auth_attempts += 1;
        let fingerprint = pubkey::fingerprint(public_key);

        match self.policy.decide(user, public_key) {
            AuthDecision::Accepted(username) => {
                info!(user = %username, fingerprint = %fingerprint, "Public key auth success");
                self.session.set_username(&username);
                self.session.set_fingerprint(pubkey::fingerprint_hex(public_key));
                self.authenticated = true;
                let _ = self.events.send(SessionEvent::Authenticated);
                Ok(Auth::Accept)
            }
            AuthDecision::Rejected(reason) => {
                warn!(
                    user = %user,
                    fingerprint = %fingerprint,
                    attempt = self.auth_attempts,
                    reason = %reason,
                    "Public key auth rejected"
                );
                Ok(Self::reject())
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.authenticated {
            return Ok(false);
        }

        if self.channels.len() >= MAX_CHANNELS_PER_CONNECTION {
            warn!(
                user = ?self.session.username(),
                max = MAX_CHANNELS_PER_CONNECTION,
                "Max channels per connection exceeded"
            );
            return Ok(false);
        }

        debug!(channel = ?channel.id(), "Session channel opened");
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(opened) = self.channels.remove(&channel) else {
            let _ = session.channel_failure(channel);
            return Ok(());
        };

        let _ = session.channel_success(channel);
        if self.events.send(SessionEvent::ShellReady(opened)).is_err() {
            debug!(channel = ?channel, "Shell requested after session task ended");
        }
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            channel = ?channel,
            term = %term,
            cols = col_width,
            rows = row_height,
            "pty requested"
        );
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(channel = ?channel, name = %variable_name, "env request ignored");
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(
            user = ?self.session.username(),
            command = %String::from_utf8_lossy(data),
            "Exec refused (interactive shell only)"
        );
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        warn!(
            subsystem = %name,
            user = ?self.session.username(),
            "Subsystem refused"
        );
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }
}
