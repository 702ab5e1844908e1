//! Session state machine (C9).
//!
//! Owns one connection's registration progress, its authenticated
//! account (if any), the channels it has joined, and the scheduler
//! driving that account's feeds. Talks to the socket only through the
//! narrow [`Transport`] trait — never a concrete codec/stream type —
//! and to channels/feeds through the same narrow [`crate::channel::ChannelEnv`]/
//! [`crate::feed::VarStore`] interfaces they already expect, via a small
//! per-account [`AccountEnv`] handle that holds no reference back to the
//! session itself (breaking what would otherwise be a session/channel
//! reference cycle).

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::api::{DelegatedAuth, RemoteApi};
use crate::auth::{authenticate, AuthOutcome, AuthProbe, SetupSession};
use crate::channel::{chunk_names, follow_via_invite, unfollow_via_kick, Channel, ChannelEnv, ChannelKind, ChannelOutput};
use crate::config::{Config, Limits};
use crate::db::{Account, Database};
use crate::dialog::MessageSink;
use crate::error::{GatewayError, Result};
use crate::feed::{Feed, FeedKind, VarStore};
use crate::identity::{IdentityLookup, IdentityUpdater};
use crate::irc::numeric;
use crate::irc::Message;

/// Where a session writes outbound IRC lines. Implemented by the actual
/// socket-backed writer half in `main.rs`; trivially fakeable in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, msg: Message) -> Result<()>;
}

/// Builds the account-scoped [`RemoteApi`] once an account's delegated
/// token is known. Constructing an HTTP-backed client is outside this
/// crate's scope (see `api.rs`); this is the seam a caller plugs one in
/// through.
pub trait RemoteApiFactory: Send + Sync {
    fn build(&self, account: &Account) -> Arc<dyn RemoteApi>;
}

/// The narrow per-account handle given to every [`Feed`] and [`Channel`]
/// this session owns. Holds no reference to the `Session` or to any
/// `Channel`, so channels, feeds, and the session can all drop
/// independently.
struct AccountEnv {
    account_id: i64,
    db: Arc<Database>,
    api: Arc<dyn RemoteApi>,
    scheduler: crate::scheduler::Scheduler,
    identity: Arc<dyn IdentityUpdater>,
}

#[async_trait]
impl VarStore for AccountEnv {
    async fn get_var(&self, name: &str) -> Result<Option<String>> {
        self.db.get_var(self.account_id, name).await.map_err(GatewayError::from)
    }
    async fn set_var(&self, name: &str, value: &str) -> Result<()> {
        self.db.set_var(self.account_id, name, value).await.map_err(GatewayError::from)
    }
}

#[async_trait]
impl ChannelEnv for AccountEnv {
    async fn get_var(&self, name: &str) -> Result<Option<String>> {
        VarStore::get_var(self, name).await
    }
    async fn set_var(&self, name: &str, value: &str) -> Result<()> {
        VarStore::set_var(self, name, value).await
    }
    fn api(&self) -> Arc<dyn RemoteApi> {
        self.api.clone()
    }
    fn scheduler(&self) -> crate::scheduler::Scheduler {
        self.scheduler.clone()
    }
    fn identity(&self) -> Arc<dyn IdentityUpdater> {
        self.identity.clone()
    }
}

#[derive(Default)]
struct Registration {
    nick: Option<String>,
    user: Option<String>,
    realname: Option<String>,
    pass: Option<String>,
    registered: bool,
}

/// What a dispatched line asks the caller to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    Continue,
    Disconnect,
}

/// One client connection's protocol state.
pub struct Session {
    server_name: String,
    network_name: String,
    motd: Vec<String>,
    limits: Limits,

    transport: Arc<dyn Transport>,
    db: Arc<Database>,
    api_factory: Arc<dyn RemoteApiFactory>,
    probe: Arc<dyn AuthProbe>,
    delegated_auth: Arc<dyn DelegatedAuth>,
    identity_updater: Arc<dyn IdentityUpdater>,
    identity_lookup: Arc<dyn IdentityLookup>,

    reg: Mutex<Registration>,
    account: Mutex<Option<Account>>,
    env: Mutex<Option<Arc<AccountEnv>>>,
    scheduler: crate::scheduler::Scheduler,
    channels: DashMap<String, Arc<Channel>>,
    setup: Mutex<Option<Arc<SetupSession>>>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_name: impl Into<String>,
        network_name: impl Into<String>,
        motd: Vec<String>,
        limits: Limits,
        transport: Arc<dyn Transport>,
        db: Arc<Database>,
        api_factory: Arc<dyn RemoteApiFactory>,
        probe: Arc<dyn AuthProbe>,
        delegated_auth: Arc<dyn DelegatedAuth>,
        identity_updater: Arc<dyn IdentityUpdater>,
        identity_lookup: Arc<dyn IdentityLookup>,
    ) -> Arc<Self> {
        let refresh_delay = Duration::from_secs_f64(limits.refresh_delay_secs());
        Arc::new(Self {
            server_name: server_name.into(),
            network_name: network_name.into(),
            motd,
            limits,
            transport,
            db,
            api_factory,
            probe,
            delegated_auth,
            identity_updater,
            identity_lookup,
            reg: Mutex::new(Registration::default()),
            account: Mutex::new(None),
            env: Mutex::new(None),
            scheduler: crate::scheduler::Scheduler::new(refresh_delay),
            channels: DashMap::new(),
            setup: Mutex::new(None),
        })
    }

    fn current_nick(&self) -> String {
        self.reg.lock().nick.clone().unwrap_or_else(|| "*".to_string())
    }

    fn account_id(&self) -> Result<i64> {
        self.account
            .lock()
            .as_ref()
            .map(|a| a.id)
            .ok_or_else(|| GatewayError::Internal("no authenticated account".into()))
    }

    async fn send_numeric(&self, numeric_code: u16, args: Vec<String>) -> Result<()> {
        let nick = self.current_nick();
        self.transport.send(numeric::reply(&self.server_name, &nick, numeric_code, args)).await
    }

    async fn send_notice(&self, text: &str) -> Result<()> {
        let nick = self.current_nick();
        self.transport
            .send(Message::with_prefix(self.server_name.clone(), "NOTICE", vec![nick, text.to_string()]))
            .await
    }

    /// Top-level entry point: dispatch one inbound line, swallowing any
    /// non-fatal error into a single logged notice, per the flat
    /// error-handling design — only an explicit [`SessionSignal::Disconnect`]
    /// ends the connection.
    pub async fn dispatch(self: &Arc<Self>, msg: Message) -> SessionSignal {
        match self.handle_message(msg).await {
            Ok(signal) => signal,
            Err(e) => {
                if let Some((num, args)) = e.to_irc_reply() {
                    let _ = self.send_numeric(num, args).await;
                } else {
                    tracing::warn!(error = %e, "session error");
                    let _ = self.send_notice(&format!("An error has occurred. Sorry. -- {e}")).await;
                }
                SessionSignal::Continue
            }
        }
    }

    async fn handle_message(self: &Arc<Self>, msg: Message) -> Result<SessionSignal> {
        match msg.command.as_str() {
            "PASS" => {
                self.reg.lock().pass = msg.params.first().cloned();
                Ok(SessionSignal::Continue)
            }
            "NICK" => self.handle_nick(msg).await,
            "USER" => self.handle_user(msg).await,
            "PING" => {
                self.transport.send(crate::irc::pong_for(&msg)).await?;
                Ok(SessionSignal::Continue)
            }
            "QUIT" => {
                self.teardown().await;
                Ok(SessionSignal::Disconnect)
            }
            _ if !self.reg.lock().registered => {
                // nothing else is meaningful until registration completes.
                Ok(SessionSignal::Continue)
            }
            "JOIN" => self.handle_join(msg).await,
            "PART" => self.handle_part(msg).await,
            "PRIVMSG" => self.handle_privmsg(msg).await,
            "MODE" => self.handle_mode(msg).await,
            "WHO" => self.handle_who(msg).await,
            "WHOIS" => self.handle_whois(msg).await,
            "USERHOST" => self.handle_userhost(msg).await,
            "INVITE" => self.handle_invite(msg).await,
            "KICK" => self.handle_kick(msg).await,
            _ => Err(GatewayError::reply(
                numeric::ERR_UNKNOWNCOMMAND,
                [msg.command.clone(), "Unknown command".to_string()],
            )),
        }
    }

    async fn handle_nick(self: &Arc<Self>, msg: Message) -> Result<SessionSignal> {
        let Some(nick) = msg.params.first().cloned() else {
            return Ok(SessionSignal::Continue);
        };
        if self.reg.lock().registered {
            self.send_notice("Nick changes aren't supported once connected.").await?;
            return Ok(SessionSignal::Continue);
        }
        self.reg.lock().nick = Some(nick);
        self.maybe_complete_registration().await
    }

    async fn handle_user(self: &Arc<Self>, msg: Message) -> Result<SessionSignal> {
        if msg.params.len() < 4 {
            return Err(GatewayError::reply(
                numeric::ERR_UNKNOWNCOMMAND,
                ["USER".to_string(), "not enough parameters".to_string()],
            ));
        }
        {
            let mut reg = self.reg.lock();
            reg.user = Some(msg.params[0].clone());
            reg.realname = msg.params.last().cloned();
        }
        self.maybe_complete_registration().await
    }

    async fn maybe_complete_registration(self: &Arc<Self>) -> Result<SessionSignal> {
        let (nick, pass) = {
            let reg = self.reg.lock();
            if reg.registered || reg.nick.is_none() || reg.user.is_none() {
                return Ok(SessionSignal::Continue);
            }
            (reg.nick.clone().unwrap(), reg.pass.clone().unwrap_or_default())
        };

        let outcome = authenticate(&self.db, self.probe.as_ref(), &nick, &pass).await?;
        match outcome {
            AuthOutcome::Authenticated { account, .. } => {
                self.install_account(account.clone()).await?;
                self.finish_registration(&nick).await?;
                self.join_home_channels().await?;
                Ok(SessionSignal::Continue)
            }
            AuthOutcome::NeedsOAuthSetup { account } => {
                *self.account.lock() = Some(account);
                self.finish_registration(&nick).await?;
                self.join_setup_channel().await?;
                Ok(SessionSignal::Continue)
            }
            AuthOutcome::Rejected => {
                self.send_numeric(numeric::ERR_PASSWDMISMATCH, vec!["Password incorrect".into()])
                    .await?;
                Ok(SessionSignal::Disconnect)
            }
        }
    }

    async fn install_account(self: &Arc<Self>, account: Account) -> Result<()> {
        let api = self.api_factory.build(&account);
        let env = Arc::new(AccountEnv {
            account_id: account.id,
            db: self.db.clone(),
            api,
            scheduler: self.scheduler.clone(),
            identity: self.identity_updater.clone(),
        });
        *self.env.lock() = Some(env);
        *self.account.lock() = Some(account);
        Ok(())
    }

    async fn finish_registration(&self, nick: &str) -> Result<()> {
        self.reg.lock().registered = true;
        self.send_numeric(numeric::RPL_WELCOME, vec![format!("Welcome to {}, {}", self.network_name, nick)])
            .await?;
        self.send_numeric(numeric::RPL_YOURHOST, vec![format!("Your host is {}", self.server_name)])
            .await?;
        self.send_numeric(numeric::RPL_CREATED, vec!["This server has no meaningful creation date".into()])
            .await?;
        self.send_numeric(numeric::RPL_MYINFO, vec![self.server_name.clone()]).await?;
        for line in &self.motd {
            self.send_notice(line).await?;
        }
        self.scheduler.start();
        Ok(())
    }

    fn subscribe_channel_output(self: &Arc<Self>, channel: &Arc<Channel>) {
        let weak: Weak<Session> = Arc::downgrade(self);
        let name = channel.name();
        channel.on_output(move |out: &ChannelOutput| {
            let weak = weak.clone();
            let name = name.clone();
            let out = out.clone();
            async move {
                match weak.upgrade() {
                    Some(session) => session.render_channel_output(&name, &out).await,
                    None => Ok(()),
                }
            }
        });
    }

    async fn render_channel_output(&self, channel_name: &str, out: &ChannelOutput) -> Result<()> {
        match out {
            ChannelOutput::Post { sender, lines } => {
                for line in lines {
                    self.transport
                        .send(Message::with_prefix(
                            format!("{sender}!{sender}@{}", self.network_name),
                            "PRIVMSG",
                            vec![channel_name.to_string(), line.clone()],
                        ))
                        .await?;
                }
                Ok(())
            }
            ChannelOutput::Notice(text) => {
                self.transport
                    .send(Message::with_prefix(self.server_name.clone(), "NOTICE", vec![channel_name.to_string(), text.clone()]))
                    .await
            }
            ChannelOutput::Join { nick } => {
                self.transport
                    .send(Message::with_prefix(
                        format!("{nick}!{nick}@{}", self.network_name),
                        "JOIN",
                        vec![channel_name.to_string()],
                    ))
                    .await
            }
            ChannelOutput::Kick { nick, reason } => {
                self.transport
                    .send(Message::with_prefix(
                        self.server_name.clone(),
                        "KICK",
                        vec![channel_name.to_string(), nick.clone(), reason.clone()],
                    ))
                    .await
            }
            ChannelOutput::Rename { old, new } => {
                self.transport
                    .send(Message::with_prefix(format!("{old}!{old}@{}", self.network_name), "NICK", vec![new.clone()]))
                    .await
            }
        }
    }

    async fn join_and_announce(self: &Arc<Self>, channel: Arc<Channel>) -> Result<()> {
        let name = channel.name();
        channel.add_member(&self.current_nick());
        self.channels.insert(name.to_ascii_lowercase(), channel.clone());

        let nick = self.current_nick();
        self.transport
            .send(Message::with_prefix(format!("{nick}!{nick}@{}", self.network_name), "JOIN", vec![name.clone()]))
            .await?;

        let members = channel.members();
        for chunk in chunk_names(&members) {
            self.send_numeric(numeric::RPL_NAMREPLY, {
                let mut v = vec!["=".to_string(), name.clone()];
                v.push(chunk.join(" "));
                v
            })
            .await?;
        }
        self.send_numeric(numeric::RPL_ENDOFNAMES, vec![name, "End of /NAMES list".into()]).await
    }

    async fn join_home_channels(self: &Arc<Self>) -> Result<()> {
        let env = self.env.lock().clone().ok_or_else(|| GatewayError::Internal("no account env".into()))?;

        let home = Channel::new(ChannelKind::Home, self.limits.reply_history_size);
        let feed = Feed::new(FeedKind::Home, env.api(), env.clone(), self.limits.query_count);
        self.register_feed(home.clone(), feed, env.clone());
        self.join_and_announce(home).await?;

        let mentions = Channel::new(ChannelKind::Mentions, self.limits.reply_history_size);
        let feed = Feed::new(FeedKind::Mentions, env.api(), env.clone(), self.limits.query_count);
        self.register_feed(mentions.clone(), feed, env);
        self.join_and_announce(mentions).await?;

        Ok(())
    }

    fn register_feed(self: &Arc<Self>, channel: Arc<Channel>, feed: Arc<Feed>, env: Arc<AccountEnv>) {
        self.subscribe_channel_output(&channel);
        let channel_for_entry = channel.clone();
        let env_for_entry = env.clone();
        feed.on_entry(move |entry: &crate::api::Entry| {
            let channel = channel_for_entry.clone();
            let env = env_for_entry.clone();
            let entry = entry.clone();
            async move { channel.on_feed_entry(&entry, env.as_ref()).await }
        });

        let f = feed.clone();
        let handle = self.scheduler.register(move || {
            let f = f.clone();
            async move { f.refresh().await }
        });
        feed.set_scheduler_handle(handle);
        channel.add_feed(feed);
    }

    async fn join_setup_channel(self: &Arc<Self>) -> Result<()> {
        let setup_channel = Channel::new(ChannelKind::Setup, self.limits.reply_history_size);
        self.subscribe_channel_output(&setup_channel);
        self.join_and_announce(setup_channel).await?;

        let setup = SetupSession::new(self.delegated_auth.clone());
        setup.begin(self.as_ref()).await?;
        *self.setup.lock() = Some(setup);
        Ok(())
    }

    async fn handle_join(self: &Arc<Self>, msg: Message) -> Result<SessionSignal> {
        let Some(target) = msg.params.first() else {
            return Ok(SessionSignal::Continue);
        };
        if self.channels.contains_key(&target.to_ascii_lowercase()) {
            return Ok(SessionSignal::Continue);
        }
        let Some(kind) = ChannelKind::parse(target) else {
            return Err(GatewayError::reply(
                numeric::ERR_UNAVAILRESOURCE,
                [target.clone(), "Not a valid passerd channel".to_string()],
            ));
        };
        let env = self.env.lock().clone().ok_or_else(|| GatewayError::Internal("no account env".into()))?;

        let channel = Channel::new(kind.clone(), self.limits.reply_history_size);
        match &kind {
            ChannelKind::User(_) | ChannelKind::List { .. } => {
                let feed_kind = match &kind {
                    ChannelKind::User { name } => FeedKind::UserTimeline(name.clone()),
                    ChannelKind::List { owner, name } => FeedKind::ListTimeline(owner.clone(), name.clone()),
                    _ => unreachable!(),
                };
                let feed = Feed::new(feed_kind, env.api(), env.clone(), self.limits.query_count);
                self.register_feed(channel.clone(), feed, env);
            }
            ChannelKind::Home | ChannelKind::Mentions | ChannelKind::Setup => {
                self.subscribe_channel_output(&channel);
            }
        }
        self.join_and_announce(channel).await?;
        Ok(SessionSignal::Continue)
    }

    async fn handle_part(self: &Arc<Self>, msg: Message) -> Result<SessionSignal> {
        let Some(target) = msg.params.first() else {
            return Ok(SessionSignal::Continue);
        };
        if let Some((_, channel)) = self.channels.remove(&target.to_ascii_lowercase()) {
            channel.remove_member(&self.current_nick());
            let nick = self.current_nick();
            self.transport
                .send(Message::with_prefix(format!("{nick}!{nick}@{}", self.network_name), "PART", vec![target.clone()]))
                .await?;
        }
        Ok(SessionSignal::Continue)
    }

    async fn handle_privmsg(self: &Arc<Self>, msg: Message) -> Result<SessionSignal> {
        let Some(target) = msg.params.first().cloned() else {
            return Ok(SessionSignal::Continue);
        };
        let Some(text) = msg.trailing().map(str::to_string) else {
            return Ok(SessionSignal::Continue);
        };

        if let Some(setup) = self.setup.lock().clone() {
            let pin = text.strip_prefix("!login ").unwrap_or(&text);
            if let Some((token, secret)) = setup.handle_pin(pin, self.as_ref()).await? {
                let account_id = self.account_id()?;
                self.db.set_delegated_token(account_id, &token, &secret).await.map_err(GatewayError::from)?;
                self.complete_oauth_setup().await?;
            }
            return Ok(SessionSignal::Continue);
        }

        if target.eq_ignore_ascii_case(&self.current_nick()) || target.eq_ignore_ascii_case(&self.server_name) {
            return self.handle_self_addressed_ctcp(&text).await;
        }

        let Some(channel) = self.channels.get(&target.to_ascii_lowercase()).map(|r| r.clone()) else {
            return Err(GatewayError::reply(numeric::ERR_NOSUCHNICK, [target, "No such channel".to_string()]));
        };
        let env = self.env.lock().clone().ok_or_else(|| GatewayError::Internal("no account env".into()))?;

        let (is_action, text) = match crate::irc::extract_ctcp(&text) {
            Some((verb, args)) if verb == "ACTION" => (true, args.unwrap_or_default()),
            Some((_verb, _)) => {
                // CTCP addressed at a channel other than ACTION: ignored.
                return Ok(SessionSignal::Continue);
            }
            None => (false, text),
        };

        let careful = match env.get_var("config:careful").await? {
            Some(v) => Config::is_truthy(&v),
            None => false,
        };
        let min_age = Duration::from_secs(self.limits.min_latest_post_age_secs.max(0) as u64);

        channel
            .handle_privmsg(
                channel.clone(),
                env as Arc<dyn ChannelEnv>,
                &self.current_nick(),
                &text,
                careful,
                is_action,
                self.limits.length_limit,
                min_age,
                self.clone() as Arc<dyn MessageSink>,
            )
            .await?;
        Ok(SessionSignal::Continue)
    }

    /// CTCP sent straight at the bot pseudo-user (the server name) or at
    /// the client's own nick, rather than at a channel. VERSION and PING
    /// get the standard CTCP reply over NOTICE; anything else is
    /// silently dropped, matching the channel-addressed CTCP behavior.
    async fn handle_self_addressed_ctcp(&self, text: &str) -> Result<SessionSignal> {
        let Some((verb, args)) = crate::irc::extract_ctcp(text) else {
            return Ok(SessionSignal::Continue);
        };
        let reply = match verb.as_str() {
            "VERSION" => crate::irc::wrap_ctcp("VERSION", Some("passerd-rs:IRC-to-microblog gateway")),
            "PING" => crate::irc::wrap_ctcp("PING", args.as_deref()),
            _ => return Ok(SessionSignal::Continue),
        };
        let nick = self.current_nick();
        self.transport
            .send(Message::with_prefix(self.server_name.clone(), "NOTICE", vec![nick, reply]))
            .await?;
        Ok(SessionSignal::Continue)
    }

    async fn complete_oauth_setup(self: &Arc<Self>) -> Result<()> {
        let account = self.account.lock().clone().ok_or_else(|| GatewayError::Internal("no account".into()))?;
        self.install_account(account).await?;
        *self.setup.lock() = None;
        if let Some((_name, channel)) = self.channels.remove(&ChannelKind::Setup.irc_name().to_ascii_lowercase()) {
            channel.remove_member(&self.current_nick());
        }
        self.join_home_channels().await
    }

    async fn handle_mode(&self, msg: Message) -> Result<SessionSignal> {
        let Some(target) = msg.params.first().cloned() else {
            return Ok(SessionSignal::Continue);
        };
        if msg.params.get(1).map(String::as_str) == Some("b") {
            self.send_numeric(numeric::RPL_ENDOFBANLIST, vec![target, "End of channel ban list".into()]).await?;
        } else {
            self.send_numeric(numeric::RPL_CHANNELMODEIS, vec![target, "+".into()]).await?;
        }
        Ok(SessionSignal::Continue)
    }

    async fn handle_who(&self, msg: Message) -> Result<SessionSignal> {
        let Some(target) = msg.params.first().cloned() else {
            return Ok(SessionSignal::Continue);
        };
        if let Some(channel) = self.channels.get(&target.to_ascii_lowercase()) {
            for member in channel.members() {
                self.send_numeric(
                    numeric::RPL_WHOREPLY,
                    vec![
                        target.clone(),
                        member.clone(),
                        self.network_name.clone(),
                        self.server_name.clone(),
                        member.clone(),
                        "H".into(),
                        format!("0 {member}"),
                    ],
                )
                .await?;
            }
        }
        self.send_numeric(numeric::RPL_ENDOFWHO, vec![target, "End of /WHO list".into()]).await
    }

    async fn handle_whois(&self, msg: Message) -> Result<SessionSignal> {
        let Some(target) = msg.params.first().cloned() else {
            return Ok(SessionSignal::Continue);
        };
        if target.eq_ignore_ascii_case(&self.server_name) {
            self.send_numeric(
                numeric::RPL_WHOISUSER,
                vec![
                    target.clone(),
                    self.server_name.clone(),
                    self.network_name.clone(),
                    "*".into(),
                    "IRC-to-microblog gateway bot".into(),
                ],
            )
            .await?;
        } else if let Some((_remote_id, info)) = self.identity_lookup.lookup_by_screen_name(&target) {
            self.send_numeric(
                numeric::RPL_WHOISUSER,
                vec![target.clone(), info.screen_name.clone(), self.network_name.clone(), "*".into(), info.display_name],
            )
            .await?;
        } else {
            self.send_numeric(numeric::ERR_NOSUCHNICK, vec![target.clone(), "No such nick".into()]).await?;
        }
        self.send_numeric(numeric::RPL_ENDOFWHOIS, vec![target, "End of /WHOIS list".into()]).await
    }

    async fn handle_userhost(&self, msg: Message) -> Result<SessionSignal> {
        let replies: Vec<String> = msg
            .params
            .iter()
            .map(|nick| format!("{nick}=+{nick}@{}", self.network_name))
            .collect();
        self.send_numeric(numeric::RPL_USERHOST, replies).await?;
        Ok(SessionSignal::Continue)
    }

    async fn handle_invite(self: &Arc<Self>, msg: Message) -> Result<SessionSignal> {
        if msg.params.len() < 2 {
            return Ok(SessionSignal::Continue);
        }
        let nick = msg.params[0].clone();
        let channel_name = msg.params[1].clone();
        let Some(channel) = self.channels.get(&channel_name.to_ascii_lowercase()).map(|r| r.clone()) else {
            return Ok(SessionSignal::Continue);
        };
        if channel.kind != ChannelKind::Home {
            return Ok(SessionSignal::Continue);
        }
        let env = self.env.lock().clone().ok_or_else(|| GatewayError::Internal("no account env".into()))?;
        follow_via_invite(env.api().as_ref(), &nick).await?;
        channel.add_member(&nick);
        self.send_numeric(numeric::RPL_INVITING, vec![nick, channel_name]).await?;
        Ok(SessionSignal::Continue)
    }

    async fn handle_kick(self: &Arc<Self>, msg: Message) -> Result<SessionSignal> {
        if msg.params.len() < 2 {
            return Ok(SessionSignal::Continue);
        }
        let channel_name = msg.params[0].clone();
        let nick = msg.params[1].clone();
        let Some(channel) = self.channels.get(&channel_name.to_ascii_lowercase()).map(|r| r.clone()) else {
            return Ok(SessionSignal::Continue);
        };
        if channel.kind != ChannelKind::Home {
            return Ok(SessionSignal::Continue);
        }
        let env = self.env.lock().clone().ok_or_else(|| GatewayError::Internal("no account env".into()))?;
        unfollow_via_kick(env.api().as_ref(), &nick).await?;
        channel.remove_member(&nick);
        Ok(SessionSignal::Continue)
    }

    async fn teardown(&self) {
        self.scheduler.stop();
        self.channels.clear();
        *self.account.lock() = None;
        *self.env.lock() = None;
        *self.setup.lock() = None;
    }

    /// Connection-loss path: the socket went away without an explicit
    /// QUIT. Runs the same teardown (stop feeds/scheduler, drop channels)
    /// so a dead connection never leaves a scheduler ticking in the
    /// background.
    pub async fn on_disconnect(&self) {
        self.teardown().await;
    }
}

#[async_trait]
impl MessageSink for Session {
    async fn send_message(&self, msg: &str) -> Result<()> {
        self.send_notice(msg).await
    }
}
