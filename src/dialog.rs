//! Dialog engine (C6).
//!
//! A [`Dialog`] is a pattern-matching conversational handler bound to a
//! reply sink. [`CommandDialog`] layers a `command args` grammar on top:
//! a command table, optional sub-dialogs, aliases, and a generated help
//! system. Both are generic over a context type `C` passed to every
//! handler, rather than over a stored reference back to the dialog's
//! owner — the narrow interface this crate uses everywhere to avoid
//! cyclic references between sessions, channels, and feeds.
//!
//! The original resolves `command_foo`/`help_foo`/`shorthelp_foo` by
//! attribute lookup at runtime; here that becomes an explicit
//! registration table keyed by command name, each entry carrying its
//! handler, help text, and importance.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;

use crate::error::Result;

type BoxFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// The reply sink a dialog sends its output through — a channel posting
/// a bot notice, or a direct message back to the connecting socket.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_message(&self, msg: &str) -> Result<()>;
}

type PatternHandler<C> =
    Arc<dyn Fn(Arc<C>, String, regex::Captures<'_>) -> BoxFuture<'static> + Send + Sync>;

/// Importance buckets used to lay out generated help text, lowest value
/// listed first under "Available commands".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Importance {
    Important = 0,
    Common = 2,
    Interesting = 5,
    Unimportant = 6,
    Alias = 7,
    Advanced = 8,
}

impl Default for Importance {
    fn default() -> Self {
        Importance::Interesting
    }
}

struct Pattern<C> {
    regex: Regex,
    strip: bool,
    handler: PatternHandler<C>,
}

/// A pattern-matching conversational handler. On an inbound message it
/// tries each registered pattern, most-recently-registered first; the
/// first match invokes its handler. A handler error yields exactly one
/// user-visible error reply and no further handler calls for that
/// message. No match invokes [`Dialog::unknown_message`]'s default
/// reply.
pub struct Dialog<C> {
    patterns: Vec<Pattern<C>>,
}

impl<C: Send + Sync + 'static> Default for Dialog<C> {
    fn default() -> Self {
        Self { patterns: Vec::new() }
    }
}

impl<C: Send + Sync + 'static> Dialog<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pattern. Later registrations take precedence, mirroring
    /// the original's `patterns.insert(0, ...)`.
    pub fn wait_for<F, Fut>(&mut self, regexp: &str, strip: bool, handler: F) -> Result<()>
    where
        F: Fn(Arc<C>, String, regex::Captures<'_>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let regex = Regex::new(regexp)
            .map_err(|e| crate::error::GatewayError::Internal(format!("bad dialog pattern: {e}")))?;
        self.patterns.insert(
            0,
            Pattern {
                regex,
                strip,
                handler: Arc::new(move |ctx, msg, caps| Box::pin(handler(ctx, msg, caps))),
            },
        );
        Ok(())
    }

    pub async fn unknown_message(&self, ctx: &C, sink: &dyn MessageSink) -> Result<()>
    where
        C: 'static,
    {
        let _ = ctx;
        sink.send_message("Sorry, I don't know what you mean").await
    }

    pub async fn error_reply(&self, sink: &dyn MessageSink, e: &crate::error::GatewayError) -> Result<()> {
        sink.send_message(&format!("An error has occurred. Sorry. -- {e}")).await
    }

    /// Try every pattern in precedence order; dispatch the first match.
    pub async fn recv_message(&self, ctx: Arc<C>, sink: &dyn MessageSink, msg: &str) -> Result<()> {
        for pattern in &self.patterns {
            let candidate = if pattern.strip { msg.trim() } else { msg };
            if let Some(caps) = pattern.regex.captures(candidate) {
                let handler = pattern.handler.clone();
                let owned = msg.to_string();
                return match handler(ctx, owned, caps).await {
                    Ok(()) => Ok(()),
                    Err(e) => self.error_reply(sink, &e).await,
                };
            }
        }
        self.unknown_message(&ctx, sink).await
    }
}

type CommandHandler<C> = Arc<dyn Fn(Arc<C>, Option<String>) -> BoxFuture<'static> + Send + Sync>;

enum CommandSlot<C> {
    Direct(CommandHandler<C>),
    /// An alias resolves to another entry in the same table at call time,
    /// so it always reflects the target's current handler.
    Alias(String),
}

struct CommandEntry<C> {
    slot: CommandSlot<C>,
    short_help: Option<String>,
    long_help: Option<String>,
    importance: Importance,
}

/// A `command args` dialog: a command table, optional sub-dialogs routed
/// by keyword prefix, aliases, and an auto-generated help listing.
/// Importance buckets commands into "main" vs "other" help sections.
pub struct CommandDialog<C> {
    commands: HashMap<String, CommandEntry<C>>,
    subdialogs: Vec<(String, Arc<CommandDialog<C>>)>,
    cmd_prefix: String,
    help_header: Option<String>,
}

impl<C: Send + Sync + 'static> Default for CommandDialog<C> {
    fn default() -> Self {
        Self {
            commands: HashMap::new(),
            subdialogs: Vec::new(),
            cmd_prefix: String::new(),
            help_header: None,
        }
    }
}

impl<C: Send + Sync + 'static> CommandDialog<C> {
    pub fn new(cmd_prefix: impl Into<String>) -> Self {
        Self {
            cmd_prefix: cmd_prefix.into(),
            ..Self::default()
        }
    }

    pub fn set_help_header(&mut self, header: impl Into<String>) {
        self.help_header = Some(header.into());
    }

    pub fn add_command<F, Fut>(
        &mut self,
        cmd: &str,
        short_help: Option<&str>,
        long_help: Option<&str>,
        importance: Importance,
        handler: F,
    ) where
        F: Fn(Arc<C>, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.commands.insert(
            cmd.to_lowercase(),
            CommandEntry {
                slot: CommandSlot::Direct(Arc::new(move |ctx, args| Box::pin(handler(ctx, args)))),
                short_help: short_help.map(str::to_string),
                long_help: long_help.map(str::to_string),
                importance,
            },
        );
    }

    /// Register `alias` as a synonym for an already-registered `cmd`,
    /// inheriting its short help text under a "Synonym to `cmd`" wrapper.
    /// Resolved against `cmd`'s handler at call time, not at registration.
    pub fn add_alias(&mut self, alias: &str, cmd: &str) {
        let target = cmd.to_lowercase();
        let short_help = self
            .commands
            .get(&target)
            .and_then(|e| e.short_help.clone())
            .map(|sh| format!("Synonym to `{cmd}`: {sh}"));
        self.commands.insert(
            alias.to_lowercase(),
            CommandEntry {
                slot: CommandSlot::Alias(target),
                short_help,
                long_help: None,
                importance: Importance::Alias,
            },
        );
    }

    /// Nest a sub-dialog behind a keyword: `cmd args` is forwarded to the
    /// sub-dialog's own [`CommandDialog::try_msg`].
    pub fn add_subdialog(&mut self, cmd: &str, dialog: Arc<CommandDialog<C>>, short_help: Option<&str>) {
        let short_help = short_help
            .map(str::to_string)
            .or_else(|| dialog.help_header.clone());
        self.subdialogs.push((cmd.to_lowercase(), dialog.clone()));
        self.commands.insert(
            cmd.to_lowercase(),
            CommandEntry {
                slot: CommandSlot::Direct(Arc::new(move |ctx, args| {
                    let dialog = dialog.clone();
                    Box::pin(async move { dialog.dispatch(ctx, &args.unwrap_or_default()).await })
                })),
                short_help,
                long_help: None,
                importance: Importance::default(),
            },
        );
    }

    pub fn split_args(s: &str) -> (String, Option<String>) {
        let s = s.trim_start();
        match s.split_once(' ') {
            Some((cmd, rest)) => (cmd.to_string(), Some(rest.to_string())),
            None => (s.to_string(), None),
        }
    }

    fn command_fn(&self, cmd: &str) -> Option<&CommandEntry<C>> {
        self.commands.get(&cmd.to_lowercase())
    }

    /// Walk an alias chain to the handler it ultimately resolves to.
    fn resolve_handler(&self, cmd: &str) -> Option<&CommandHandler<C>> {
        match &self.command_fn(cmd)?.slot {
            CommandSlot::Direct(h) => Some(h),
            CommandSlot::Alias(target) => self.resolve_handler(target),
        }
    }

    /// Test whether `msg` parses as a known command without requiring
    /// the caller to commit to handling it as one — used by channels in
    /// "careful mode" to decide whether an unprefixed message is a
    /// command or ordinary chat.
    pub fn try_msg(&self, msg: &str) -> (bool, (String, Option<String>)) {
        let (cmd, args) = Self::split_args(msg);
        (self.command_fn(&cmd).is_some(), (cmd, args))
    }

    async fn dispatch(&self, ctx: Arc<C>, msg: &str) -> Result<()> {
        let (cmd, args) = Self::split_args(msg);
        if let Some(handler) = self.resolve_handler(&cmd) {
            handler(ctx, args).await
        } else {
            Ok(())
        }
    }

    /// `HELP`/`?` are always available and resolved here directly rather
    /// than through the command table, since rendering them needs `&self`
    /// (the table being described) rather than just a context handle.
    pub async fn recv_message(&self, ctx: Arc<C>, sink: &dyn MessageSink, msg: &str) -> Result<()> {
        let (cmd, args) = Self::split_args(msg);
        if self.command_fn(&cmd).is_none() && (cmd.eq_ignore_ascii_case("help") || cmd == "?") {
            return self.show_help(sink, args.as_deref()).await;
        }
        match self.resolve_handler(&cmd) {
            Some(handler) => match handler(ctx, args).await {
                Ok(()) => Ok(()),
                Err(e) => sink
                    .send_message(&format!("An error has occurred. Sorry. -- {e}"))
                    .await,
            },
            None => {
                sink.send_message(&format!(
                    "Sorry, I don't get it. Type '{}HELP' for available commands",
                    self.cmd_prefix
                ))
                .await
            }
        }
    }

    fn help_topics(&self) -> Vec<(Importance, String)> {
        let mut topics: Vec<(Importance, String)> = self
            .commands
            .iter()
            .filter(|(_, e)| e.short_help.is_some())
            .map(|(name, e)| (e.importance, name.clone()))
            .collect();
        topics.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        topics
    }

    fn short_help_line(&self, cmd: &str) -> Option<String> {
        let entry = self.commands.get(cmd)?;
        let sh = entry.short_help.as_ref()?;
        Some(format!("{}{} - {}", self.cmd_prefix, cmd.to_uppercase(), sh))
    }

    /// Render the generated help listing: a header, a main commands
    /// block for `Important`/`Common`/`Interesting` importance, an
    /// "Other commands" one-line summary for the rest, through the sink.
    pub async fn show_help(&self, sink: &dyn MessageSink, args: Option<&str>) -> Result<()> {
        if let Some(args) = args {
            let (cmd, _rest) = Self::split_args(args);
            return match self.commands.get(&cmd.to_lowercase()) {
                Some(entry) => {
                    if let Some(lh) = &entry.long_help {
                        sink.send_message(lh).await
                    } else if let Some(sh) = self.short_help_line(&cmd.to_lowercase()) {
                        sink.send_message(&sh).await
                    } else {
                        sink.send_message(&format!("Unknown help topic: {cmd}")).await
                    }
                }
                None => sink.send_message(&format!("Unknown help topic: {cmd}")).await,
            };
        }

        if let Some(header) = &self.help_header {
            sink.send_message(header).await?;
        }

        let topics = self.help_topics();
        let main: Vec<&String> = topics
            .iter()
            .filter(|(imp, _)| *imp <= Importance::Interesting)
            .map(|(_, name)| name)
            .collect();
        let rest: Vec<&String> = topics
            .iter()
            .filter(|(imp, _)| *imp > Importance::Interesting)
            .map(|(_, name)| name)
            .collect();

        if !main.is_empty() {
            sink.send_message(&format!("{}Available commands:", self.cmd_prefix)).await?;
            for cmd in &main {
                if let Some(line) = self.short_help_line(cmd) {
                    sink.send_message(&line).await?;
                }
            }
        }
        if !rest.is_empty() {
            let label = if main.is_empty() { "Available commands" } else { "Other commands" };
            let list = rest
                .iter()
                .map(|c| format!("{}{}", self.cmd_prefix, c.to_uppercase()))
                .collect::<Vec<_>>()
                .join(" ");
            sink.send_message(&format!("{label}: {list}")).await?;
        }
        Ok(())
    }
}
