//! Core types for the subscription session.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a subscription matches published channel names.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// Literal channel name.
    Exact,
    /// Glob-style pattern, matched by the server.
    Pattern,
    /// Cluster-only channel routed to the node owning its hash slot.
    Sharded,
}

impl fmt::Debug for SubscriptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriptionMode::Exact => "Exact",
            SubscriptionMode::Pattern => "Pattern",
            SubscriptionMode::Sharded => "Sharded",
        };
        f.write_str(name)
    }
}

/// Identity of a subscription: a channel (or pattern) under a mode.
///
/// The same literal under different modes denotes distinct subscriptions.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    pub mode: SubscriptionMode,
    pub name: String,
}

impl ChannelKey {
    pub fn new(mode: SubscriptionMode, name: impl Into<String>) -> Self {
        Self {
            mode,
            name: name.into(),
        }
    }

    /// Literal channel subscription.
    pub fn exact(name: impl Into<String>) -> Self {
        Self::new(SubscriptionMode::Exact, name)
    }

    /// Glob pattern subscription.
    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self::new(SubscriptionMode::Pattern, pattern)
    }

    /// Sharded channel subscription (cluster sessions only).
    pub fn sharded(name: impl Into<String>) -> Self {
        Self::new(SubscriptionMode::Sharded, name)
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.mode, self.name)
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.mode, self.name)
    }
}

/// A message handed to a delivery target.
#[derive(Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Channel the message was published on.
    pub channel: String,
    pub payload: Vec<u8>,
    /// The registered pattern that matched, for pattern deliveries only.
    pub pattern: Option<String>,
}

impl PublishedMessage {
    /// Payload as UTF-8, if valid.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

impl fmt::Debug for PublishedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishedMessage")
            .field("channel", &self.channel)
            .field("pattern", &self.pattern)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// A published-message frame as read off the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedFrame {
    /// Mode the server declared for this frame (message / pmessage / smessage).
    pub mode: SubscriptionMode,
    pub channel: String,
    /// Matching pattern, present on pattern frames.
    pub pattern: Option<String>,
    pub payload: Vec<u8>,
}

impl PublishedFrame {
    pub fn exact(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            mode: SubscriptionMode::Exact,
            channel: channel.into(),
            pattern: None,
            payload: payload.into(),
        }
    }

    pub fn pattern(
        pattern: impl Into<String>,
        channel: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            mode: SubscriptionMode::Pattern,
            channel: channel.into(),
            pattern: Some(pattern.into()),
            payload: payload.into(),
        }
    }

    pub fn sharded(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            mode: SubscriptionMode::Sharded,
            channel: channel.into(),
            pattern: None,
            payload: payload.into(),
        }
    }

    /// Key of the subscription this frame is addressed to.
    ///
    /// Pattern frames are keyed by the pattern the server reports; the client
    /// never re-runs glob matching. Returns `None` for a pattern frame that
    /// carries no pattern.
    pub fn subscription_key(&self) -> Option<ChannelKey> {
        match self.mode {
            SubscriptionMode::Pattern => self
                .pattern
                .as_ref()
                .map(|p| ChannelKey::pattern(p.clone())),
            mode => Some(ChannelKey::new(mode, self.channel.clone())),
        }
    }

    /// Convert into the message handed to a delivery target. Moves the payload.
    pub fn into_message(self) -> PublishedMessage {
        PublishedMessage {
            channel: self.channel,
            payload: self.payload,
            pattern: self.pattern,
        }
    }
}

/// Everything the read path can hand to the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundFrame {
    /// A published message.
    Published(PublishedFrame),
    /// Server confirmed a subscription on this connection.
    SubscribeAck(ChannelKey),
    /// Server confirmed (or initiated) removal of a subscription.
    UnsubscribeAck(ChannelKey),
    /// Server rejected a subscribe-family command.
    Rejected { command: Command, reason: String },
}

/// Protocol verbs for subscription management.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    Subscribe,
    PSubscribe,
    SSubscribe,
    Unsubscribe,
    PUnsubscribe,
    SUnsubscribe,
}

impl Verb {
    pub fn subscribe(mode: SubscriptionMode) -> Self {
        match mode {
            SubscriptionMode::Exact => Verb::Subscribe,
            SubscriptionMode::Pattern => Verb::PSubscribe,
            SubscriptionMode::Sharded => Verb::SSubscribe,
        }
    }

    pub fn unsubscribe(mode: SubscriptionMode) -> Self {
        match mode {
            SubscriptionMode::Exact => Verb::Unsubscribe,
            SubscriptionMode::Pattern => Verb::PUnsubscribe,
            SubscriptionMode::Sharded => Verb::SUnsubscribe,
        }
    }

    pub fn mode(self) -> SubscriptionMode {
        match self {
            Verb::Subscribe | Verb::Unsubscribe => SubscriptionMode::Exact,
            Verb::PSubscribe | Verb::PUnsubscribe => SubscriptionMode::Pattern,
            Verb::SSubscribe | Verb::SUnsubscribe => SubscriptionMode::Sharded,
        }
    }

    pub fn is_subscribe(self) -> bool {
        matches!(self, Verb::Subscribe | Verb::PSubscribe | Verb::SSubscribe)
    }

    /// Wire name of the verb.
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Subscribe => "SUBSCRIBE",
            Verb::PSubscribe => "PSUBSCRIBE",
            Verb::SSubscribe => "SSUBSCRIBE",
            Verb::Unsubscribe => "UNSUBSCRIBE",
            Verb::PUnsubscribe => "PUNSUBSCRIBE",
            Verb::SUnsubscribe => "SUNSUBSCRIBE",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subscribe-family command batched over one mode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub verb: Verb,
    /// Channel names or patterns, sorted.
    pub names: Vec<String>,
}

impl Command {
    pub fn new(verb: Verb, names: Vec<String>) -> Self {
        Self { verb, names }
    }

    /// Keys addressed by this command.
    pub fn keys(&self) -> impl Iterator<Item = ChannelKey> + '_ {
        let mode = self.verb.mode();
        self.names.iter().map(move |n| ChannelKey::new(mode, n.clone()))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.verb)?;
        for name in &self.names {
            write!(f, " {}", name)?;
        }
        Ok(())
    }
}

/// Identifier of one physical connection. A reconnect yields a new id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
