//! Channel messages: the closed set of variants, their replication wire
//! format and their client-facing JSON rendering.
//!
//! Wire lines are newline-delimited UTF-8:
//!
//! ```text
//! SAY <channel> <ip> <user> "<displayName>" "<extra>" <text>}<unique>
//! LEAVE <channel> <ip> <user> "<displayName>" "<extra>" (timeout|explicit)
//! BAN <channel> <ip> <user> "<displayName>" "<extra>" <target> "<targetDisplayName>" "<targetExtra>" <until>}<unique>
//! ```
//!
//! JOIN is never replicated: each server infers joins from the traffic it
//! sees. Parsing assigns the *local* receive time — every channel keeps its
//! own total order, and sender timestamps are not comparable across hosts.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Value, json};

use crate::auth::Keys;

/// User or channel IDs: letters, digits and underscore.
pub const RE_USER_CHANNEL: &str = "[A-Za-z0-9_]+";
/// Display names: any normal character except the quote.
pub const RE_DISPLAY_NAME: &str = "[^\\x00-\\x1f\"]+";
/// Extra per-user data: like display names, but may be empty.
pub const RE_EXTRA: &str = "[^\\x00-\\x1f\"]*";
/// Message text: any normal characters.
pub const RE_TEXT: &str = "[^\\x00-\\x1f]+";
/// Dedup tokens: same alphabet as user IDs.
pub const RE_UNIQUE: &str = "[A-Za-z0-9_]+";

static WIRE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        "^([A-Z]+) ({RE_USER_CHANNEL}) ([0-9a-f:.]+) ({RE_USER_CHANNEL}) \
         \"({RE_DISPLAY_NAME})\" \"({RE_EXTRA})\"(.*)$"
    ))
    .expect("wire line regex")
});

static SAY_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^ (.*)\\}}({RE_UNIQUE})$")).expect("say suffix regex")
});

static BAN_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        "^ ({RE_USER_CHANNEL}) \"({RE_DISPLAY_NAME})\" \"({RE_EXTRA})\" \
         ([0-9]{{1,18}})\\}}({RE_UNIQUE})$"
    ))
    .expect("ban suffix regex")
});

/// Identity of a user as it appears in messages and presence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Name {
    pub user: String,
    /// One-way salted hash of `user`, substituted for untrusted recipients.
    pub user_masked: String,
    pub display_name: String,
    pub extra: String,
}

impl Name {
    pub fn new(keys: &Keys, user: &str, display_name: &str, extra: &str) -> Self {
        Self {
            user: user.to_string(),
            user_masked: keys.masked_user(user),
            display_name: display_name.to_string(),
            extra: extra.to_string(),
        }
    }

    /// JSON object fragment used in name listings.
    pub fn client_json(&self, trusted: bool) -> Value {
        json!({
            "user": if trusted { &self.user } else { &self.user_masked },
            "displayName": self.display_name,
            "extra": self.extra,
        })
    }
}

/// Variant-specific payload of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Say {
        text: String,
        /// Per-user dedup token.
        unique: String,
    },
    /// Synthesized when presence is first observed; never replicated.
    Join,
    Leave {
        /// True if the server inferred the leave from inactivity.
        timeout: bool,
    },
    Ban {
        target: Name,
        /// Ban expiry, milliseconds since epoch.
        until: i64,
        unique: String,
    },
}

/// A single message on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Milliseconds since epoch, adjusted for uniqueness within the channel.
    pub time: i64,
    pub channel: String,
    pub ip: String,
    pub from: Name,
    pub body: Body,
}

/// Error from parsing a replication wire line.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("line not valid: {0}")]
    BadLine(String),
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("bad {kind} suffix: {line}")]
    BadSuffix { kind: &'static str, line: String },
}

impl Message {
    /// Wire command tag, also used as the `type` field in client JSON.
    pub fn type_tag(&self) -> &'static str {
        match self.body {
            Body::Say { .. } => "SAY",
            Body::Join => "JOIN",
            Body::Leave { .. } => "LEAVE",
            Body::Ban { .. } => "BAN",
        }
    }

    /// Dedup key (`user:unique`) for variants that carry a unique token.
    pub fn unique_key(&self) -> Option<String> {
        match &self.body {
            Body::Say { unique, .. } | Body::Ban { unique, .. } => {
                Some(format!("{}:{unique}", self.from.user))
            }
            _ => None,
        }
    }

    /// Serialize for replication to peers. `None` for variants that are
    /// never sent on the wire.
    pub fn wire_format(&self) -> Option<String> {
        let prefix = format!(
            "{} {} {} {} \"{}\" \"{}\"",
            self.type_tag(),
            self.channel,
            self.ip,
            self.from.user,
            self.from.display_name,
            self.from.extra,
        );
        match &self.body {
            Body::Say { text, unique } => Some(format!("{prefix} {text}}}{unique}")),
            Body::Join => None,
            Body::Leave { timeout } => Some(format!(
                "{prefix} {}",
                if *timeout { "timeout" } else { "explicit" }
            )),
            Body::Ban {
                target,
                until,
                unique,
            } => Some(format!(
                "{prefix} {} \"{}\" \"{}\" {until}}}{unique}",
                target.user, target.display_name, target.extra,
            )),
        }
    }

    /// Parse a replication line received from a peer. `time` is the local
    /// receive time.
    pub fn parse_wire(line: &str, time: i64, keys: &Keys) -> Result<Self, ParseError> {
        let caps = WIRE_LINE
            .captures(line)
            .ok_or_else(|| ParseError::BadLine(line.to_string()))?;
        let command = &caps[1];
        let from = Name::new(keys, &caps[4], &caps[5], &caps[6]);
        let (channel, ip) = (caps[2].to_string(), caps[3].to_string());
        let suffix = &caps[7];

        let body = match command {
            "SAY" => {
                let caps = SAY_SUFFIX
                    .captures(suffix)
                    .ok_or_else(|| ParseError::BadSuffix {
                        kind: "SAY",
                        line: line.to_string(),
                    })?;
                Body::Say {
                    text: caps[1].to_string(),
                    unique: caps[2].to_string(),
                }
            }
            "LEAVE" => match suffix {
                " timeout" => Body::Leave { timeout: true },
                " explicit" => Body::Leave { timeout: false },
                _ => {
                    return Err(ParseError::BadSuffix {
                        kind: "LEAVE",
                        line: line.to_string(),
                    });
                }
            },
            "BAN" => {
                let caps = BAN_SUFFIX
                    .captures(suffix)
                    .ok_or_else(|| ParseError::BadSuffix {
                        kind: "BAN",
                        line: line.to_string(),
                    })?;
                Body::Ban {
                    target: Name::new(keys, &caps[1], &caps[2], &caps[3]),
                    until: caps[4].parse().map_err(|_| ParseError::BadSuffix {
                        kind: "BAN",
                        line: line.to_string(),
                    })?,
                    unique: caps[5].to_string(),
                }
            }
            other => return Err(ParseError::UnknownCommand(other.to_string())),
        };

        Ok(Message {
            time,
            channel,
            ip,
            from,
            body,
        })
    }

    /// Client-facing JSON object. The real user ID is substituted with the
    /// masked one unless the requester is trusted.
    pub fn client_json(&self, trusted: bool) -> Value {
        let mut obj = json!({
            "type": self.type_tag(),
            "time": self.time,
            "user": if trusted { &self.from.user } else { &self.from.user_masked },
            "displayName": self.from.display_name,
            "extra": self.from.extra,
        });
        let map = obj.as_object_mut().expect("object");
        match &self.body {
            Body::Say { text, unique } => {
                map.insert("text".into(), json!(text));
                map.insert("unique".into(), json!(unique));
            }
            Body::Join => {}
            Body::Leave { timeout } => {
                map.insert("timeout".into(), json!(timeout));
            }
            Body::Ban { target, until, .. } => {
                map.insert(
                    "ban".into(),
                    json!(if trusted { &target.user } else { &target.user_masked }),
                );
                map.insert("banDisplayName".into(), json!(target.display_name));
                map.insert("banExtra".into(), json!(target.extra));
                map.insert("until".into(), json!(until));
            }
        }
        obj
    }

    /// One-line transcript form for chat logs. The channel is implied by
    /// the log context and the time is added by the logger.
    pub fn log_format(&self) -> String {
        let prefix = format!(
            "{} {} {} \"{}\" \"{}\"",
            self.type_tag(),
            self.ip,
            self.from.user,
            self.from.display_name,
            self.from.extra,
        );
        match &self.body {
            Body::Say { text, .. } => format!("{prefix} {text}"),
            Body::Join => prefix,
            Body::Leave { timeout } => format!(
                "{prefix} {}",
                if *timeout { "timeout" } else { "explicit" }
            ),
            Body::Ban { target, until, .. } => {
                format!("{prefix} {} until {until}", target.user)
            }
        }
    }
}
