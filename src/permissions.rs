//! Discord permission bit tests over already fetched guilds. No I/O.

use crate::discord::PartialGuild;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    CreateInstantInvite,
    KickMembers,
    BanMembers,
    Administrator,
    ManageChannels,
    ManageGuild,
    AddReactions,
    ViewAuditLog,
    ViewChannel,
    SendMessages,
    ManageMessages,
    EmbedLinks,
    AttachFiles,
    ReadMessageHistory,
    MentionEveryone,
    ManageNicknames,
    ManageRoles,
    ManageWebhooks,
    ManageThreads,
    ModerateMembers,
}

const NAMES: &[(&str, Permission)] = &[
    ("CREATE_INSTANT_INVITE", Permission::CreateInstantInvite),
    ("KICK_MEMBERS", Permission::KickMembers),
    ("BAN_MEMBERS", Permission::BanMembers),
    ("ADMINISTRATOR", Permission::Administrator),
    ("MANAGE_CHANNELS", Permission::ManageChannels),
    ("MANAGE_GUILD", Permission::ManageGuild),
    ("ADD_REACTIONS", Permission::AddReactions),
    ("VIEW_AUDIT_LOG", Permission::ViewAuditLog),
    ("VIEW_CHANNEL", Permission::ViewChannel),
    ("SEND_MESSAGES", Permission::SendMessages),
    ("MANAGE_MESSAGES", Permission::ManageMessages),
    ("EMBED_LINKS", Permission::EmbedLinks),
    ("ATTACH_FILES", Permission::AttachFiles),
    ("READ_MESSAGE_HISTORY", Permission::ReadMessageHistory),
    ("MENTION_EVERYONE", Permission::MentionEveryone),
    ("MANAGE_NICKNAMES", Permission::ManageNicknames),
    ("MANAGE_ROLES", Permission::ManageRoles),
    ("MANAGE_WEBHOOKS", Permission::ManageWebhooks),
    ("MANAGE_THREADS", Permission::ManageThreads),
    ("MODERATE_MEMBERS", Permission::ModerateMembers),
];

impl Permission {
    pub fn bit(self) -> u64 {
        let shift = match self {
            Permission::CreateInstantInvite => 0,
            Permission::KickMembers => 1,
            Permission::BanMembers => 2,
            Permission::Administrator => 3,
            Permission::ManageChannels => 4,
            Permission::ManageGuild => 5,
            Permission::AddReactions => 6,
            Permission::ViewAuditLog => 7,
            Permission::ViewChannel => 10,
            Permission::SendMessages => 11,
            Permission::ManageMessages => 13,
            Permission::EmbedLinks => 14,
            Permission::AttachFiles => 15,
            Permission::ReadMessageHistory => 16,
            Permission::MentionEveryone => 17,
            Permission::ManageNicknames => 27,
            Permission::ManageRoles => 28,
            Permission::ManageWebhooks => 29,
            Permission::ManageThreads => 34,
            Permission::ModerateMembers => 40,
        };
        1 << shift
    }

    pub fn name(self) -> &'static str {
        NAMES
            .iter()
            .find(|(_, permission)| *permission == self)
            .map(|(name, _)| *name)
            .unwrap_or("UNKNOWN")
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPermission(pub String);

impl fmt::Display for UnknownPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown permission '{}'", self.0)
    }
}

impl std::error::Error for UnknownPermission {}

/// Accepts `MANAGE_GUILD`, `manage_guild` or `ManageGuild`.
impl FromStr for Permission {
    type Err = UnknownPermission;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_')
            .map(|c| c.to_ascii_uppercase())
            .collect();

        NAMES
            .iter()
            .find(|(name, _)| name.replace('_', "") == normalized)
            .map(|(_, permission)| *permission)
            .ok_or_else(|| UnknownPermission(s.to_string()))
    }
}

/// Owners hold every permission; everyone else needs the bit.
pub fn has_permission(guild: &PartialGuild, permission: Permission) -> bool {
    guild.owner || guild.permissions & permission.bit() != 0
}

pub fn filter_by_permission(guilds: &[PartialGuild], permission: Permission) -> Vec<PartialGuild> {
    guilds
        .iter()
        .filter(|guild| has_permission(guild, permission))
        .cloned()
        .collect()
}
