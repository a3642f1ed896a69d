use dashmap::DashMap;
use serenity::model::id::GuildId;
use tokio_util::sync::CancellationToken;

/// The token of the playback attempt currently running in each guild.
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: DashMap<GuildId, CancellationToken>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel whatever token is installed and replace it with a fresh one.
    pub fn start_new(&self, guild_id: GuildId) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.tokens.insert(guild_id, token.clone()) {
            if !previous.is_cancelled() {
                tracing::debug!(guild = %guild_id, "superseding live playback token");
            }
            previous.cancel();
        }
        token
    }

    /// Returns true when a token was present.
    pub fn cancel(&self, guild_id: GuildId) -> bool {
        match self.tokens.get(&guild_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn clear(&self, guild_id: GuildId) {
        self.tokens.remove(&guild_id);
    }

    pub fn current(&self, guild_id: GuildId) -> Option<CancellationToken> {
        self.tokens.get(&guild_id).map(|t| t.clone())
    }
}
