use std::sync::Arc;

use crate::config::ServerConfig;
use crate::engine::hub::ChatHub;
use crate::util::nickname::{AdjectiveNameGenerator, NicknameGenerator};
use crate::util::sanitize::{BasicSanitizer, TextSanitizer};

use super::rate_limit::ApiRateLimiters;

/// Shared state handed to every axum handler.
pub struct AppState {
    pub hub: Arc<ChatHub>,
    pub config: ServerConfig,
    pub nicknames: Arc<dyn NicknameGenerator>,
    pub sanitizer: Arc<dyn TextSanitizer>,
    /// Shared with the rate-limit middleware; swept by a background task.
    pub rate_limiters: Arc<ApiRateLimiters>,
}

impl AppState {
    /// State with the default collaborators: adjective+name nicknames and the
    /// link/profanity sanitizer built from `config.chat.profanity_words`.
    /// Fails when the configured word list cannot be compiled into a matcher.
    pub fn new(hub: Arc<ChatHub>, config: ServerConfig) -> Result<Self, regex::Error> {
        let sanitizer = Arc::new(BasicSanitizer::new(&config.chat.profanity_words)?);
        Ok(Self {
            hub,
            config,
            nicknames: Arc::new(AdjectiveNameGenerator),
            sanitizer,
            rate_limiters: Arc::new(ApiRateLimiters::default()),
        })
    }
}
