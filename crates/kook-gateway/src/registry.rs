//! Caller-owned collection of running bots.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::bot::KookBot;
use crate::error::{GatewayError, Result};
use crate::pipeline::CancelMode;

/// Bots keyed by client id. Independent registries never share state.
#[derive(Default)]
pub struct BotRegistry {
    bots: RwLock<HashMap<String, Arc<KookBot>>>,
}

impl BotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bot. A second bot with the same client id is rejected, whatever
    /// its token.
    pub async fn register(&self, bot: KookBot) -> Result<Arc<KookBot>> {
        let mut bots = self.bots.write().await;
        let client_id = bot.client_id().to_owned();
        if bots.contains_key(&client_id) {
            return Err(GatewayError::AlreadyRegistered(client_id));
        }
        let bot = Arc::new(bot);
        bots.insert(client_id.clone(), Arc::clone(&bot));
        info!(client_id = %client_id, total = bots.len(), "bot registered");
        Ok(bot)
    }

    pub async fn get(&self, client_id: &str) -> Option<Arc<KookBot>> {
        self.bots.read().await.get(client_id).cloned()
    }

    /// Remove without closing; the caller decides what happens to the bot.
    pub async fn remove(&self, client_id: &str) -> Option<Arc<KookBot>> {
        self.bots.write().await.remove(client_id)
    }

    pub async fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.bots.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.bots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bots.read().await.is_empty()
    }

    /// Start every registered bot concurrently; returns the ones that failed.
    pub async fn start_all(&self) -> Vec<(String, GatewayError)> {
        let bots: Vec<Arc<KookBot>> = self.bots.read().await.values().cloned().collect();
        let results = join_all(bots.iter().map(|bot| bot.start())).await;
        collect_failures(&bots, results)
    }

    /// Close and remove every bot. Bots that were never started are simply
    /// dropped; other failures are returned.
    pub async fn close_all(&self, mode: CancelMode) -> Vec<(String, GatewayError)> {
        let bots: Vec<Arc<KookBot>> = self.bots.write().await.drain().map(|(_, bot)| bot).collect();
        let results = join_all(bots.iter().map(|bot| bot.close(mode))).await;
        collect_failures(&bots, results)
            .into_iter()
            .filter(|(_, e)| !matches!(e, GatewayError::NotStarted))
            .collect()
    }
}

fn collect_failures(bots: &[Arc<KookBot>], results: Vec<Result<()>>) -> Vec<(String, GatewayError)> {
    bots.iter()
        .zip(results)
        .filter_map(|(bot, result)| match result {
            Ok(()) => None,
            Err(e) => {
                warn!(client_id = %bot.client_id(), error = %e, "bot operation failed");
                Some((bot.client_id().to_owned(), e))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kook_common::Ticket;

    fn bot(client_id: &str, token: &str) -> KookBot {
        KookBot::builder(Ticket::bot(client_id, token)).build().unwrap()
    }

    #[tokio::test]
    async fn duplicate_client_id_is_rejected() {
        let registry = BotRegistry::new();
        registry.register(bot("a", "one")).await.unwrap();

        let err = registry.register(bot("a", "two")).await.unwrap_err();
        assert!(matches!(err, GatewayError::AlreadyRegistered(id) if id == "a"));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn lookup_and_removal() {
        let registry = BotRegistry::new();
        registry.register(bot("b", "t")).await.unwrap();
        registry.register(bot("a", "t")).await.unwrap();

        assert_eq!(registry.client_ids().await, ["a", "b"]);
        assert_eq!(registry.get("a").await.unwrap().client_id(), "a");
        assert!(registry.get("missing").await.is_none());

        assert!(registry.remove("a").await.is_some());
        assert!(registry.remove("a").await.is_none());
        assert_eq!(registry.client_ids().await, ["b"]);
    }

    #[tokio::test]
    async fn registries_are_independent() {
        let first = BotRegistry::new();
        let second = BotRegistry::new();
        first.register(bot("a", "t")).await.unwrap();
        second.register(bot("a", "t")).await.unwrap();
        assert_eq!(first.len().await, 1);
        assert_eq!(second.len().await, 1);
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let registry = BotRegistry::new();
        registry.register(bot("a", "t")).await.unwrap();
        registry.register(bot("b", "t")).await.unwrap();

        let failures = registry.close_all(CancelMode::Soft).await;
        assert!(failures.is_empty());
        assert!(registry.is_empty().await);
    }
}
