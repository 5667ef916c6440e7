use crate::channels::log::LogSender;
use crate::channels::webhook::WebhookSender;
use crate::error::{NotifyError, Result};
use crate::Sender;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// One `[[senders]]` entry of the configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SenderConfig {
    /// Implementation name: `"webhook"` or `"log"`.
    #[serde(rename = "type")]
    pub sender_type: String,
    /// Contact type served by this sender. Defaults to the sender type.
    #[serde(default)]
    pub contact_type: Option<String>,
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

/// Creates an uninitialized built-in sender by implementation name.
pub fn builtin_sender(sender_type: &str) -> Option<Box<dyn Sender>> {
    match sender_type {
        "webhook" => Some(Box::new(WebhookSender::new())),
        "log" => Some(Box::new(LogSender)),
        _ => None,
    }
}

/// Senders keyed by the contact type they deliver to.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tripwire_notify::channels::log::LogSender;
/// use tripwire_notify::registry::SenderRegistry;
///
/// let mut registry = SenderRegistry::new();
/// registry.register("log", Arc::new(LogSender));
/// assert!(registry.has_sender("log"));
/// assert!(!registry.has_sender("sms"));
/// ```
#[derive(Default)]
pub struct SenderRegistry {
    senders: HashMap<String, Arc<dyn Sender>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds and initializes every configured sender.
    pub async fn from_config(configs: &[SenderConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            let mut sender = builtin_sender(&config.sender_type)
                .ok_or_else(|| NotifyError::UnknownSenderType(config.sender_type.clone()))?;
            sender
                .init(&config.settings)
                .await
                .map_err(|source| NotifyError::SenderInit {
                    sender: config.sender_type.clone(),
                    source,
                })?;
            let contact_type = config
                .contact_type
                .clone()
                .unwrap_or_else(|| config.sender_type.clone());
            info!(sender = %config.sender_type, contact_type = %contact_type, "Sender registered");
            registry.register(contact_type, Arc::from(sender));
        }
        Ok(registry)
    }

    pub fn register(&mut self, contact_type: impl Into<String>, sender: Arc<dyn Sender>) {
        self.senders.insert(contact_type.into(), sender);
    }

    pub fn get(&self, contact_type: &str) -> Option<Arc<dyn Sender>> {
        self.senders.get(contact_type).cloned()
    }

    pub fn has_sender(&self, contact_type: &str) -> bool {
        self.senders.contains_key(contact_type)
    }

    pub fn contact_types(&self) -> Vec<&str> {
        self.senders.keys().map(|s| s.as_str()).collect()
    }
}
