//! Named continuations resumed when an acknowledgement arrives.
//!
//! A sender that wants to be called back stores a callback *name* and a
//! JSON context with the outbound message. The name survives restarts and
//! travels through the replicated log; the function it refers to is looked
//! up here when the ACK comes in. Each handler declares its context type and
//! gets the stored context already deserialized into it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::messaging::envelope::Message;
use crate::messaging::layer::MessagingError;

/// A continuation run with the stored context and the ACK.
#[async_trait]
pub trait AckCallback: Send + Sync {
    async fn call(&self, context: Value, ack: Message) -> Result<(), MessagingError>;
}

/// Adapts a typed async function to [`AckCallback`].
pub struct TypedCallback<C, F> {
    handler: F,
    _context: PhantomData<fn() -> C>,
}

impl<C, F> TypedCallback<C, F> {
    pub const fn new(handler: F) -> Self {
        Self {
            handler,
            _context: PhantomData,
        }
    }
}

#[async_trait]
impl<C, F, Fut> AckCallback for TypedCallback<C, F>
where
    C: DeserializeOwned + Send + 'static,
    F: Fn(C, Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), MessagingError>> + Send,
{
    async fn call(&self, context: Value, ack: Message) -> Result<(), MessagingError> {
        let context: C = serde_json::from_value(context)?;
        (self.handler)(context, ack).await
    }
}

/// Stable callback name to handler.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: RwLock<HashMap<String, Arc<dyn AckCallback>>>,
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .callbacks
            .read()
            .map(|callbacks| callbacks.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("CallbackRegistry").field("names", &names).finish()
    }
}

impl CallbackRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any earlier handler.
    pub fn register<C, F, Fut>(&self, name: &str, handler: F) -> Result<(), MessagingError>
    where
        C: DeserializeOwned + Send + 'static,
        F: Fn(C, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MessagingError>> + Send + 'static,
    {
        self.register_callback(name, Arc::new(TypedCallback::new(handler)))
    }

    pub fn register_callback(&self, name: &str, callback: Arc<dyn AckCallback>) -> Result<(), MessagingError> {
        self.callbacks
            .write()
            .map_err(|_| MessagingError::LockPoisoned)?
            .insert(name.to_owned(), callback);
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.callbacks
            .read()
            .is_ok_and(|callbacks| callbacks.contains_key(name))
    }

    /// Run the callback registered as `name`.
    pub async fn invoke(&self, name: &str, context: Value, ack: Message) -> Result<(), MessagingError> {
        let callback = self
            .callbacks
            .read()
            .map_err(|_| MessagingError::LockPoisoned)?
            .get(name)
            .cloned()
            .ok_or_else(|| MessagingError::UnknownCallback(name.to_owned()))?;
        callback.call(context, ack).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::envelope::PING_NODE;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Debug, Deserialize)]
    struct Progress {
        step: u32,
    }

    #[tokio::test]
    async fn test_invoke_deserializes_context() {
        let registry = CallbackRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry
            .register("record_step", move |progress: Progress, ack: Message| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().expect("lock").push((progress.step, ack.data));
                    Ok(())
                }
            })
            .expect("register");

        let command = Message::command(PING_NODE, json!({}), "mem://a");
        let ack = command.ack(json!({"pong": true}), "mem://b");
        registry
            .invoke("record_step", json!({"step": 3}), ack)
            .await
            .expect("invoke");

        assert!(registry.contains("record_step"));
        assert_eq!(seen.lock().expect("lock").as_slice(), &[(3, json!({"pong": true}))]);
    }

    #[tokio::test]
    async fn test_unknown_callback_and_bad_context() {
        let registry = CallbackRegistry::new();
        registry
            .register("typed", |_: Progress, _: Message| async { Ok(()) })
            .expect("register");
        let ack = Message::command(PING_NODE, json!({}), "mem://a").ack(json!(null), "mem://b");

        assert!(matches!(
            registry.invoke("missing", json!({}), ack.clone()).await,
            Err(MessagingError::UnknownCallback(name)) if name == "missing"
        ));
        assert!(matches!(
            registry.invoke("typed", json!({"step": "x"}), ack).await,
            Err(MessagingError::Codec(_))
        ));
    }
}
