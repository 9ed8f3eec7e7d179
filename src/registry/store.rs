//! Provider service: resolves stream names to live or VOD inputs
//!
//! Live streams are broadcast scopes registered by name; VOD streams are
//! files found through the filename generator and the file factory. Live
//! always takes precedence over a file of the same name.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::messaging::{Pipe, Provider};

use super::file::{FileProvider, StreamableFile, StreamableFileFactory};
use super::filename::{prepare_filename, GenerationType, StreamFilenameGenerator};
use super::key::StreamKey;
use super::scope::BroadcastScope;

/// Kind of input available under a name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    NotFound,
    Live,
    Vod,
}

/// Resolved input a play engine subscribes to
#[derive(Debug, Clone)]
pub enum ProviderInput {
    Live(Arc<BroadcastScope>),
    /// Pull pipe with a file provider subscribed
    Vod(Arc<Pipe>),
}

/// Name resolution and broadcast registration
pub struct ProviderService {
    /// Broadcast scopes by app and name
    scopes: RwLock<HashMap<StreamKey, Arc<BroadcastScope>>>,
    file_factory: Arc<dyn StreamableFileFactory>,
    filename_generator: Arc<dyn StreamFilenameGenerator>,
    weak_self: Weak<ProviderService>,
}

impl ProviderService {
    pub fn new(
        file_factory: Arc<dyn StreamableFileFactory>,
        filename_generator: Arc<dyn StreamFilenameGenerator>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            scopes: RwLock::new(HashMap::new()),
            file_factory,
            filename_generator,
            weak_self: weak_self.clone(),
        })
    }

    pub fn file_factory(&self) -> &Arc<dyn StreamableFileFactory> {
        &self.file_factory
    }

    pub fn filename_generator(&self) -> &Arc<dyn StreamFilenameGenerator> {
        &self.filename_generator
    }

    pub fn lookup_provider_input_type(&self, app: &str, name: &str) -> InputType {
        if self.scopes.read().contains_key(&StreamKey::new(app, name)) {
            InputType::Live
        } else if self.vod_provider_file(app, name).is_some() {
            InputType::Vod
        } else {
            InputType::NotFound
        }
    }

    /// Live input if registered, otherwise VOD
    pub fn provider_input(&self, app: &str, name: &str) -> Option<ProviderInput> {
        match self.live_provider_input(app, name, false) {
            Some(scope) => Some(ProviderInput::Live(scope)),
            None => self.vod_provider_input(app, name).map(ProviderInput::Vod),
        }
    }

    /// Broadcast scope for a name, optionally creating an empty one for a
    /// subscriber to wait on
    pub fn live_provider_input(
        &self,
        app: &str,
        name: &str,
        create: bool,
    ) -> Option<Arc<BroadcastScope>> {
        let key = StreamKey::new(app, name);
        if let Some(scope) = self.scopes.read().get(&key) {
            return Some(Arc::clone(scope));
        }
        if !create {
            return None;
        }
        let mut scopes = self.scopes.write();
        // Another thread may have created it in between
        let scope = scopes
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::debug!(stream = %key, "Broadcast scope created for waiting subscriber");
                BroadcastScope::new(key, self.weak_self.clone())
            })
            .clone();
        Some(scope)
    }

    /// Fresh pull pipe reading the named file
    pub fn vod_provider_input(&self, app: &str, name: &str) -> Option<Arc<Pipe>> {
        let (path, file) = self.vod_provider_file(app, name)?;
        let pipe = Arc::new(Pipe::pull_pull());
        pipe.subscribe_provider(FileProvider::new(path, file));
        Some(pipe)
    }

    /// Storage path and file for a playback name
    pub fn vod_provider_file(
        &self,
        app: &str,
        name: &str,
    ) -> Option<(String, Arc<dyn StreamableFile>)> {
        let filename = prepare_filename(name);
        let path =
            self.filename_generator
                .generate_filename(app, &filename, None, GenerationType::Playback);
        match self.file_factory.open(&path) {
            Some(file) => Some((path, file)),
            None => {
                tracing::debug!(app = app, name = name, path = %path, "No VOD file");
                None
            }
        }
    }

    /// Storage path a recording of `name` is written to
    pub fn record_path(&self, app: &str, name: &str) -> String {
        self.filename_generator
            .generate_filename(app, name, Some(".flv"), GenerationType::Record)
    }

    /// Attach a publisher's provider to the named broadcast scope
    pub fn register_broadcast_stream(
        &self,
        app: &str,
        name: &str,
        provider: Arc<dyn Provider>,
    ) -> bool {
        let key = StreamKey::new(app, name);
        // A scope may empty out between lookup and subscription; retry once
        // with a fresh one
        for _ in 0..2 {
            let scope = {
                let mut scopes = self.scopes.write();
                let stale = scopes.get(&key).map(|s| s.has_removed()).unwrap_or(false);
                if stale {
                    scopes.remove(&key);
                }
                scopes
                    .entry(key.clone())
                    .or_insert_with(|| BroadcastScope::new(key.clone(), self.weak_self.clone()))
                    .clone()
            };
            if scope.subscribe_provider(Arc::clone(&provider)) {
                tracing::info!(stream = %key, "Broadcast stream registered");
                return true;
            }
            if !scope.has_removed() {
                // Same provider subscribed twice
                return false;
            }
        }
        false
    }

    pub fn unregister_broadcast_stream(&self, app: &str, name: &str) -> bool {
        let key = StreamKey::new(app, name);
        let removed = self.scopes.write().remove(&key).is_some();
        if removed {
            tracing::info!(stream = %key, "Broadcast stream unregistered");
        }
        removed
    }

    /// Names of the live streams registered in an application
    pub fn broadcast_stream_names(&self, app: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .scopes
            .read()
            .keys()
            .filter(|k| k.app == app)
            .map(|k| k.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn scope_count(&self) -> usize {
        self.scopes.read().len()
    }

    /// Drop a scope that emptied, unless a newer one took its name
    pub(crate) fn remove_scope(&self, scope: &BroadcastScope) {
        let mut scopes = self.scopes.write();
        let same = scopes
            .get(scope.key())
            .map(|s| std::ptr::eq(Arc::as_ptr(s), scope))
            .unwrap_or(false);
        if same {
            scopes.remove(scope.key());
            tracing::info!(stream = %scope.key(), "Broadcast stream unregistered");
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::error::Result;
    use crate::media::FlvTag;
    use crate::messaging::{
        Consumer, EndpointId, MessageComponent, PipeMessage, RtmpEvent,
    };
    use crate::registry::file::MemoryFileStore;
    use crate::registry::filename::DefaultStreamFilenameGenerator;

    struct Endpoint(EndpointId);

    impl Endpoint {
        fn new() -> Arc<Self> {
            Arc::new(Self(EndpointId::next()))
        }
    }

    impl MessageComponent for Endpoint {
        fn endpoint_id(&self) -> EndpointId {
            self.0
        }
    }

    impl Provider for Endpoint {}

    impl Consumer for Endpoint {
        fn push_message(&self, _pipe: &Pipe, _message: &PipeMessage) -> Result<()> {
            Ok(())
        }
    }

    fn service() -> (Arc<MemoryFileStore>, Arc<ProviderService>) {
        let store = MemoryFileStore::new();
        let service = ProviderService::new(store.clone(), Arc::new(DefaultStreamFilenameGenerator));
        (store, service)
    }

    #[test]
    fn test_lookup_precedence() {
        let (store, service) = service();
        assert_eq!(service.lookup_provider_input_type("live", "clip"), InputType::NotFound);

        store.insert("streams/clip.flv", vec![FlvTag::audio(0, Bytes::new())]);
        assert_eq!(service.lookup_provider_input_type("live", "clip"), InputType::Vod);

        let publisher = Endpoint::new();
        assert!(service.register_broadcast_stream("live", "clip", publisher));
        assert_eq!(service.lookup_provider_input_type("live", "clip"), InputType::Live);
        assert!(matches!(service.provider_input("live", "clip"), Some(ProviderInput::Live(_))));

        // Other applications do not see it
        assert_eq!(service.lookup_provider_input_type("other", "clip"), InputType::Vod);
    }

    #[test]
    fn test_vod_input_reads_file() {
        let (store, service) = service();
        store.insert("streams/clip.flv", vec![FlvTag::video(40, Bytes::from_static(&[0x17, 0x01]))]);

        let pipe = service.vod_provider_input("live", "clip.flv").unwrap();
        let event: RtmpEvent = pipe.pull_message().unwrap().unwrap();
        assert_eq!(event.timestamp, 40);
        assert!(service.vod_provider_input("live", "missing").is_none());
    }

    #[test]
    fn test_scope_removed_when_last_component_leaves() {
        let (_store, service) = service();
        let publisher = Endpoint::new();
        let subscriber = Endpoint::new();

        assert!(service.register_broadcast_stream("live", "cam1", publisher.clone()));
        let scope = service.live_provider_input("live", "cam1", false).unwrap();
        assert!(scope.subscribe_consumer(subscriber.clone()));

        scope.unsubscribe_provider(publisher.0);
        assert!(!scope.has_removed());
        assert_eq!(service.broadcast_stream_names("live"), vec!["cam1".to_string()]);

        scope.unsubscribe_consumer(subscriber.0);
        assert!(scope.has_removed());
        assert_eq!(service.scope_count(), 0);

        // A removed scope refuses new endpoints
        assert!(!scope.subscribe_consumer(Endpoint::new()));
    }

    #[test]
    fn test_register_replaces_removed_scope() {
        let (_store, service) = service();
        let first = Endpoint::new();
        assert!(service.register_broadcast_stream("live", "cam1", first.clone()));
        let old = service.live_provider_input("live", "cam1", false).unwrap();
        old.unsubscribe_provider(first.0);
        assert!(old.has_removed());

        assert!(service.register_broadcast_stream("live", "cam1", Endpoint::new()));
        let new = service.live_provider_input("live", "cam1", false).unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(new.provider_count(), 1);
    }

    #[test]
    fn test_waiting_subscriber_scope() {
        let (_store, service) = service();
        let waiting = service.live_provider_input("live", "later", true).unwrap();
        assert!(waiting.subscribe_consumer(Endpoint::new()));

        assert!(service.register_broadcast_stream("live", "later", Endpoint::new()));
        let scope = service.live_provider_input("live", "later", false).unwrap();
        assert!(Arc::ptr_eq(&waiting, &scope));
        assert_eq!(scope.consumer_count(), 1);
        assert_eq!(scope.provider_count(), 1);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let (_store, service) = service();
        service.register_broadcast_stream("live", "cam1", Endpoint::new());
        assert!(service.unregister_broadcast_stream("live", "cam1"));
        assert!(!service.unregister_broadcast_stream("live", "cam1"));
    }
}
