//! Stream name resolution
//!
//! Published streams are registered as broadcast scopes; recorded streams
//! are files. Play engines ask the [`ProviderService`] which of the two a
//! name refers to and subscribe to what it hands back.
//!
//! ```text
//!                      Arc<ProviderService>
//!                 ┌────────────────────────────┐
//!                 │ scopes: HashMap<StreamKey, │
//!                 │   BroadcastScope {         │
//!                 │     pipe: push-push,       │
//!                 │     codec_info,            │
//!                 │   }                        │
//!                 │ >                          │
//!                 │ file_factory ──► files     │
//!                 └─────────────┬──────────────┘
//!                               │
//!         ┌─────────────────────┼─────────────────────┐
//!         ▼                     ▼                     ▼
//!    [Publisher]           [Play engine]         [Play engine]
//!    live pipe push        live: push mode       VOD: pull pipe
//! ```

pub mod file;
pub mod filename;
pub mod key;
pub mod scope;
pub mod store;

pub use file::{
    FileConsumer, FileProvider, KeyframeMeta, MemoryFileStore, RecordMode, StreamableFile,
    StreamableFileFactory, TagReader, TagWriter,
};
pub use filename::{
    prepare_filename, DefaultStreamFilenameGenerator, GenerationType, StreamFilenameGenerator,
};
pub use key::StreamKey;
pub use scope::BroadcastScope;
pub use store::{InputType, ProviderInput, ProviderService};
