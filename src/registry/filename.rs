//! Stream name to file path mapping

/// What the generated file name is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationType {
    Playback,
    Record,
}

/// Maps stream names onto storage paths
pub trait StreamFilenameGenerator: Send + Sync {
    fn generate_filename(
        &self,
        app: &str,
        name: &str,
        extension: Option<&str>,
        kind: GenerationType,
    ) -> String;
}

/// Puts every stream under `streams/`
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultStreamFilenameGenerator;

impl StreamFilenameGenerator for DefaultStreamFilenameGenerator {
    fn generate_filename(
        &self,
        _app: &str,
        name: &str,
        extension: Option<&str>,
        _kind: GenerationType,
    ) -> String {
        let mut path = format!("streams/{}", name);
        if let Some(ext) = extension.filter(|e| !e.is_empty()) {
            path.push_str(ext);
        }
        path
    }
}

const FLV_PREFIX: &str = "flv";
const FLV_EXTENSION: &str = ".flv";

/// Apply the `flv:` naming rule to a requested stream name
///
/// A bare name (no `:` and no `.`) is an FLV file; `flv:name` becomes
/// `name.flv`. Anything else is used as given.
pub fn prepare_filename(name: &str) -> String {
    let prefixed = if !name.contains(':') && !name.contains('.') {
        format!("{}:{}", FLV_PREFIX, name)
    } else {
        name.to_string()
    };

    match prefixed.strip_prefix("flv:") {
        Some(rest) if rest.ends_with(FLV_EXTENSION) => rest.to_string(),
        Some(rest) => format!("{}{}", rest, FLV_EXTENSION),
        None => prefixed,
    }
}
