//! Capability contract for the collaborators around the scheduler.
//!
//! Display, audio and renderer backends all follow the same shape: a name, a
//! kind, `init`, `fini` and a feature query. The engine picks the first
//! candidate of a kind whose `init` succeeds.

use crate::error::{Result, RivenError};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    Display,
    Audio,
    Renderer,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Display => "display",
            BackendKind::Audio => "audio",
            BackendKind::Renderer => "renderer",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One implementation of a collaborator, e.g. a Vulkan renderer.
pub trait Backend: Send {
    fn name(&self) -> &'static str;

    fn kind(&self) -> BackendKind;

    /// Brings the backend up. A failure lets selection try the next candidate.
    fn init(&mut self) -> Result<()>;

    /// Tears the backend down. Only called after a successful `init`.
    fn fini(&mut self);

    /// Whether the backend supports `feature`.
    fn query(&self, feature: &str) -> bool;

    /// Like [`query`](Backend::query) but as a result.
    fn require(&self, feature: &str) -> Result<()> {
        if self.query(feature) {
            Ok(())
        } else {
            Err(RivenError::FeatureUnsupported(format!(
                "{} backend '{}' lacks '{feature}'",
                self.kind(),
                self.name()
            )))
        }
    }
}

/// Initializes candidates of `kind` in order and returns the first that works.
///
/// Candidates of other kinds are skipped without being initialized.
pub fn select_backend(
    kind: BackendKind,
    candidates: Vec<Box<dyn Backend>>,
) -> Result<Box<dyn Backend>> {
    for mut candidate in candidates {
        if candidate.kind() != kind {
            continue;
        }
        match candidate.init() {
            Ok(()) => {
                log::info!("{kind} backend: using '{}'", candidate.name());
                return Ok(candidate);
            }
            Err(err) => {
                log::warn!("{kind} backend '{}' failed to initialize: {err}", candidate.name());
            }
        }
    }
    Err(RivenError::NoFallback(kind.name()))
}

/// A backend that does nothing and supports nothing.
///
/// Useful for running the frame pipeline without a window or audio device.
#[derive(Debug)]
pub struct HeadlessBackend {
    kind: BackendKind,
    initialized: bool,
}

impl HeadlessBackend {
    pub fn new(kind: BackendKind) -> Self {
        HeadlessBackend {
            kind,
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

impl Backend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn init(&mut self) -> Result<()> {
        self.initialized = true;
        Ok(())
    }

    fn fini(&mut self) {
        self.initialized = false;
    }

    fn query(&self, _feature: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        name: &'static str,
        kind: BackendKind,
        works: bool,
        inits: Arc<AtomicUsize>,
    }

    impl Backend for Flaky {
        fn name(&self) -> &'static str {
            self.name
        }

        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn init(&mut self) -> Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            if self.works {
                Ok(())
            } else {
                Err(RivenError::FeatureUnsupported("no device".into()))
            }
        }

        fn fini(&mut self) {}

        fn query(&self, feature: &str) -> bool {
            feature == "vsync"
        }
    }

    fn flaky(name: &'static str, kind: BackendKind, works: bool, inits: &Arc<AtomicUsize>) -> Box<dyn Backend> {
        Box::new(Flaky {
            name,
            kind,
            works,
            inits: Arc::clone(inits),
        })
    }

    #[test]
    fn test_first_working_backend_wins() {
        let inits = Arc::new(AtomicUsize::new(0));
        let selected = select_backend(
            BackendKind::Renderer,
            vec![
                flaky("vulkan", BackendKind::Renderer, false, &inits),
                flaky("x11", BackendKind::Display, true, &inits),
                flaky("d3d12", BackendKind::Renderer, true, &inits),
                flaky("metal", BackendKind::Renderer, true, &inits),
            ],
        )
        .unwrap();
        assert_eq!(selected.name(), "d3d12");
        // The display candidate and the backend after the winner are never touched.
        assert_eq!(inits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_no_fallback() {
        let inits = Arc::new(AtomicUsize::new(0));
        let result = select_backend(
            BackendKind::Audio,
            vec![flaky("alsa", BackendKind::Audio, false, &inits)],
        );
        assert!(matches!(result, Err(RivenError::NoFallback("audio"))));
        assert!(matches!(
            select_backend(BackendKind::Audio, Vec::new()),
            Err(RivenError::NoFallback(_))
        ));
    }

    #[test]
    fn test_require_feature() {
        let inits = Arc::new(AtomicUsize::new(0));
        let backend = flaky("wayland", BackendKind::Display, true, &inits);
        assert!(backend.require("vsync").is_ok());
        assert!(matches!(
            backend.require("hdr"),
            Err(RivenError::FeatureUnsupported(_))
        ));
    }

    #[test]
    fn test_headless_backend() {
        let mut backend = HeadlessBackend::new(BackendKind::Display);
        backend.init().unwrap();
        assert!(backend.is_initialized());
        assert!(!backend.query("anything"));
        backend.fini();
        assert!(!backend.is_initialized());
    }
}
